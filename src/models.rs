use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// One row of the ingestion contract, as CSV import, Telegram extraction and
/// manual entry all produce it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CandidateInput {
    pub lookup_key: String,
    #[serde(default)]
    pub key_type: Option<KeyType>,
    pub wholesale_cost: f64,
    #[serde(default)]
    pub supplier_id: Option<String>,
    #[serde(default)]
    pub moq: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateProduct {
    pub owner_id: String,
    pub lookup_key: String,
    pub key_type: KeyType,
    pub wholesale_cost: f64,
    pub supplier_id: Option<String>,
    pub moq: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Asin,
    Upc,
}

impl KeyType {
    /// ASINs are 10 alphanumerics, UPC/EAN codes are 12 or 13 digits.
    pub fn detect(key: &str) -> Option<Self> {
        let digits = key.chars().all(|ch| ch.is_ascii_digit());
        if digits && matches!(key.len(), 12 | 13) {
            return Some(KeyType::Upc);
        }
        if key.len() == 10 && key.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Some(KeyType::Asin);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Asin => "asin",
            KeyType::Upc => "upc",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Marketplace {
    #[default]
    Us,
    Uk,
    De,
    Ca,
}

impl Marketplace {
    pub fn code(&self) -> &'static str {
        match self {
            Marketplace::Us => "US",
            Marketplace::Uk => "UK",
            Marketplace::De => "DE",
            Marketplace::Ca => "CA",
        }
    }

    pub fn from_code(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "US" => Some(Marketplace::Us),
            "UK" | "GB" => Some(Marketplace::Uk),
            "DE" => Some(Marketplace::De),
            "CA" => Some(Marketplace::Ca),
            _ => None,
        }
    }

    pub fn keepa_domain(&self) -> u8 {
        match self {
            Marketplace::Us => 1,
            Marketplace::Uk => 2,
            Marketplace::De => 3,
            Marketplace::Ca => 6,
        }
    }

    pub fn spapi_marketplace_id(&self) -> &'static str {
        match self {
            Marketplace::Us => "ATVPDKIKX0DER",
            Marketplace::Uk => "A1F83G8C2ARO7P",
            Marketplace::De => "A1PA6795UKMFR9",
            Marketplace::Ca => "A2EUQ1WTGCTBG2",
        }
    }

    pub fn currency(&self) -> &'static str {
        match self {
            Marketplace::Us => "USD",
            Marketplace::Uk => "GBP",
            Marketplace::De => "EUR",
            Marketplace::Ca => "CAD",
        }
    }
}

/// Which provider and stage produced the price used for scoring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Stage2Provider,
    Stage1Fallback,
    /// Stage-1 reject scored on its rough price.
    Stage1Estimate,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageReached {
    Stage1,
    Stage2,
}

impl StageReached {
    pub fn as_u8(&self) -> u8 {
        match self {
            StageReached::Stage1 => 1,
            StageReached::Stage2 => 2,
        }
    }
}

impl Serialize for StageReached {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for StageReached {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(StageReached::Stage1),
            2 => Ok(StageReached::Stage2),
            other => Err(serde::de::Error::custom(format!(
                "stage_reached must be 1 or 2, got {other}"
            ))),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentResult {
    pub lookup_key: String,
    pub asin: Option<String>,
    pub title: Option<String>,
    pub brand: Option<String>,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub sell_price: Option<f64>,
    pub price_source: PriceSource,
    pub fees_total: Option<f64>,
    pub fees_referral: Option<f64>,
    pub fees_fba: Option<f64>,
    pub seller_count: Option<u32>,
    pub fba_seller_count: Option<u32>,
    pub amazon_sells: Option<bool>,
    pub bsr: Option<u64>,
    pub stage_reached: StageReached,
    pub error: Option<String>,
}

impl EnrichmentResult {
    pub fn empty(lookup_key: &str, stage_reached: StageReached) -> Self {
        Self {
            lookup_key: lookup_key.to_string(),
            asin: None,
            title: None,
            brand: None,
            image_url: None,
            category: None,
            sell_price: None,
            price_source: PriceSource::Unknown,
            fees_total: None,
            fees_referral: None,
            fees_fba: None,
            seller_count: None,
            fba_seller_count: None,
            amazon_sells: None,
            bsr: None,
            stage_reached,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProfitabilityScore {
    pub net_profit: Option<f64>,
    pub roi: Option<f64>,
    pub margin: Option<f64>,
    pub meets_threshold: bool,
    pub grade: Option<Grade>,
}

impl ProfitabilityScore {
    pub fn null() -> Self {
        Self {
            net_profit: None,
            roi: None,
            margin: None,
            meets_threshold: false,
            grade: None,
        }
    }
}

/// The persisted row: one per `(owner_id, lookup_key, supplier_id)`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRecord {
    pub owner_id: String,
    /// Empty when the candidate has no supplier, so the upsert key never
    /// contains a NULL.
    pub supplier_id: String,
    pub key_type: KeyType,
    pub wholesale_cost: f64,
    pub moq: u32,
    pub job_id: Uuid,
    pub idempotency_key: String,
    pub analyzed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: EnrichmentResult,
    #[serde(flatten)]
    pub score: ProfitabilityScore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisRequest {
    pub items: Vec<CandidateInput>,
    #[serde(default)]
    pub min_roi_percent: Option<f64>,
    #[serde(default)]
    pub marketplace: Option<Marketplace>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
