use super::config::{KEEPA_API_KEY, KEEPA_ROOT};
use super::{
    BatchResponse, CatalogData, FeeBreakdown, FeeRequest, KeyError, Provider, ProviderClient,
    ProviderError, split_by_key_type,
};
use crate::http::build_client;
use crate::models::{KeyType, Marketplace};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;
use urlencoding::encode;

const IDX_AMAZON: usize = 0;
const IDX_NEW: usize = 1;
const IDX_SALES_RANK: usize = 3;
const IDX_COUNT_NEW: usize = 11;
const IDX_BUY_BOX: usize = 18;

/// Keepa product API. Prices come back in cents, `-1` meaning "no data".
pub struct KeepaClient {
    http: Client,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductResponse {
    #[serde(default)]
    products: Vec<KeepaProduct>,
    #[serde(default)]
    tokens_left: Option<i64>,
    #[serde(default)]
    error: Option<KeepaErrorBody>,
}

#[derive(Debug, Deserialize)]
struct KeepaErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeepaProduct {
    asin: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default, rename = "imagesCSV")]
    images_csv: Option<String>,
    #[serde(default)]
    category_tree: Option<Vec<KeepaCategory>>,
    #[serde(default)]
    referral_fee_percentage: Option<f64>,
    #[serde(default)]
    fba_fees: Option<KeepaFbaFees>,
    #[serde(default)]
    upc_list: Option<Vec<String>>,
    #[serde(default)]
    ean_list: Option<Vec<String>>,
    #[serde(default)]
    stats: Option<KeepaStats>,
}

#[derive(Debug, Deserialize)]
struct KeepaCategory {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeepaFbaFees {
    #[serde(default)]
    pick_and_pack_fee: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeepaStats {
    #[serde(default)]
    current: Vec<Option<i64>>,
    #[serde(default)]
    buy_box_price: Option<i64>,
    #[serde(default, rename = "offerCountFBA")]
    offer_count_fba: Option<i64>,
}

impl KeepaClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: build_client(),
            api_key,
        }
    }

    pub fn from_env() -> Option<Self> {
        super::config::keepa_configured().then(|| Self::new(KEEPA_API_KEY.clone()))
    }

    async fn fetch_products(
        &self,
        param: &str,
        keys: &[String],
        marketplace: Marketplace,
    ) -> Result<Vec<KeepaProduct>, ProviderError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let joined = keys
            .iter()
            .map(|key| encode(key).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "{}/product?key={}&domain={}&{param}={joined}&stats=1",
            *KEEPA_ROOT,
            encode(&self.api_key),
            marketplace.keepa_domain(),
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| request_error(Provider::Keepa, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                Provider::Keepa,
                status.as_u16(),
                body.chars().take(200).collect::<String>(),
            ));
        }

        let payload: ProductResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Deserialize {
                provider: Provider::Keepa,
                message: err.to_string(),
            })?;
        if let Some(error) = payload.error {
            return Err(ProviderError::Request {
                provider: Provider::Keepa,
                message: error.message.unwrap_or_else(|| "keepa error".into()),
            });
        }
        if let Some(tokens) = payload.tokens_left.filter(|tokens| *tokens < 0) {
            warn!(
                target = "sourcing.provider",
                provider = "keepa",
                tokens_left = tokens,
                "keepa_token_deficit"
            );
        }
        Ok(payload.products)
    }

    /// Resolves every requested key (ASIN or UPC/EAN) to its product.
    /// The adapter sends ASINs and codes in separate calls, so only one of the
    /// two lookups below goes out per call.
    async fn products_by_key(
        &self,
        keys: &[String],
        marketplace: Marketplace,
    ) -> Result<Vec<(String, KeepaProduct)>, ProviderError> {
        let (codes, asins): (Vec<String>, Vec<String>) = keys
            .iter()
            .cloned()
            .partition(|key| KeyType::detect(key) == Some(KeyType::Upc));

        let mut matched = Vec::new();
        for product in self.fetch_products("asin", &asins, marketplace).await? {
            if let Some(key) = asins.iter().find(|key| key.eq_ignore_ascii_case(&product.asin)) {
                matched.push((key.clone(), product));
            }
        }
        for product in self.fetch_products("code", &codes, marketplace).await? {
            let owner = codes.iter().find(|code| {
                product
                    .upc_list
                    .iter()
                    .chain(product.ean_list.iter())
                    .flatten()
                    .any(|listed| listed.trim_start_matches('0') == code.trim_start_matches('0'))
            });
            if let Some(code) = owner
                && !matched.iter().any(|(key, _)| key == code)
            {
                matched.push((code.clone(), product));
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl ProviderClient for KeepaClient {
    fn provider(&self) -> Provider {
        Provider::Keepa
    }

    /// `asin=` and `code=` lookups are separate requests.
    fn request_groups(&self, keys: &[String]) -> Vec<Vec<String>> {
        split_by_key_type(keys)
    }

    async fn catalog(
        &self,
        keys: &[String],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<CatalogData>, ProviderError> {
        let mut response = BatchResponse::default();
        for (key, product) in self.products_by_key(keys, marketplace).await? {
            response.items.insert(key, catalog_from_product(&product));
        }
        Ok(response)
    }

    async fn fees(
        &self,
        requests: &[FeeRequest],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<FeeBreakdown>, ProviderError> {
        let keys: Vec<String> = requests.iter().map(|req| req.key.clone()).collect();
        let products = self.products_by_key(&keys, marketplace).await?;
        let mut response = BatchResponse::default();
        for request in requests {
            let Some((_, product)) = products.iter().find(|(key, _)| key == &request.key) else {
                continue;
            };
            let catalog = catalog_from_product(product);
            match estimate_fees(&catalog, request.price) {
                Some(fees) => {
                    response.items.insert(request.key.clone(), fees);
                }
                None => response.errors.push(KeyError {
                    key: request.key.clone(),
                    message: "no_fee_schedule".into(),
                }),
            }
        }
        Ok(response)
    }
}

fn catalog_from_product(product: &KeepaProduct) -> CatalogData {
    let current = product
        .stats
        .as_ref()
        .map(|stats| stats.current.as_slice())
        .unwrap_or_default();
    let at = |idx: usize| current.get(idx).copied().flatten().filter(|value| *value > 0);

    let buy_box = product
        .stats
        .as_ref()
        .and_then(|stats| stats.buy_box_price)
        .filter(|value| *value > 0)
        .or_else(|| at(IDX_BUY_BOX));

    CatalogData {
        asin: Some(product.asin.clone()),
        title: product.title.clone(),
        brand: product.brand.clone(),
        image_url: product
            .images_csv
            .as_deref()
            .and_then(|csv| csv.split(',').next())
            .filter(|name| !name.is_empty())
            .map(|name| format!("https://m.media-amazon.com/images/I/{name}")),
        category: product
            .category_tree
            .as_ref()
            .and_then(|tree| tree.first())
            .map(|cat| cat.name.clone()),
        buy_box_price: buy_box.map(cents),
        new_price: at(IDX_NEW).map(cents),
        seller_count: at(IDX_COUNT_NEW).map(|count| count as u32),
        fba_seller_count: product
            .stats
            .as_ref()
            .and_then(|stats| stats.offer_count_fba)
            .filter(|count| *count >= 0)
            .map(|count| count as u32),
        amazon_sells: Some(at(IDX_AMAZON).is_some()),
        bsr: at(IDX_SALES_RANK).map(|rank| rank as u64),
        referral_fee_pct: product.referral_fee_percentage,
        fba_fee: product
            .fba_fees
            .as_ref()
            .and_then(|fees| fees.pick_and_pack_fee)
            .filter(|fee| *fee >= 0)
            .map(cents),
    }
}

/// Fee estimate from the product's own referral percentage and FBA fee.
pub fn estimate_fees(catalog: &CatalogData, price: f64) -> Option<FeeBreakdown> {
    let pct = catalog.referral_fee_pct?;
    let referral = round_cents(price * pct / 100.0);
    let fba = catalog.fba_fee;
    Some(FeeBreakdown {
        total: round_cents(referral + fba.unwrap_or(0.0)),
        referral: Some(referral),
        fba,
    })
}

fn cents(value: i64) -> f64 {
    value as f64 / 100.0
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(super) fn request_error(provider: Provider, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider,
            after_ms: 0,
        }
    } else if let Some(status) = err.status() {
        ProviderError::from_status(provider, status.as_u16(), err.to_string())
    } else {
        ProviderError::Request {
            provider,
            message: err.to_string(),
        }
    }
}
