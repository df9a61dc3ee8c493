use super::{
    BatchResponse, CatalogData, FeeBreakdown, FeeRequest, KeyError, Provider, ProviderClient,
    ProviderError,
};
use crate::models::{KeyType, Marketplace};
use async_trait::async_trait;
use std::time::Duration;

/// Offline stand-in for Keepa or SP-API, used in demo mode and whenever
/// credentials are missing. Every answer is a pure function of the key, so
/// repeated runs produce identical analyses.
pub struct SimulatedClient {
    provider: Provider,
    latency: Duration,
}

impl SimulatedClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            latency: Duration::from_millis(match provider {
                Provider::Keepa => 40,
                Provider::SpApi => 120,
            }),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lookup(&self, key: &str) -> Option<CatalogData> {
        let hash = fnv1a(key);
        // roughly one key in twenty is unknown to the catalog
        if hash % 20 == 7 {
            return None;
        }
        let asin = match KeyType::detect(key) {
            Some(KeyType::Upc) => format!("B0{:08X}", hash as u32),
            _ => key.to_uppercase(),
        };
        let base_cents = 800 + (hash >> 8) % 5_200;
        let price = match self.provider {
            Provider::Keepa => base_cents as f64 / 100.0,
            // live offers drift a few percent from the tracked price
            Provider::SpApi => {
                let drift = ((hash >> 24) % 11) as f64 - 5.0;
                ((base_cents as f64 * (100.0 + drift)).round()) / 10_000.0
            }
        };
        let sellers = 1 + ((hash >> 32) % 25) as u32;
        Some(CatalogData {
            asin: Some(asin.clone()),
            title: Some(format!("Sample product {asin}")),
            brand: Some(BRANDS[(hash % BRANDS.len() as u64) as usize].to_string()),
            image_url: None,
            category: Some(CATEGORIES[((hash >> 4) % CATEGORIES.len() as u64) as usize].to_string()),
            buy_box_price: Some(round_cents(price)),
            new_price: Some(round_cents(price * 0.97)),
            seller_count: Some(sellers),
            fba_seller_count: Some(sellers.div_ceil(2)),
            amazon_sells: Some((hash >> 40) % 4 == 0),
            bsr: Some(500 + (hash >> 16) % 250_000),
            referral_fee_pct: Some(15.0),
            fba_fee: Some(round_cents(2.5 + ((hash >> 12) % 300) as f64 / 100.0)),
        })
    }
}

const BRANDS: [&str; 5] = ["Acme", "Northwind", "Globex", "Initech", "Umbrella"];
const CATEGORIES: [&str; 4] = ["Home & Kitchen", "Toys & Games", "Sports & Outdoors", "Grocery"];

#[async_trait]
impl ProviderClient for SimulatedClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn catalog(
        &self,
        keys: &[String],
        _marketplace: Marketplace,
    ) -> Result<BatchResponse<CatalogData>, ProviderError> {
        tokio::time::sleep(self.latency).await;
        let mut response = BatchResponse::default();
        for key in keys {
            if let Some(data) = self.lookup(key) {
                response.items.insert(key.clone(), data);
            }
        }
        Ok(response)
    }

    async fn fees(
        &self,
        requests: &[FeeRequest],
        _marketplace: Marketplace,
    ) -> Result<BatchResponse<FeeBreakdown>, ProviderError> {
        tokio::time::sleep(self.latency).await;
        let mut response = BatchResponse::default();
        for request in requests {
            match self.lookup(&request.key) {
                Some(data) => {
                    let referral = round_cents(request.price * 0.15);
                    let fba = data.fba_fee.unwrap_or(3.0);
                    response.items.insert(
                        request.key.clone(),
                        FeeBreakdown {
                            total: round_cents(referral + fba),
                            referral: Some(referral),
                            fba: Some(fba),
                        },
                    );
                }
                None => response.errors.push(KeyError {
                    key: request.key.clone(),
                    message: "unknown_asin".into(),
                }),
            }
        }
        Ok(response)
    }
}

fn fnv1a(input: &str) -> u64 {
    input
        .to_uppercase()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
