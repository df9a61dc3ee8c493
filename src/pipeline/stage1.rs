//! Cheap catalog pass: one high-ceiling batch per chunk, rough ROI, and an
//! optimistic pass/fail against the threshold minus the guard band.

use super::Thresholds;
use crate::models::{CandidateProduct, EnrichmentResult, KeyType, Marketplace, PriceSource, StageReached};
use crate::profit::rough_roi;
use crate::providers::{CatalogData, ProviderAdapter, ProviderError};
use tracing::{debug, warn};

/// A candidate that goes on to Stage 2, with whatever Stage 1 learned.
#[derive(Debug, Clone)]
pub struct Survivor {
    pub product: CandidateProduct,
    pub result: EnrichmentResult,
    /// Stage-1 price, used when Stage-2 pricing is unavailable.
    pub fallback_price: Option<f64>,
    /// Stage-1 per-key error, kept in case Stage 2 cannot resolve the key either.
    pub lookup_error: Option<String>,
}

impl Survivor {
    /// Key Stage 2 queries by: the resolved ASIN, or the lookup key when it
    /// already is one.
    pub fn query_key(&self) -> Option<String> {
        self.result.asin.clone().or_else(|| {
            (self.product.key_type == KeyType::Asin).then(|| self.product.lookup_key.clone())
        })
    }
}

#[derive(Debug, Default)]
pub struct Stage1Outcome {
    pub survivors: Vec<Survivor>,
    /// Outright failures, already carrying a rough fee estimate for scoring.
    pub rejects: Vec<(CandidateProduct, EnrichmentResult)>,
}

/// Runs one chunk through the cheap provider. Only hard provider errors
/// escape; any other failure forwards the whole chunk to Stage 2 unfiltered.
pub async fn filter_chunk(
    adapter: &ProviderAdapter,
    chunk: &[CandidateProduct],
    marketplace: Marketplace,
    thresholds: &Thresholds,
) -> Result<Stage1Outcome, ProviderError> {
    let keys: Vec<String> = chunk.iter().map(|item| item.lookup_key.clone()).collect();
    let response = match adapter.fetch_catalog_batch(&keys, marketplace).await {
        Ok(response) => response,
        Err(err) if err.is_hard() => return Err(err),
        Err(err) => {
            warn!(
                target = "sourcing.pipeline",
                items = chunk.len(),
                error = %err,
                "stage1_chunk_unavailable_forwarding"
            );
            let survivors = chunk
                .iter()
                .map(|product| Survivor {
                    product: product.clone(),
                    result: EnrichmentResult::empty(&product.lookup_key, StageReached::Stage1),
                    fallback_price: None,
                    lookup_error: Some(err.to_string()),
                })
                .collect();
            return Ok(Stage1Outcome {
                survivors,
                rejects: Vec::new(),
            });
        }
    };

    let mut outcome = Stage1Outcome::default();
    for product in chunk {
        let mut result = EnrichmentResult::empty(&product.lookup_key, StageReached::Stage1);
        let Some(catalog) = response.items.get(&product.lookup_key) else {
            // No catalog answer: let Stage 2 try before giving up.
            outcome.survivors.push(Survivor {
                product: product.clone(),
                result,
                fallback_price: None,
                lookup_error: response.error_for(&product.lookup_key).map(str::to_string),
            });
            continue;
        };
        apply_catalog(&mut result, catalog);

        let price = catalog.best_price();
        let referral_pct = catalog
            .referral_fee_pct
            .unwrap_or(thresholds.default_referral_pct);
        let rough = price.and_then(|price| {
            rough_roi(price, referral_pct, catalog.fba_fee, product.wholesale_cost)
        });

        match (price, rough) {
            (Some(price), Some(roi)) if roi < thresholds.stage1_floor() => {
                debug!(
                    target = "sourcing.pipeline",
                    lookup_key = %product.lookup_key,
                    rough_roi = roi,
                    floor = thresholds.stage1_floor(),
                    "stage1_reject"
                );
                let referral = round2(price * referral_pct / 100.0);
                result.sell_price = Some(price);
                result.price_source = PriceSource::Stage1Estimate;
                result.fees_referral = Some(referral);
                result.fees_fba = catalog.fba_fee;
                result.fees_total = Some(round2(referral + catalog.fba_fee.unwrap_or(0.0)));
                outcome.rejects.push((product.clone(), result));
            }
            _ => outcome.survivors.push(Survivor {
                product: product.clone(),
                result,
                fallback_price: price,
                lookup_error: None,
            }),
        }
    }
    Ok(outcome)
}

/// Baseline catalog fields. Pricing fields are set by whichever stage decides
/// the price.
fn apply_catalog(result: &mut EnrichmentResult, catalog: &CatalogData) {
    result.asin = catalog.asin.clone();
    result.title = catalog.title.clone();
    result.brand = catalog.brand.clone();
    result.image_url = catalog.image_url.clone();
    result.category = catalog.category.clone();
    result.seller_count = catalog.seller_count;
    result.fba_seller_count = catalog.fba_seller_count;
    result.amazon_sells = catalog.amazon_sells;
    result.bsr = catalog.bsr;
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
