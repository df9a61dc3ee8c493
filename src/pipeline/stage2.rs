//! Expensive pass over Stage-1 survivors: live pricing, then fee estimates at
//! the price just decided. Pricing gaps fall back to the Stage-1 price.

use super::stage1::Survivor;
use crate::models::{CandidateProduct, EnrichmentResult, Marketplace, PriceSource, StageReached};
use crate::providers::{BatchResponse, CatalogData, FeeRequest, ProviderAdapter, ProviderError};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct Stage2Outcome {
    pub items: Vec<(CandidateProduct, EnrichmentResult)>,
    /// Set when the pricing call failed for the whole chunk.
    pub pricing_error: Option<ProviderError>,
    /// Set when the fee call failed for the whole chunk.
    pub fee_error: Option<ProviderError>,
}

/// Enriches at most one expensive-provider batch worth of survivors. With
/// `skip_pricing` set (the provider already failed hard in this run) every
/// item goes straight to the Stage-1 fallback.
pub async fn enrich_chunk(
    adapter: &ProviderAdapter,
    survivors: Vec<Survivor>,
    marketplace: Marketplace,
    skip_pricing: bool,
) -> Stage2Outcome {
    let mut outcome = Stage2Outcome::default();
    let query_keys: Vec<String> = survivors.iter().filter_map(Survivor::query_key).collect();

    let pricing = if skip_pricing || query_keys.is_empty() {
        BatchResponse::default()
    } else {
        match adapter.fetch_catalog_batch(&query_keys, marketplace).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    target = "sourcing.pipeline",
                    items = survivors.len(),
                    hard = err.is_hard(),
                    error = %err,
                    "stage2_pricing_failed_falling_back"
                );
                outcome.pricing_error = Some(err);
                BatchResponse::default()
            }
        }
    };

    let mut priced: Vec<(Survivor, EnrichmentResult, Option<String>)> = Vec::with_capacity(survivors.len());
    for survivor in survivors {
        let query_key = survivor.query_key();
        let mut result = survivor.result.clone();
        result.stage_reached = StageReached::Stage2;

        let live = query_key.as_deref().and_then(|key| pricing.items.get(key));
        if let Some(live) = live {
            apply_live(&mut result, live);
        }
        match (live.and_then(CatalogData::best_price), survivor.fallback_price) {
            (Some(price), _) => {
                result.sell_price = Some(price);
                result.price_source = PriceSource::Stage2Provider;
            }
            (None, Some(price)) => {
                result.sell_price = Some(price);
                result.price_source = PriceSource::Stage1Fallback;
            }
            (None, None) => {
                result.sell_price = None;
                result.price_source = PriceSource::Unknown;
                // An unpriced product is missing data; a key no provider could
                // resolve is an item error.
                if live.is_none()
                    && let Some(message) = survivor.lookup_error.clone()
                {
                    result.error = Some(message);
                }
            }
        }
        priced.push((survivor, result, query_key));
    }

    let fee_requests: Vec<FeeRequest> = priced
        .iter()
        .filter_map(|(_, result, key)| {
            Some(FeeRequest {
                key: key.clone()?,
                price: result.sell_price?,
            })
        })
        .collect();
    let fees = if fee_requests.is_empty() {
        BatchResponse::default()
    } else {
        match adapter.fetch_fee_batch(&fee_requests, marketplace).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    target = "sourcing.pipeline",
                    items = fee_requests.len(),
                    error = %err,
                    "stage2_fees_failed"
                );
                outcome.fee_error = Some(err);
                BatchResponse::default()
            }
        }
    };

    for (survivor, mut result, key) in priced {
        if let Some(fee) = key.as_deref().and_then(|key| fees.items.get(key)) {
            result.fees_total = Some(fee.total);
            result.fees_referral = fee.referral;
            result.fees_fba = fee.fba;
        } else if let Some(message) = key.as_deref().and_then(|key| fees.error_for(key)) {
            debug!(
                target = "sourcing.pipeline",
                lookup_key = %result.lookup_key,
                error = message,
                "stage2_fee_missing"
            );
        }
        outcome.items.push((survivor.product, result));
    }
    outcome
}

/// Live offer data overwrites the Stage-1 snapshot where present.
fn apply_live(result: &mut EnrichmentResult, live: &CatalogData) {
    if result.asin.is_none() {
        result.asin = live.asin.clone();
    }
    if live.seller_count.is_some() {
        result.seller_count = live.seller_count;
    }
    if live.fba_seller_count.is_some() {
        result.fba_seller_count = live.fba_seller_count;
    }
    if live.amazon_sells.is_some() {
        result.amazon_sells = live.amazon_sells;
    }
    if live.bsr.is_some() {
        result.bsr = live.bsr;
    }
}
