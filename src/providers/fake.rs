//! Scripted provider client for tests.

use super::{
    BatchResponse, CatalogData, FeeBreakdown, FeeRequest, KeyError, Provider, ProviderClient,
    ProviderError, split_by_key_type,
};
use crate::models::Marketplace;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Every call fails with an auth error.
    Hard,
    /// The next N calls fail with a 503, then calls succeed.
    TransientTimes(u32),
    /// Every call sleeps this long before answering.
    Stall(Duration),
}

pub struct ScriptedClient {
    provider: Provider,
    catalog: HashMap<String, CatalogData>,
    key_errors: HashMap<String, String>,
    fee_errors: HashMap<String, String>,
    catalog_failure: Mutex<Option<Failure>>,
    fee_failure: Mutex<Option<Failure>>,
    catalog_calls: Mutex<Vec<Vec<String>>>,
    fee_calls: Mutex<Vec<Vec<FeeRequest>>>,
    split_key_types: bool,
    catalog_gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            catalog: HashMap::new(),
            key_errors: HashMap::new(),
            fee_errors: HashMap::new(),
            catalog_failure: Mutex::new(None),
            fee_failure: Mutex::new(None),
            catalog_calls: Mutex::new(Vec::new()),
            fee_calls: Mutex::new(Vec::new()),
            split_key_types: false,
            catalog_gate: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// ASINs and UPCs go out as separate requests, as Keepa does.
    pub fn splitting_key_types(mut self) -> Self {
        self.split_key_types = true;
        self
    }

    /// Each catalog call consumes one permit before answering.
    pub fn with_catalog_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.catalog_gate = Some(gate);
        self
    }

    /// Most catalog calls that were ever in progress at once.
    pub fn peak_catalog_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn with_price(self, key: &str, price: f64) -> Self {
        self.with_catalog(
            key,
            CatalogData {
                asin: Some(key.to_string()),
                title: Some(format!("Item {key}")),
                buy_box_price: Some(price),
                ..CatalogData::default()
            },
        )
    }

    pub fn with_catalog(mut self, key: &str, data: CatalogData) -> Self {
        self.catalog.insert(key.to_string(), data);
        self
    }

    pub fn with_key_error(mut self, key: &str, message: &str) -> Self {
        self.key_errors.insert(key.to_string(), message.to_string());
        self
    }

    pub fn with_fee_error(mut self, key: &str, message: &str) -> Self {
        self.fee_errors.insert(key.to_string(), message.to_string());
        self
    }

    pub fn with_catalog_failure(self, failure: Failure) -> Self {
        *self.catalog_failure.lock().unwrap() = Some(failure);
        self
    }

    pub fn with_fee_failure(self, failure: Failure) -> Self {
        *self.fee_failure.lock().unwrap() = Some(failure);
        self
    }

    pub fn catalog_calls(&self) -> Vec<Vec<String>> {
        self.catalog_calls.lock().unwrap().clone()
    }

    pub fn fee_calls(&self) -> Vec<Vec<FeeRequest>> {
        self.fee_calls.lock().unwrap().clone()
    }

    /// Fee schedule: 15% referral plus a flat 3.00 fulfilment fee.
    pub fn fee_for(price: f64) -> FeeBreakdown {
        let referral = (price * 0.15 * 100.0).round() / 100.0;
        FeeBreakdown {
            total: referral + 3.0,
            referral: Some(referral),
            fba: Some(3.0),
        }
    }

    async fn apply_failure(&self, slot: &Mutex<Option<Failure>>) -> Result<(), ProviderError> {
        let failure = {
            let mut guard = slot.lock().unwrap();
            match *guard {
                Some(Failure::TransientTimes(remaining)) => {
                    *guard = if remaining > 1 {
                        Some(Failure::TransientTimes(remaining - 1))
                    } else {
                        None
                    };
                    Some(Failure::TransientTimes(remaining))
                }
                other => other,
            }
        };
        match failure {
            None => Ok(()),
            Some(Failure::Hard) => Err(ProviderError::Unauthorized {
                provider: self.provider,
                message: "invalid credentials".into(),
            }),
            Some(Failure::TransientTimes(_)) => Err(ProviderError::Http {
                provider: self.provider,
                status: 503,
                message: "service unavailable".into(),
            }),
            Some(Failure::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn catalog(
        &self,
        keys: &[String],
        _marketplace: Marketplace,
    ) -> Result<BatchResponse<CatalogData>, ProviderError> {
        self.catalog_calls.lock().unwrap().push(keys.to_vec());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(gate) = &self.catalog_gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        let outcome = self.apply_failure(&self.catalog_failure).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome?;
        let mut response = BatchResponse::default();
        for key in keys {
            if let Some(message) = self.key_errors.get(key) {
                response.errors.push(KeyError {
                    key: key.clone(),
                    message: message.clone(),
                });
            } else if let Some(data) = self.catalog.get(key) {
                response.items.insert(key.clone(), data.clone());
            }
        }
        Ok(response)
    }

    fn request_groups(&self, keys: &[String]) -> Vec<Vec<String>> {
        if self.split_key_types {
            split_by_key_type(keys)
        } else {
            vec![keys.to_vec()]
        }
    }

    async fn fees(
        &self,
        requests: &[FeeRequest],
        _marketplace: Marketplace,
    ) -> Result<BatchResponse<FeeBreakdown>, ProviderError> {
        self.fee_calls.lock().unwrap().push(requests.to_vec());
        self.apply_failure(&self.fee_failure).await?;
        let mut response = BatchResponse::default();
        for request in requests {
            if let Some(message) = self.fee_errors.get(&request.key) {
                response.errors.push(KeyError {
                    key: request.key.clone(),
                    message: message.clone(),
                });
            } else {
                response
                    .items
                    .insert(request.key.clone(), Self::fee_for(request.price));
            }
        }
        Ok(response)
    }
}
