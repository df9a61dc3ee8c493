#![allow(non_snake_case)]

use super::config::{
    LWA_TOKEN_URL, SPAPI_CLIENT_ID, SPAPI_CLIENT_SECRET, SPAPI_REFRESH_TOKEN, SPAPI_ROOT,
};
use super::keepa::request_error;
use super::{
    BatchResponse, CatalogData, FeeBreakdown, FeeRequest, KeyError, Provider, ProviderClient,
    ProviderError,
};
use crate::http::build_client;
use crate::models::Marketplace;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const AMAZON_SELLER_ID: &str = "ATVPDKIKX0DER";

/// Selling Partner API: batched item offers for pricing and batched fee
/// estimates, authorised with a Login-with-Amazon refresh token.
pub struct SpApiClient {
    http: Client,
    credentials: LwaCredentials,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Clone)]
pub struct LwaCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ItemOffersBatchRequest {
    requests: Vec<ItemOffersRequest>,
}

#[derive(Debug, Serialize)]
struct ItemOffersRequest {
    uri: String,
    method: &'static str,
    MarketplaceId: &'static str,
    ItemCondition: &'static str,
    CustomerType: &'static str,
}

#[derive(Debug, Deserialize)]
struct ItemOffersBatchResponse {
    #[serde(default)]
    responses: Vec<ItemOffersResponse>,
}

#[derive(Debug, Deserialize)]
struct ItemOffersResponse {
    status: ResponseStatus,
    #[serde(default)]
    body: Option<ItemOffersBody>,
    #[serde(default)]
    request: Option<ItemOffersRequestEcho>,
}

#[derive(Debug, Deserialize)]
struct ResponseStatus {
    statusCode: u16,
    #[serde(default)]
    reasonPhrase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemOffersRequestEcho {
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemOffersBody {
    #[serde(default)]
    payload: Option<OffersPayload>,
}

#[derive(Debug, Deserialize)]
struct OffersPayload {
    #[serde(default)]
    ASIN: Option<String>,
    #[serde(default)]
    Summary: Option<OffersSummary>,
    #[serde(default)]
    Offers: Vec<OfferEntry>,
}

#[derive(Debug, Deserialize)]
struct OffersSummary {
    #[serde(default)]
    TotalOfferCount: Option<u32>,
    #[serde(default)]
    NumberOfOffers: Vec<OfferCount>,
    #[serde(default)]
    BuyBoxPrices: Vec<BuyBoxPrice>,
    #[serde(default)]
    LowestPrices: Vec<LowestPrice>,
    #[serde(default)]
    SalesRankings: Vec<SalesRank>,
}

#[derive(Debug, Deserialize)]
struct OfferCount {
    #[serde(default)]
    fulfillmentChannel: Option<String>,
    #[serde(default)]
    OfferCount: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BuyBoxPrice {
    #[serde(default)]
    LandedPrice: Option<MoneyType>,
    #[serde(default)]
    ListingPrice: Option<MoneyType>,
}

#[derive(Debug, Deserialize)]
struct LowestPrice {
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    LandedPrice: Option<MoneyType>,
}

#[derive(Debug, Deserialize)]
struct SalesRank {
    #[serde(default)]
    Rank: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OfferEntry {
    #[serde(default)]
    SellerId: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MoneyType {
    CurrencyCode: String,
    Amount: f64,
}

#[derive(Debug, Serialize)]
struct FeesEstimateByIdRequest {
    FeesEstimateRequest: FeesEstimateRequest,
    IdType: &'static str,
    IdValue: String,
}

#[derive(Debug, Serialize)]
struct FeesEstimateRequest {
    MarketplaceId: &'static str,
    IsAmazonFulfilled: bool,
    PriceToEstimateFees: PriceToEstimateFees,
    Identifier: String,
}

#[derive(Debug, Serialize)]
struct PriceToEstimateFees {
    ListingPrice: MoneyType,
}

#[derive(Debug, Deserialize)]
struct FeesEstimateResult {
    #[serde(default)]
    Status: Option<String>,
    #[serde(default)]
    FeesEstimateIdentifier: Option<FeesEstimateIdentifier>,
    #[serde(default)]
    FeesEstimate: Option<FeesEstimate>,
    #[serde(default)]
    Error: Option<FeesError>,
}

#[derive(Debug, Deserialize)]
struct FeesEstimateIdentifier {
    #[serde(default)]
    IdValue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeesEstimate {
    #[serde(default)]
    TotalFeesEstimate: Option<MoneyType>,
    #[serde(default)]
    FeeDetailList: Vec<FeeDetail>,
}

#[derive(Debug, Deserialize)]
struct FeeDetail {
    FeeType: String,
    #[serde(default)]
    FinalFee: Option<MoneyType>,
}

#[derive(Debug, Deserialize)]
struct FeesError {
    #[serde(default)]
    Code: Option<String>,
    #[serde(default)]
    Message: Option<String>,
}

impl SpApiClient {
    pub fn new(credentials: LwaCredentials) -> Self {
        Self {
            http: build_client(),
            credentials,
            token: Mutex::new(None),
        }
    }

    pub fn from_env() -> Option<Self> {
        super::config::spapi_configured().then(|| {
            Self::new(LwaCredentials {
                client_id: SPAPI_CLIENT_ID.clone(),
                client_secret: SPAPI_CLIENT_SECRET.clone(),
                refresh_token: SPAPI_REFRESH_TOKEN.clone(),
            })
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.credentials.refresh_token.as_str()),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(LWA_TOKEN_URL.as_str())
            .form(&params)
            .send()
            .await
            .map_err(|err| request_error(Provider::SpApi, err))?;

        let status = response.status();
        if !status.is_success() {
            // LWA answers 400 for a revoked or malformed refresh token.
            let status = if status.as_u16() == 400 { 401 } else { status.as_u16() };
            return Err(ProviderError::from_status(
                Provider::SpApi,
                status,
                "lwa token exchange failed",
            ));
        }

        let payload: TokenResponse =
            response
                .json()
                .await
                .map_err(|err| ProviderError::Deserialize {
                    provider: Provider::SpApi,
                    message: err.to_string(),
                })?;
        // refresh a minute early
        let lifetime = payload.expires_in.unwrap_or(3600).saturating_sub(60);
        debug!(target = "sourcing.provider", provider = "sp_api", lifetime, "lwa_token_refreshed");
        *guard = Some(AccessToken {
            value: payload.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(payload.access_token)
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        builder: RequestBuilder,
        body: &B,
    ) -> Result<Value, ProviderError> {
        let token = self.access_token().await?;
        let response = builder
            .header("x-amz-access-token", token)
            .json(body)
            .send()
            .await
            .map_err(|err| request_error(Provider::SpApi, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 403 && body.contains("QuotaExceeded") {
                return Err(ProviderError::QuotaExhausted {
                    provider: Provider::SpApi,
                    message: "quota exceeded".into(),
                });
            }
            return Err(ProviderError::from_status(
                Provider::SpApi,
                status.as_u16(),
                body.chars().take(200).collect::<String>(),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| ProviderError::Deserialize {
                provider: Provider::SpApi,
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl ProviderClient for SpApiClient {
    fn provider(&self) -> Provider {
        Provider::SpApi
    }

    async fn catalog(
        &self,
        keys: &[String],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<CatalogData>, ProviderError> {
        let body = ItemOffersBatchRequest {
            requests: keys
                .iter()
                .map(|key| ItemOffersRequest {
                    uri: offers_uri(key),
                    method: "GET",
                    MarketplaceId: marketplace.spapi_marketplace_id(),
                    ItemCondition: "New",
                    CustomerType: "Consumer",
                })
                .collect(),
        };
        let url = format!("{}/batches/products/pricing/v0/itemOffers", *SPAPI_ROOT);
        let raw = self.send_json(self.http.post(url), &body).await?;
        let parsed: ItemOffersBatchResponse =
            serde_json::from_value(raw).map_err(|err| ProviderError::Deserialize {
                provider: Provider::SpApi,
                message: err.to_string(),
            })?;
        Ok(collect_offers(keys, parsed))
    }

    async fn fees(
        &self,
        requests: &[FeeRequest],
        marketplace: Marketplace,
    ) -> Result<BatchResponse<FeeBreakdown>, ProviderError> {
        let body: Vec<FeesEstimateByIdRequest> = requests
            .iter()
            .map(|request| FeesEstimateByIdRequest {
                FeesEstimateRequest: FeesEstimateRequest {
                    MarketplaceId: marketplace.spapi_marketplace_id(),
                    IsAmazonFulfilled: true,
                    PriceToEstimateFees: PriceToEstimateFees {
                        ListingPrice: MoneyType {
                            CurrencyCode: marketplace.currency().to_string(),
                            Amount: request.price,
                        },
                    },
                    Identifier: request.key.clone(),
                },
                IdType: "ASIN",
                IdValue: request.key.clone(),
            })
            .collect();
        let url = format!("{}/products/fees/v0/feesEstimate", *SPAPI_ROOT);
        let raw = self.send_json(self.http.post(url), &body).await?;
        let parsed: Vec<FeesEstimateResult> =
            serde_json::from_value(raw).map_err(|err| ProviderError::Deserialize {
                provider: Provider::SpApi,
                message: err.to_string(),
            })?;
        Ok(collect_fees(parsed))
    }
}

fn offers_uri(asin: &str) -> String {
    format!("/products/pricing/v0/items/{asin}/offers")
}

fn collect_offers(keys: &[String], parsed: ItemOffersBatchResponse) -> BatchResponse<CatalogData> {
    let mut response = BatchResponse::default();
    for (idx, entry) in parsed.responses.into_iter().enumerate() {
        let payload = entry.body.and_then(|body| body.payload);
        // Match on the echoed request uri first, then ASIN, then position.
        let key = entry
            .request
            .and_then(|req| req.uri)
            .and_then(|uri| keys.iter().find(|key| offers_uri(key) == uri).cloned())
            .or_else(|| {
                payload
                    .as_ref()
                    .and_then(|p| p.ASIN.as_ref())
                    .and_then(|asin| keys.iter().find(|key| key.eq_ignore_ascii_case(asin)).cloned())
            })
            .or_else(|| keys.get(idx).cloned());
        let Some(key) = key else {
            continue;
        };

        if entry.status.statusCode != 200 {
            response.errors.push(KeyError {
                key,
                message: format!(
                    "HTTP {} {}",
                    entry.status.statusCode,
                    entry.status.reasonPhrase.unwrap_or_default()
                )
                .trim()
                .to_string(),
            });
            continue;
        }
        if let Some(payload) = payload {
            response.items.insert(key, catalog_from_offers(&payload));
        }
    }
    response
}

fn catalog_from_offers(payload: &OffersPayload) -> CatalogData {
    let summary = payload.Summary.as_ref();
    let buy_box_price = summary
        .and_then(|s| s.BuyBoxPrices.first())
        .and_then(|price| price.LandedPrice.as_ref().or(price.ListingPrice.as_ref()))
        .map(|money| money.Amount);
    let new_price = summary
        .into_iter()
        .flat_map(|s| s.LowestPrices.iter())
        .filter(|price| {
            price
                .condition
                .as_deref()
                .is_none_or(|condition| condition.eq_ignore_ascii_case("new"))
        })
        .filter_map(|price| price.LandedPrice.as_ref().map(|money| money.Amount))
        .fold(None, |lowest: Option<f64>, amount| {
            Some(lowest.map_or(amount, |current| current.min(amount)))
        });
    let fba_seller_count = summary.map(|s| {
        s.NumberOfOffers
            .iter()
            .filter(|count| count.fulfillmentChannel.as_deref() == Some("Amazon"))
            .filter_map(|count| count.OfferCount)
            .sum::<u32>()
    });

    CatalogData {
        asin: payload.ASIN.clone(),
        buy_box_price,
        new_price,
        seller_count: summary.and_then(|s| s.TotalOfferCount),
        fba_seller_count,
        amazon_sells: Some(
            payload
                .Offers
                .iter()
                .any(|offer| offer.SellerId.as_deref() == Some(AMAZON_SELLER_ID)),
        ),
        bsr: summary
            .and_then(|s| s.SalesRankings.first())
            .and_then(|rank| rank.Rank),
        ..CatalogData::default()
    }
}

fn collect_fees(parsed: Vec<FeesEstimateResult>) -> BatchResponse<FeeBreakdown> {
    let mut response = BatchResponse::default();
    for result in parsed {
        let Some(key) = result
            .FeesEstimateIdentifier
            .as_ref()
            .and_then(|id| id.IdValue.clone())
        else {
            continue;
        };
        let success = result
            .Status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case("success"));
        let total = result
            .FeesEstimate
            .as_ref()
            .and_then(|estimate| estimate.TotalFeesEstimate.as_ref())
            .map(|money| money.Amount);

        match (success, total) {
            (true, Some(total)) => {
                let detail = |fee_type: &str| {
                    result.FeesEstimate.as_ref().and_then(|estimate| {
                        estimate
                            .FeeDetailList
                            .iter()
                            .find(|detail| detail.FeeType == fee_type)
                            .and_then(|detail| detail.FinalFee.as_ref())
                            .map(|money| money.Amount)
                    })
                };
                response.items.insert(
                    key,
                    FeeBreakdown {
                        total,
                        referral: detail("ReferralFee"),
                        fba: detail("FBAFees"),
                    },
                );
            }
            _ => {
                let message = result
                    .Error
                    .map(|err| {
                        format!(
                            "{}: {}",
                            err.Code.unwrap_or_else(|| "FeesError".into()),
                            err.Message.unwrap_or_default()
                        )
                    })
                    .unwrap_or_else(|| "fee estimate unavailable".into());
                response.errors.push(KeyError { key, message });
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_item_offers_batch() {
        let keys = vec!["B000000001".to_string(), "B000000002".to_string()];
        let parsed: ItemOffersBatchResponse = serde_json::from_value(json!({
            "responses": [
                {
                    "status": {"statusCode": 200, "reasonPhrase": "OK"},
                    "request": {"uri": "/products/pricing/v0/items/B000000001/offers"},
                    "body": {"payload": {
                        "ASIN": "B000000001",
                        "Summary": {
                            "TotalOfferCount": 6,
                            "NumberOfOffers": [
                                {"condition": "new", "fulfillmentChannel": "Amazon", "OfferCount": 2},
                                {"condition": "new", "fulfillmentChannel": "Merchant", "OfferCount": 4}
                            ],
                            "BuyBoxPrices": [{"condition": "New", "LandedPrice": {"CurrencyCode": "USD", "Amount": 21.5}}],
                            "LowestPrices": [
                                {"condition": "new", "LandedPrice": {"CurrencyCode": "USD", "Amount": 20.0}},
                                {"condition": "new", "LandedPrice": {"CurrencyCode": "USD", "Amount": 19.0}}
                            ],
                            "SalesRankings": [{"ProductCategoryId": "home", "Rank": 812}]
                        },
                        "Offers": [{"SellerId": "ATVPDKIKX0DER"}]
                    }}
                },
                {
                    "status": {"statusCode": 429, "reasonPhrase": "Too Many Requests"},
                    "request": {"uri": "/products/pricing/v0/items/B000000002/offers"}
                }
            ]
        }))
        .unwrap();

        let response = collect_offers(&keys, parsed);
        let data = &response.items["B000000001"];
        assert_eq!(data.buy_box_price, Some(21.5));
        assert_eq!(data.new_price, Some(19.0));
        assert_eq!(data.seller_count, Some(6));
        assert_eq!(data.fba_seller_count, Some(2));
        assert_eq!(data.amazon_sells, Some(true));
        assert_eq!(data.bsr, Some(812));
        assert_eq!(
            response.error_for("B000000002"),
            Some("HTTP 429 Too Many Requests")
        );
    }

    #[test]
    fn parses_fee_estimates() {
        let parsed: Vec<FeesEstimateResult> = serde_json::from_value(json!([
            {
                "Status": "Success",
                "FeesEstimateIdentifier": {"IdType": "ASIN", "IdValue": "B000000001"},
                "FeesEstimate": {
                    "TotalFeesEstimate": {"CurrencyCode": "USD", "Amount": 6.0},
                    "FeeDetailList": [
                        {"FeeType": "ReferralFee", "FinalFee": {"CurrencyCode": "USD", "Amount": 3.0}},
                        {"FeeType": "FBAFees", "FinalFee": {"CurrencyCode": "USD", "Amount": 3.0}}
                    ]
                }
            },
            {
                "Status": "ClientError",
                "FeesEstimateIdentifier": {"IdType": "ASIN", "IdValue": "B000000002"},
                "Error": {"Code": "InvalidParameterValue", "Message": "unknown ASIN"}
            }
        ]))
        .unwrap();
        let response = collect_fees(parsed);
        let fees = response.items["B000000001"];
        assert_eq!(fees.total, 6.0);
        assert_eq!(fees.referral, Some(3.0));
        assert_eq!(fees.fba, Some(3.0));
        assert_eq!(
            response.error_for("B000000002"),
            Some("InvalidParameterValue: unknown ASIN")
        );
    }
}
