use crate::http::build_client;
use crate::jobs::Job;
use crate::models::{AnalysisRecord, Grade, KeyType, PriceSource};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

const ANALYSES_TABLE: &str = "product_analyses";
const ANALYSES_CONFLICT: &str = "owner_id,lookup_key,supplier_id";
const JOBS_TABLE: &str = "analysis_jobs";

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid payload: {0}")]
    Serialize(String),
}

impl SupabaseError {
    /// Row-level rejections (bad data, constraint violations) as opposed to an
    /// unreachable or failing store.
    pub fn is_row_level(&self) -> bool {
        matches!(self, SupabaseError::Status { status, .. } if (400..500).contains(status) && *status != 401 && *status != 403)
    }
}

/// Row shape of `product_analyses`. Every column is always present, absent
/// values as `null`, so an upsert replaces the whole row and every row in a
/// bulk request carries the same columns.
#[derive(Debug, Serialize)]
struct AnalysisRow<'a> {
    owner_id: &'a str,
    supplier_id: &'a str,
    lookup_key: &'a str,
    key_type: KeyType,
    wholesale_cost: f64,
    moq: u32,
    job_id: String,
    idempotency_key: &'a str,
    analyzed_at: String,
    asin: Option<&'a str>,
    title: Option<&'a str>,
    brand: Option<&'a str>,
    image_url: Option<&'a str>,
    category: Option<&'a str>,
    sell_price: Option<f64>,
    price_source: PriceSource,
    fees_total: Option<f64>,
    fees_referral: Option<f64>,
    fees_fba: Option<f64>,
    seller_count: Option<u32>,
    fba_seller_count: Option<u32>,
    amazon_sells: Option<bool>,
    bsr: Option<u64>,
    stage_reached: u8,
    error: Option<&'a str>,
    net_profit: Option<f64>,
    roi: Option<f64>,
    margin: Option<f64>,
    meets_threshold: bool,
    grade: Option<Grade>,
}

impl<'a> From<&'a AnalysisRecord> for AnalysisRow<'a> {
    fn from(record: &'a AnalysisRecord) -> Self {
        let result = &record.result;
        let score = &record.score;
        Self {
            owner_id: &record.owner_id,
            supplier_id: &record.supplier_id,
            lookup_key: &result.lookup_key,
            key_type: record.key_type,
            wholesale_cost: record.wholesale_cost,
            moq: record.moq,
            job_id: record.job_id.to_string(),
            idempotency_key: &record.idempotency_key,
            analyzed_at: record.analyzed_at.to_rfc3339(),
            asin: result.asin.as_deref(),
            title: result.title.as_deref(),
            brand: result.brand.as_deref(),
            image_url: result.image_url.as_deref(),
            category: result.category.as_deref(),
            sell_price: result.sell_price,
            price_source: result.price_source,
            fees_total: result.fees_total,
            fees_referral: result.fees_referral,
            fees_fba: result.fees_fba,
            seller_count: result.seller_count,
            fba_seller_count: result.fba_seller_count,
            amazon_sells: result.amazon_sells,
            bsr: result.bsr,
            stage_reached: result.stage_reached.as_u8(),
            error: result.error.as_deref(),
            net_profit: score.net_profit,
            roi: score.roi,
            margin: score.margin,
            meets_threshold: score.meets_threshold,
            grade: score.grade,
        }
    }
}

/// Row shape of `analysis_jobs`.
#[derive(Debug, Serialize)]
struct JobRow<'a> {
    id: String,
    owner_id: &'a str,
    status: crate::jobs::JobStatus,
    total_items: usize,
    processed_items: usize,
    success_count: usize,
    error_count: usize,
    errors: &'a [crate::jobs::JobItemError],
    failure: Option<&'a str>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, service_key))
    }

    pub fn new(base_url: &str, service_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        }
    }

    /// Upserts analysis rows on `(owner_id, lookup_key, supplier_id)`; a
    /// repeated write for the same key overwrites the row.
    pub async fn upsert_analyses(&self, records: &[AnalysisRecord]) -> Result<(), SupabaseError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows: Vec<AnalysisRow<'_>> = records.iter().map(AnalysisRow::from).collect();
        self.upsert(ANALYSES_TABLE, Some(ANALYSES_CONFLICT), &rows)
            .await
    }

    pub async fn upsert_job(&self, job: &Job) -> Result<(), SupabaseError> {
        let row = JobRow {
            id: job.id.to_string(),
            owner_id: &job.owner_id,
            status: job.status,
            total_items: job.total_items,
            processed_items: job.processed_items,
            success_count: job.success_count,
            error_count: job.error_count,
            errors: &job.errors,
            failure: job.failure.as_deref(),
            started_at: job.started_at.map(|at| at.to_rfc3339()),
            completed_at: job.completed_at.map(|at| at.to_rfc3339()),
        };
        self.upsert(JOBS_TABLE, Some("id"), std::slice::from_ref(&row))
            .await
    }

    async fn upsert<T: Serialize>(
        &self,
        table: &str,
        on_conflict: Option<&str>,
        rows: &[T],
    ) -> Result<(), SupabaseError> {
        let mut url = format!("{}/rest/v1/{}", self.base_url, table);
        if let Some(columns) = on_conflict {
            url.push_str("?on_conflict=");
            url.push_str(&urlencoding::encode(columns));
        }
        let body = serde_json::to_vec(rows).map_err(|err| SupabaseError::Serialize(err.to_string()))?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .body(body)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupabaseError::Status {
                status: status.as_u16(),
                body: body.chars().take(300).collect(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnrichmentResult, ProfitabilityScore, StageReached};
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn record(result: EnrichmentResult, score: ProfitabilityScore) -> AnalysisRecord {
        AnalysisRecord {
            owner_id: "owner".into(),
            supplier_id: String::new(),
            key_type: KeyType::Asin,
            wholesale_cost: 5.0,
            moq: 1,
            job_id: Uuid::new_v4(),
            idempotency_key: "key".into(),
            analyzed_at: Utc::now(),
            result,
            score,
        }
    }

    fn columns(row: &Value) -> BTreeSet<String> {
        row.as_object().unwrap().keys().cloned().collect()
    }

    #[test]
    fn analysis_rows_always_carry_every_column() {
        let mut full = EnrichmentResult::empty("B000000001", StageReached::Stage2);
        full.sell_price = Some(20.0);
        full.fees_total = Some(6.0);
        full.error = Some("not_found".into());
        let first = record(full, crate::profit::score_parts(Some(20.0), Some(6.0), 5.0, 30.0));
        let rerun = record(
            EnrichmentResult::empty("B000000001", StageReached::Stage2),
            ProfitabilityScore::null(),
        );

        let rows = serde_json::to_value([&first, &rerun].map(AnalysisRow::from)).unwrap();
        let (first_row, rerun_row) = (&rows[0], &rows[1]);
        assert_eq!(columns(first_row), columns(rerun_row));

        // a re-run without fees must clear what the first run stored
        assert_eq!(first_row["fees_total"], Value::from(6.0));
        assert_eq!(rerun_row["fees_total"], Value::Null);
        assert_eq!(rerun_row["error"], Value::Null);
        assert_eq!(rerun_row["net_profit"], Value::Null);
        assert_eq!(rerun_row["grade"], Value::Null);
        assert_eq!(rerun_row["stage_reached"], Value::from(2));
    }

    #[test]
    fn classifies_row_level_failures() {
        let conflict = SupabaseError::Status {
            status: 409,
            body: "duplicate".into(),
        };
        let auth = SupabaseError::Status {
            status: 401,
            body: "jwt expired".into(),
        };
        assert!(conflict.is_row_level());
        assert!(!auth.is_row_level());
        assert!(!SupabaseError::Request("connection refused".into()).is_row_level());
    }
}
