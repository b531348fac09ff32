//! Audit trail
//!
//! One record per request, created once at completion and appended to an
//! append-only sink. Records carry a SHA-256 hash over their own contents so
//! tampering can be detected later.

use crate::country::Country;
use crate::error::OrchestrationError;
use crate::models::{Citation, ClassificationMethod, CostBreakdown, ValidationMode, Verdict};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

pub mod emitter;

pub use emitter::{AuditEmitter, EmitterStats};

pub const MAX_QUERY_CHARS: usize = 2000;
pub const MAX_RESPONSE_CHARS: usize = 15000;
pub const MAX_PREVIEW_CHARS: usize = 500;

/// Durable summary of one request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub session_id: String,
    pub country: Country,
    pub query_string: String,
    pub agent_response: Option<String>,
    pub result_preview: String,
    pub cost: f64,
    pub cost_breakdown: CostBreakdown,
    pub classification_method: Option<ClassificationMethod>,
    pub citations: Vec<Citation>,
    pub tool_used: Vec<String>,
    pub judge_verdict: Verdict,
    pub judge_confidence: f64,
    pub judge_reasoning: String,
    pub blocked: bool,
    /// Error detail (if any) plus a JSON cost payload
    pub error_info: String,
    pub validation_mode: ValidationMode,
    pub validation_attempts: u32,
    pub synthesis_attempts: u32,
    pub total_time_seconds: f64,
    #[serde(default)]
    pub record_hash: String,
}

impl AuditRecord {
    /// Compute and store the integrity hash
    pub fn seal(mut self) -> Self {
        self.record_hash = compute_record_hash(&self);
        self
    }

    pub fn is_intact(&self) -> bool {
        !self.record_hash.is_empty() && compute_record_hash(self) == self.record_hash
    }
}

/// Hash of every field except `record_hash` itself
pub fn compute_record_hash(record: &AuditRecord) -> String {
    let mut unsealed = record.clone();
    unsealed.record_hash.clear();

    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), &unsealed).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Truncate on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Error text stored with every record: optional detail plus the cost payload
pub fn error_info(
    detail: Option<&str>,
    cost: &CostBreakdown,
    method: Option<ClassificationMethod>,
) -> String {
    let mut payload = serde_json::json!({
        "cost_breakdown": {
            "classification_cost": cost.classification,
            "classification_method": method.map(|m| m.to_string()),
            "synthesis_cost": cost.synthesis,
            "validation_cost": cost.validation,
            "guardrail_cost": cost.guardrails,
            "total_cost": cost.total(),
        }
    });

    if let Some(detail) = detail {
        payload["error"] = serde_json::Value::String(detail.to_string());
    }

    payload.to_string()
}

//
// ================= Sinks =================
//

#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// Append a record. Appending the same event id twice is an error.
    async fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// Audit trail storage in memory
pub struct InMemoryAuditSink {
    records: Arc<RwLock<HashMap<Uuid, AuditRecord>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, event_id: Uuid) -> Option<AuditRecord> {
        let records = self.records.read().await;
        records.get(&event_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Records for one session, oldest first
    pub async fn list_for_session(&self, session_id: &str) -> Vec<AuditRecord> {
        let records = self.records.read().await;

        let mut items: Vec<AuditRecord> = records
            .values()
            .filter(|record| record.session_id == session_id)
            .cloned()
            .collect();

        items.sort_by_key(|record| record.timestamp);
        items
    }

    pub async fn all(&self) -> Vec<AuditRecord> {
        let records = self.records.read().await;
        let mut items: Vec<AuditRecord> = records.values().cloned().collect();
        items.sort_by_key(|record| record.timestamp);
        items
    }

    /// Verify a record's integrity via hash
    pub async fn verify_integrity(&self, event_id: Uuid) -> bool {
        let records = self.records.read().await;
        records.get(&event_id).map(AuditRecord::is_intact).unwrap_or(false)
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.event_id) {
            return Err(OrchestrationError::Audit(format!(
                "Record {} already exists",
                record.event_id
            )));
        }
        records.insert(record.event_id, record.clone());
        Ok(())
    }
}

/// Postgres governance table sink
pub struct PostgresAuditSink {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresAuditSink {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| OrchestrationError::Database(format!("Failed to create audit pool: {}", e)))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS governance_audit (
                      event_id UUID PRIMARY KEY,
                      timestamp TIMESTAMPTZ NOT NULL,
                      user_id TEXT NOT NULL,
                      session_id TEXT NOT NULL,
                      country TEXT NOT NULL,
                      query_string TEXT NOT NULL,
                      agent_response TEXT,
                      result_preview TEXT NOT NULL,
                      cost DOUBLE PRECISION NOT NULL,
                      citations JSONB NOT NULL,
                      tool_used TEXT NOT NULL,
                      judge_response JSONB NOT NULL,
                      judge_verdict TEXT NOT NULL,
                      judge_confidence DOUBLE PRECISION NOT NULL,
                      error_info TEXT NOT NULL,
                      validation_mode TEXT NOT NULL,
                      validation_attempts INTEGER NOT NULL,
                      total_time_seconds DOUBLE PRECISION NOT NULL,
                      record_hash TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_governance_audit_session
                    ON governance_audit (session_id);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::Database(format!("Failed to initialize audit schema: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditSink for PostgresAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.ensure_schema().await?;

        let citations = serde_json::to_value(&record.citations)?;
        let judge_response = serde_json::json!({
            "reasoning": record.judge_reasoning,
            "confidence": record.judge_confidence,
            "blocked": record.blocked,
        });

        sqlx::query(
            r#"
            INSERT INTO governance_audit (
              event_id, timestamp, user_id, session_id, country, query_string,
              agent_response, result_preview, cost, citations, tool_used,
              judge_response, judge_verdict, judge_confidence, error_info,
              validation_mode, validation_attempts, total_time_seconds, record_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(record.event_id)
        .bind(record.timestamp)
        .bind(&record.user_id)
        .bind(&record.session_id)
        .bind(record.country.code())
        .bind(&record.query_string)
        .bind(&record.agent_response)
        .bind(&record.result_preview)
        .bind(record.cost)
        .bind(citations)
        .bind(record.tool_used.join(","))
        .bind(judge_response)
        .bind(record.judge_verdict.to_string())
        .bind(record.judge_confidence)
        .bind(&record.error_info)
        .bind(record.validation_mode.to_string())
        .bind(record.validation_attempts as i32)
        .bind(record.total_time_seconds)
        .bind(&record.record_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestrationError::Audit(format!("Failed to append audit record: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_record(session_id: &str) -> AuditRecord {
    let cost = CostBreakdown {
        classification: 0.0,
        synthesis: 0.01,
        validation: 0.002,
        guardrails: 0.0002,
    };

    AuditRecord {
        event_id: Uuid::new_v4(),
        timestamp: Utc::now(),
        user_id: "AU001".to_string(),
        session_id: session_id.to_string(),
        country: Country::Au,
        query_string: "What is my preservation age?".to_string(),
        agent_response: Some("Your preservation age is 60 [AU-TAX-001].".to_string()),
        result_preview: "Your preservation age is 60 [AU-TAX-001].".to_string(),
        cost: cost.total(),
        cost_breakdown: cost,
        classification_method: Some(ClassificationMethod::Regex),
        citations: vec![],
        tool_used: vec!["eligibility".to_string()],
        judge_verdict: Verdict::Pass,
        judge_confidence: 0.9,
        judge_reasoning: "grounded".to_string(),
        blocked: false,
        error_info: error_info(None, &cost, Some(ClassificationMethod::Regex)),
        validation_mode: ValidationMode::LlmJudge,
        validation_attempts: 1,
        synthesis_attempts: 1,
        total_time_seconds: 0.4,
        record_hash: String::new(),
    }
    .seal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_is_append_only() {
        let sink = InMemoryAuditSink::new();
        let record = sample_record("s1");

        sink.append(&record).await.unwrap();
        assert!(sink.append(&record).await.is_err());
        assert_eq!(sink.len().await, 1);
        assert!(sink.verify_integrity(record.event_id).await);
    }

    #[test]
    fn test_tampering_breaks_hash() {
        let mut record = sample_record("s1");
        assert!(record.is_intact());

        record.cost = 0.0;
        assert!(!record.is_intact());
    }

    #[test]
    fn test_error_info_carries_cost_payload() {
        let cost = CostBreakdown {
            classification: 0.001,
            synthesis: 0.02,
            validation: 0.003,
            guardrails: 0.0002,
        };

        let text = error_info(Some("profile store down"), &cost, Some(ClassificationMethod::Llm));
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed["error"], "profile store down");
        assert_eq!(parsed["cost_breakdown"]["classification_method"], "llm");
        assert_eq!(parsed["cost_breakdown"]["total_cost"].as_f64().unwrap(), cost.total());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("₹₹₹₹", 2), "₹₹");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
