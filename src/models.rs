//! Core data models for the advisory pipeline

use crate::country::Country;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    LlmJudge,
    Deterministic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMethod {
    Regex,
    Embedding,
    Llm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Fails validation regardless of confidence
    Blocking,
    Advisory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Blocked,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MemberNotFound,
    InternalError,
    OutputBlocked,
    NoAnswer,
}

//
// ================= Request =================
//

fn default_observability() -> bool {
    true
}

/// Inbound advisory request. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub member_id: String,
    pub session_id: String,
    pub country: Country,
    pub query: String,
    #[serde(default)]
    pub validation_mode: ValidationMode,
    #[serde(default = "default_observability")]
    pub enable_observability: bool,
}

impl QueryRequest {
    pub fn new(
        member_id: impl Into<String>,
        session_id: impl Into<String>,
        country: Country,
        query: impl Into<String>,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            session_id: session_id.into(),
            country,
            query: query.into(),
            validation_mode: ValidationMode::LlmJudge,
            enable_observability: true,
        }
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }
}

//
// ================= Member =================
//

/// Read-only snapshot of a member profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberContext {
    pub member_id: String,
    pub name: String,
    pub age: u32,
    pub country: Country,
    pub super_balance: f64,
    pub preservation_age: u32,
    pub employment_status: String,
    #[serde(default)]
    pub marital_status: Option<String>,
    #[serde(default)]
    pub other_assets: f64,
    #[serde(default)]
    pub account_based_pension: f64,
    #[serde(default)]
    pub annual_income_outside_super: f64,
    #[serde(default)]
    pub debt: f64,
    #[serde(default)]
    pub dependents: u32,
    #[serde(default)]
    pub risk_profile: Option<String>,
    #[serde(default)]
    pub home_ownership: Option<String>,
}

impl MemberContext {
    /// Profile fields that may be shown to a model. Name and id are withheld.
    pub fn safe_view(&self) -> serde_json::Value {
        serde_json::json!({
            "age": self.age,
            "country": self.country,
            "balance": self.super_balance,
            "preservation_age": self.preservation_age,
            "employment_status": self.employment_status,
            "marital_status": self.marital_status,
            "other_assets": self.other_assets,
            "account_based_pension": self.account_based_pension,
            "annual_income_outside_super": self.annual_income_outside_super,
            "debt": self.debt,
            "dependents": self.dependents,
            "risk_profile": self.risk_profile,
            "home_ownership": self.home_ownership,
        })
    }
}

//
// ================= Query Parameters =================
//

lazy_static! {
    static ref AMOUNT_RE: Regex =
        Regex::new(r"(?:[$£₹]|\b(?:aud|usd|gbp|inr|rs\.?)\s?)\s?(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d{1,2}))?\s*(k\b)?")
            .expect("valid amount regex");
}

/// Parameters stated in the query text that calculators accept
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryParams {
    pub withdrawal_amount: Option<f64>,
}

impl QueryParams {
    pub fn from_query(query: &str) -> Self {
        let lowered = query.to_lowercase();
        let withdrawal_amount = AMOUNT_RE.captures(&lowered).and_then(|caps| {
            let whole = caps.get(1)?.as_str().replace(',', "");
            let mut value: f64 = whole.parse().ok()?;
            if let Some(cents) = caps.get(2) {
                let fraction: f64 = format!("0.{}", cents.as_str()).parse().ok()?;
                value += fraction;
            }
            if caps.get(3).is_some() {
                value *= 1000.0;
            }
            Some(value)
        });

        Self { withdrawal_amount }
    }
}

//
// ================= Classification =================
//

/// Cost and outcome of one cascade stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub method: ClassificationMethod,
    pub resolved: bool,
    pub cost_usd: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Tool identifiers as issued; resolved against the registry by the executor
    pub tools: Vec<String>,
    pub confidence: f64,
    pub method: ClassificationMethod,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub stages: Vec<StageOutcome>,
    #[serde(default)]
    pub note: Option<String>,
}

//
// ================= Tools =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub code: String,
    pub authority: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub tool_id: String,
    pub tool_name: Option<String>,
    pub authority: Option<String>,
    pub citations: Vec<Citation>,
    pub output: serde_json::Value,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: f64,
}

impl ToolInvocationResult {
    /// Equality on everything except timing
    pub fn same_payload(&self, other: &ToolInvocationResult) -> bool {
        self.tool_id == other.tool_id
            && self.tool_name == other.tool_name
            && self.authority == other.authority
            && self.citations == other.citations
            && self.output == other.output
            && self.success == other.success
            && self.error == other.error
    }
}

//
// ================= Attempts =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisAttempt {
    pub attempt: u32,
    pub text: String,
    pub model: String,
    pub tool_ids: Vec<String>,
    /// Violations from the previous validation this attempt was asked to fix
    pub feedback: Vec<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub duration_ms: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub code: String,
    pub detail: String,
    pub severity: Severity,
}

impl Violation {
    pub fn blocking(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            severity: Severity::Blocking,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationAttempt {
    pub attempt: u32,
    pub passed: bool,
    pub confidence: f64,
    pub violations: Vec<Violation>,
    pub reasoning: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub duration_ms: f64,
    pub error: Option<String>,
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub verdict: Verdict,
    pub passed: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub violations: Vec<Violation>,
    pub validation_mode: ValidationMode,
    pub attempts: u32,
}

impl JudgeVerdict {
    pub fn from_attempt(attempt: &ValidationAttempt, mode: ValidationMode, attempts: u32) -> Self {
        Self {
            verdict: if attempt.passed { Verdict::Pass } else { Verdict::Fail },
            passed: attempt.passed,
            confidence: attempt.confidence,
            reasoning: attempt.reasoning.clone(),
            violations: attempt.violations.clone(),
            validation_mode: mode,
            attempts,
        }
    }

    /// Verdict used when the judge is bypassed
    pub fn deterministic_pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            passed: true,
            confidence: 1.0,
            reasoning: "Deterministic validation".to_string(),
            violations: vec![],
            validation_mode: ValidationMode::Deterministic,
            attempts: 0,
        }
    }
}

/// Cost per phase in USD. `total()` is the only way totals are computed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CostBreakdown {
    pub classification: f64,
    pub synthesis: f64,
    pub validation: f64,
    pub guardrails: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.classification + self.synthesis + self.validation + self.guardrails
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryResponse {
    pub session_id: String,
    pub answer: Option<String>,
    pub citations: Vec<Citation>,
    pub judge_verdict: JudgeVerdict,
    pub tools_called: Vec<String>,
    pub cost: f64,
    pub cost_breakdown: CostBreakdown,
    pub validation_mode: ValidationMode,
    pub blocked: bool,
    pub violations: Vec<String>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub classification_method: Option<ClassificationMethod>,
    pub synthesis_attempts: u32,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_timings: Option<Vec<PhaseTiming>>,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationMode::LlmJudge => "llm_judge",
            ValidationMode::Deterministic => "deterministic",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ClassificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClassificationMethod::Regex => "regex",
            ClassificationMethod::Embedding => "embedding",
            ClassificationMethod::Llm => "llm",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pass => "Pass",
            Verdict::Fail => "Fail",
            Verdict::Blocked => "Blocked",
            Verdict::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdrawal_amount_extraction() {
        let cases = vec![
            ("How much tax will I pay on a $50,000 withdrawal?", Some(50_000.0)),
            ("Can I take out £12,500.50 this year?", Some(12_500.5)),
            ("What if I withdraw $20k?", Some(20_000.0)),
            ("Withdraw ₹500000 from EPF", Some(500_000.0)),
            ("What is my preservation age?", None),
        ];

        for (query, expected) in cases {
            assert_eq!(QueryParams::from_query(query).withdrawal_amount, expected, "{}", query);
        }
    }

    #[test]
    fn test_request_defaults() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"member_id":"AU001","session_id":"s1","country":"AU","query":"hi"}"#,
        )
        .unwrap();
        assert_eq!(request.validation_mode, ValidationMode::LlmJudge);
        assert!(request.enable_observability);
    }

    #[test]
    fn test_safe_view_withholds_identity() {
        let member = MemberContext {
            member_id: "AU001".to_string(),
            name: "Jane Citizen".to_string(),
            age: 58,
            country: Country::Au,
            super_balance: 420_000.0,
            preservation_age: 60,
            employment_status: "Full-time".to_string(),
            marital_status: None,
            other_assets: 0.0,
            account_based_pension: 0.0,
            annual_income_outside_super: 0.0,
            debt: 0.0,
            dependents: 0,
            risk_profile: None,
            home_ownership: None,
        };

        let view = member.safe_view().to_string();
        assert!(!view.contains("Jane"));
        assert!(!view.contains("AU001"));
        assert!(view.contains("420000"));
    }
}
