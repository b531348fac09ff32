//! Runtime configuration
//!
//! Everything is read from the environment once at startup. Binaries call
//! `dotenv::dotenv()` first so a local `.env` file is honoured.

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Hard upper bound on judge rounds per request
pub const MAX_VALIDATION_ATTEMPTS: u32 = 3;

const _: () = assert!(MAX_VALIDATION_ATTEMPTS >= 1);

#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub serving_base_url: Option<String>,
    pub serving_token: Option<String>,

    pub synthesis_model: String,
    pub judge_model: String,
    pub classifier_model: String,

    pub validation_pass_threshold: f64,
    pub toxicity_threshold: f64,
    pub max_validation_attempts: u32,

    pub embedding_similarity_threshold: f64,
    pub embedding_margin: f64,
    /// Flat charge per stage-2 lookup
    pub embedding_cost_usd: f64,

    pub llm_timeout: Duration,
    pub classifier_timeout: Duration,
    pub tool_timeout: Duration,

    pub guardrails_enabled: bool,
    pub audit_workers: usize,

    pub capability_registry_path: Option<String>,
    pub calculator_base_url: Option<String>,
    pub database_url: Option<String>,
    pub port: u16,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            serving_base_url: None,
            serving_token: None,
            synthesis_model: "claude-opus-4-1".to_string(),
            judge_model: "claude-sonnet-4".to_string(),
            classifier_model: "gpt-oss-120b".to_string(),
            validation_pass_threshold: 0.70,
            toxicity_threshold: 0.70,
            max_validation_attempts: MAX_VALIDATION_ATTEMPTS,
            embedding_similarity_threshold: 0.45,
            embedding_margin: 0.05,
            embedding_cost_usd: 0.00001,
            llm_timeout: Duration::from_secs(30),
            classifier_timeout: Duration::from_secs(10),
            tool_timeout: Duration::from_secs(15),
            guardrails_enabled: true,
            audit_workers: 2,
            capability_registry_path: None,
            calculator_base_url: None,
            database_url: None,
            port: 8080,
        }
    }
}

impl AdvisorConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_attempts: u32 = parse_var("MAX_VALIDATION_ATTEMPTS", defaults.max_validation_attempts)?;

        Ok(Self {
            serving_base_url: optional_var("SERVING_ENDPOINT_BASE_URL"),
            serving_token: optional_var("SERVING_ENDPOINT_TOKEN"),
            synthesis_model: optional_var("SYNTHESIS_MODEL").unwrap_or(defaults.synthesis_model),
            judge_model: optional_var("JUDGE_MODEL").unwrap_or(defaults.judge_model),
            classifier_model: optional_var("CLASSIFIER_MODEL").unwrap_or(defaults.classifier_model),
            validation_pass_threshold: unit_interval(
                "VALIDATION_PASS_THRESHOLD",
                parse_var("VALIDATION_PASS_THRESHOLD", defaults.validation_pass_threshold)?,
            )?,
            toxicity_threshold: unit_interval(
                "TOXICITY_THRESHOLD",
                parse_var("TOXICITY_THRESHOLD", defaults.toxicity_threshold)?,
            )?,
            max_validation_attempts: max_attempts.clamp(1, MAX_VALIDATION_ATTEMPTS),
            embedding_similarity_threshold: unit_interval(
                "EMBEDDING_SIMILARITY_THRESHOLD",
                parse_var("EMBEDDING_SIMILARITY_THRESHOLD", defaults.embedding_similarity_threshold)?,
            )?,
            embedding_margin: parse_var("EMBEDDING_MARGIN", defaults.embedding_margin)?,
            embedding_cost_usd: defaults.embedding_cost_usd,
            llm_timeout: Duration::from_secs(parse_var("LLM_TIMEOUT_SECS", 30u64)?),
            classifier_timeout: Duration::from_secs(parse_var("CLASSIFIER_TIMEOUT_SECS", 10u64)?),
            tool_timeout: Duration::from_secs(parse_var("TOOL_TIMEOUT_SECS", 15u64)?),
            guardrails_enabled: parse_bool("GUARDRAILS_ENABLED", defaults.guardrails_enabled)?,
            audit_workers: parse_var("AUDIT_WORKERS", defaults.audit_workers)?.max(1),
            capability_registry_path: optional_var("CAPABILITY_REGISTRY_PATH"),
            calculator_base_url: optional_var("CALCULATOR_API_BASE_URL"),
            database_url: optional_var("POSTGRES_URL").or_else(|| optional_var("DATABASE_URL")),
            port: match optional_var("PORT").or_else(|| optional_var("API_PORT")) {
                Some(raw) => raw.parse().map_err(|_| {
                    OrchestrationError::Config(format!("PORT must be a port number, got '{}'", raw))
                })?,
                None => defaults.port,
            },
        })
    }

    /// Attempts actually allowed per request
    pub fn validation_attempt_limit(&self) -> u32 {
        self.max_validation_attempts.clamp(1, MAX_VALIDATION_ATTEMPTS)
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match optional_var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            OrchestrationError::Config(format!("{} has an invalid value: '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match optional_var(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(OrchestrationError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, v
        ))),
    }
}

fn unit_interval(key: &str, value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(OrchestrationError::Config(format!(
            "{} must be within [0, 1], got {}",
            key, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdvisorConfig::default();
        assert_eq!(config.validation_attempt_limit(), 3);
        assert!((config.validation_pass_threshold - 0.70).abs() < f64::EPSILON);
        assert!(config.guardrails_enabled);
    }

    #[test]
    fn test_attempt_limit_is_clamped() {
        let config = AdvisorConfig {
            max_validation_attempts: 10,
            ..AdvisorConfig::default()
        };
        assert_eq!(config.validation_attempt_limit(), MAX_VALIDATION_ATTEMPTS);

        let config = AdvisorConfig {
            max_validation_attempts: 0,
            ..AdvisorConfig::default()
        };
        assert_eq!(config.validation_attempt_limit(), 1);
    }

    #[test]
    fn test_unit_interval_rejects_out_of_range() {
        assert!(unit_interval("X", 1.5).is_err());
        assert!(unit_interval("X", 0.7).is_ok());
    }
}
