//! Safety guardrail filter
//!
//! Deterministic pre- and post-checks on free text. Input checks run in a
//! fixed order (PII, toxicity, prompt injection, jailbreak) and any hit
//! blocks the request. Output checks mask PII, block toxic text, and flag
//! answers that look ungrounded.
//!
//! No LLM is involved here.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

/// Replacement for every PII match in output text
pub const REDACTION_TOKEN: &str = "[REDACTED]";

/// Estimated cost of one guardrail pass when any policy applies
pub const GUARDRAIL_CHECK_COST_USD: f64 = 0.0001;

const TOXIC_WEIGHT_PER_HIT: f64 = 0.3;
const MIN_GROUNDED_LENGTH: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailPolicy {
    Pii,
    Toxicity,
    PromptInjection,
    Jailbreak,
    PiiMasking,
    Groundedness,
}

pub const DEFAULT_INPUT_POLICIES: &[GuardrailPolicy] = &[
    GuardrailPolicy::Pii,
    GuardrailPolicy::Toxicity,
    GuardrailPolicy::PromptInjection,
    GuardrailPolicy::Jailbreak,
];

pub const DEFAULT_OUTPUT_POLICIES: &[GuardrailPolicy] = &[
    GuardrailPolicy::PiiMasking,
    GuardrailPolicy::Toxicity,
    GuardrailPolicy::Groundedness,
];

lazy_static! {
    static ref PII_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
        ("email", r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b"),
        ("phone", r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b"),
        ("credit_card", r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b"),
        ("australian_tfn", r"\b\d{3}\s?\d{3}\s?\d{3}\b"),
        ("australian_medicare", r"\b\d{4}\s?\d{5}\s?\d\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid PII pattern")))
    .collect();

    static ref TOXIC_RE: Regex = Regex::new(
        r"(?i)\b(stupid|idiot|moron|dumb|hate|damn|shit|fuck|ass|bastard|bitch)\b"
    )
    .expect("valid toxicity pattern");

    static ref INJECTION_RE: Regex = Regex::new(
        r"(?i)(ignore\s+previous\s+instructions?|ignore\s+all\s+previous|disregard\s+previous|forget\s+previous|you\s+are\s+now\s+(a|an|the)\b|new\s+instructions?|system\s+prompt|reveal\s+(your|the)\s+prompt)"
    )
    .expect("valid injection pattern");

    static ref JAILBREAK_RE: Regex = Regex::new(
        r"(?i)(you\s+are\s+now\s+DAN|do\s+anything\s+now|break\s+out\s+of|override\s+safety|disable\s+safety|bypass\s+restrictions?)"
    )
    .expect("valid jailbreak pattern");
}

const HEDGING_PHRASES: &[&str] = &["i don't know", "i'm not sure", "i cannot", "error", "failed"];

/// Category of a guardrail finding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    Pii,
    Toxicity,
    PromptInjection,
    Jailbreak,
    Groundedness,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardrailViolation {
    pub category: ViolationCategory,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub blocked: bool,
    pub violations: Vec<GuardrailViolation>,
    /// Output checks only
    pub masked_text: Option<String>,
    pub latency_ms: f64,
    pub cost_usd: f64,
    pub policies: Vec<GuardrailPolicy>,
}

impl GuardrailVerdict {
    fn pass_through(masked_text: Option<String>) -> Self {
        Self {
            blocked: false,
            violations: vec![],
            masked_text,
            latency_ms: 0.0,
            cost_usd: 0.0,
            policies: vec![],
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.message.clone()).collect()
    }

    /// Distinct categories in detection order
    pub fn categories(&self) -> Vec<ViolationCategory> {
        let mut out = Vec::new();
        for v in &self.violations {
            if !out.contains(&v.category) {
                out.push(v.category);
            }
        }
        out
    }
}

/// Pattern based safety filter
#[derive(Debug, Clone)]
pub struct SafetyGuardrails {
    enabled: bool,
    toxicity_threshold: f64,
}

impl SafetyGuardrails {
    pub fn new(enabled: bool, toxicity_threshold: f64) -> Self {
        Self {
            enabled,
            toxicity_threshold,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn validate_input(&self, text: &str, policies: &[GuardrailPolicy]) -> GuardrailVerdict {
        if !self.enabled {
            return GuardrailVerdict::pass_through(None);
        }

        let start = Instant::now();
        let mut violations = Vec::new();

        if policies.contains(&GuardrailPolicy::Pii) {
            for pii_type in detect_pii(text) {
                violations.push(GuardrailViolation {
                    category: ViolationCategory::Pii,
                    message: format!("PII detected: {}", pii_type),
                });
            }
        }

        if policies.contains(&GuardrailPolicy::Toxicity) {
            let score = toxicity_score(text);
            if score >= self.toxicity_threshold {
                violations.push(GuardrailViolation {
                    category: ViolationCategory::Toxicity,
                    message: format!("Toxic content (score: {:.2})", score),
                });
            }
        }

        if policies.contains(&GuardrailPolicy::PromptInjection) && INJECTION_RE.is_match(text) {
            violations.push(GuardrailViolation {
                category: ViolationCategory::PromptInjection,
                message: "Prompt injection detected".to_string(),
            });
        }

        if policies.contains(&GuardrailPolicy::Jailbreak) && JAILBREAK_RE.is_match(text) {
            violations.push(GuardrailViolation {
                category: ViolationCategory::Jailbreak,
                message: "Jailbreak attempt detected".to_string(),
            });
        }

        let blocked = !violations.is_empty();
        if blocked {
            warn!(violations = ?violations.iter().map(|v| &v.message).collect::<Vec<_>>(), "Input blocked");
        }

        GuardrailVerdict {
            blocked,
            violations,
            masked_text: None,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            cost_usd: policy_cost(policies),
            policies: policies.to_vec(),
        }
    }

    pub fn validate_output(&self, text: &str, policies: &[GuardrailPolicy]) -> GuardrailVerdict {
        if !self.enabled {
            return GuardrailVerdict::pass_through(Some(text.to_string()));
        }

        let start = Instant::now();
        let mut violations = Vec::new();
        let mut masked_text = text.to_string();
        let mut blocked = false;

        if policies.contains(&GuardrailPolicy::PiiMasking) || policies.contains(&GuardrailPolicy::Pii) {
            let found = detect_pii(text);
            if !found.is_empty() {
                masked_text = mask_pii(text);
                violations.push(GuardrailViolation {
                    category: ViolationCategory::Pii,
                    message: format!("PII masked: {}", found.join(", ")),
                });
            }
        }

        if policies.contains(&GuardrailPolicy::Toxicity) {
            let score = toxicity_score(text);
            if score >= self.toxicity_threshold {
                blocked = true;
                violations.push(GuardrailViolation {
                    category: ViolationCategory::Toxicity,
                    message: format!("Toxic output (score: {:.2})", score),
                });
            }
        }

        if policies.contains(&GuardrailPolicy::Groundedness) && !looks_grounded(text) {
            violations.push(GuardrailViolation {
                category: ViolationCategory::Groundedness,
                message: "Response may not be grounded in facts".to_string(),
            });
        }

        if !violations.is_empty() {
            info!(blocked, violations = ?violations.iter().map(|v| &v.message).collect::<Vec<_>>(), "Output validation");
        }

        GuardrailVerdict {
            blocked,
            violations,
            masked_text: Some(masked_text),
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            cost_usd: policy_cost(policies),
            policies: policies.to_vec(),
        }
    }
}

fn policy_cost(policies: &[GuardrailPolicy]) -> f64 {
    if policies.is_empty() {
        0.0
    } else {
        GUARDRAIL_CHECK_COST_USD
    }
}

/// Names of the PII kinds present in `text`
pub fn detect_pii(text: &str) -> Vec<&'static str> {
    PII_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
        .collect()
}

pub fn mask_pii(text: &str) -> String {
    PII_PATTERNS
        .iter()
        .fold(text.to_string(), |acc, (_, re)| re.replace_all(&acc, REDACTION_TOKEN).into_owned())
}

/// Keyword density score in [0, 1]
pub fn toxicity_score(text: &str) -> f64 {
    let hits = TOXIC_RE.find_iter(text).count() as f64;
    (hits * TOXIC_WEIGHT_PER_HIT).min(1.0)
}

fn looks_grounded(text: &str) -> bool {
    if text.trim().len() < MIN_GROUNDED_LENGTH {
        return false;
    }
    let lowered = text.to_lowercase();
    !HEDGING_PHRASES.iter().any(|p| lowered.contains(p))
}
