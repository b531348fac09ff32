//! Response validation
//!
//! Local rules run first and short-circuit without an LLM call when they
//! find a blocking problem. Otherwise one judge call scores the response.
//! Pass = confidence >= threshold AND no blocking violations.

use crate::country::Country;
use crate::llm::{call_with_timeout, strip_json_fence, ChatMessage, LlmClient, RateTable};
use crate::models::{Severity, ToolInvocationResult, ValidationAttempt, Violation};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const JUDGE_MAX_TOKENS: u32 = 500;
const JUDGE_TEMPERATURE: f32 = 0.1;

/// Deterministic check applied before the judge
pub trait ResponseRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, response: &str, tool_results: &[ToolInvocationResult]) -> Option<Violation>;
}

/// Rule: the response must have content
pub struct EmptyResponseRule;

impl ResponseRule for EmptyResponseRule {
    fn name(&self) -> &'static str {
        "empty_response"
    }

    fn check(&self, response: &str, _tool_results: &[ToolInvocationResult]) -> Option<Violation> {
        response
            .trim()
            .is_empty()
            .then(|| Violation::blocking("EMPTY_RESPONSE", "response has no content"))
    }
}

/// Rule: when tools returned citations, the response must carry at least one tag
pub struct CitationTagRule;

impl ResponseRule for CitationTagRule {
    fn name(&self) -> &'static str {
        "citation_tags"
    }

    fn check(&self, response: &str, tool_results: &[ToolInvocationResult]) -> Option<Violation> {
        let codes: Vec<&str> = tool_results
            .iter()
            .filter(|r| r.success)
            .flat_map(|r| r.citations.iter().map(|c| c.code.as_str()))
            .collect();

        if codes.is_empty() || codes.iter().any(|code| response.contains(&format!("[{}]", code))) {
            return None;
        }

        Some(Violation::blocking(
            "MISSING_CITATION",
            format!("cite the tool results using tags such as [{}]", codes[0]),
        ))
    }
}

pub struct ResponseValidator {
    llm: Arc<dyn LlmClient>,
    rates: RateTable,
    model: String,
    pass_threshold: f64,
    timeout: Duration,
    rules: Vec<Box<dyn ResponseRule>>,
}

impl ResponseValidator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        rates: RateTable,
        model: impl Into<String>,
        pass_threshold: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            rates,
            model: model.into(),
            pass_threshold,
            timeout,
            rules: vec![Box::new(EmptyResponseRule), Box::new(CitationTagRule)],
        }
    }

    pub fn add_rule(&mut self, rule: Box<dyn ResponseRule>) {
        self.rules.push(rule);
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn validate(
        &self,
        attempt: u32,
        query: &str,
        response: &str,
        country: Country,
        tool_results: &[ToolInvocationResult],
    ) -> ValidationAttempt {
        let start = Instant::now();

        let local: Vec<Violation> = self
            .rules
            .iter()
            .filter_map(|rule| {
                let violation = rule.check(response, tool_results);
                if violation.is_some() {
                    debug!(rule = rule.name(), attempt, "Local validation rule failed");
                }
                violation
            })
            .collect();

        if local.iter().any(|v| v.severity == Severity::Blocking) {
            return ValidationAttempt {
                attempt,
                passed: false,
                confidence: 0.0,
                reasoning: format!("Rejected before judging: {}", join_codes(&local)),
                violations: local,
                model: self.model.clone(),
                input_tokens: 0,
                output_tokens: 0,
                cost_usd: 0.0,
                duration_ms: elapsed_ms(start),
                error: None,
            };
        }

        let messages = vec![
            ChatMessage::system(judge_system_prompt(country)),
            ChatMessage::user(judge_user_prompt(query, response, tool_results)),
        ];

        let completion = match call_with_timeout(
            self.llm.as_ref(),
            &self.model,
            &messages,
            JUDGE_MAX_TOKENS,
            JUDGE_TEMPERATURE,
            self.timeout,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(attempt, error = %e, "Judge call failed");
                return ValidationAttempt {
                    attempt,
                    passed: false,
                    confidence: 0.0,
                    violations: vec![Violation::blocking("VALIDATOR_ERROR", e.to_string())],
                    reasoning: "Validator unavailable".to_string(),
                    model: self.model.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    duration_ms: elapsed_ms(start),
                    error: Some(e.to_string()),
                };
            }
        };

        let cost_usd = self
            .rates
            .cost(&self.model, completion.input_tokens, completion.output_tokens);

        let (confidence, mut violations, reasoning, error) = match parse_judge_reply(&completion.text) {
            Ok(reply) => (reply.confidence, reply.violations, reply.reasoning, None),
            Err(e) => {
                warn!(attempt, error = %e, "Judge reply unparseable");
                (
                    0.0,
                    vec![Violation::blocking("VALIDATOR_ERROR", e.clone())],
                    "Judge reply could not be parsed".to_string(),
                    Some(e),
                )
            }
        };
        violations.extend(local);

        let passed = confidence >= self.pass_threshold
            && !violations.iter().any(|v| v.severity == Severity::Blocking);

        info!(
            attempt,
            passed,
            confidence,
            violations = violations.len(),
            cost_usd,
            "Validation attempt complete"
        );

        ValidationAttempt {
            attempt,
            passed,
            confidence,
            violations,
            reasoning,
            model: self.model.clone(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            cost_usd,
            duration_ms: elapsed_ms(start),
            error,
        }
    }
}

fn judge_system_prompt(country: Country) -> String {
    let terms = country.terminology();
    format!(
        r#"You review retirement answers written for members in {name}.

Score the answer on:
1. Relevance to the question.
2. Groundedness: every number must come from the tool results.
3. Safety: no personal recommendations to buy or sell products.
4. Terminology: uses {name} terms such as {concepts}; regulators are {regulators}.
5. Citations: factual claims carry tags like [CODE] from the tool results.

Return ONLY valid JSON:
{{"passed": <bool>, "confidence": <0.0 to 1.0>, "violations": [{{"code": "<UPPER_SNAKE>", "detail": "<what to fix>", "severity": "blocking" | "advisory"}}], "reasoning": "<brief>"}}"#,
        name = terms.name,
        concepts = terms.required_concepts.join(", "),
        regulators = terms.regulators.join(", "),
    )
}

fn judge_user_prompt(query: &str, response: &str, tool_results: &[ToolInvocationResult]) -> String {
    let evidence: Vec<String> = tool_results
        .iter()
        .map(|r| {
            let tags: String = r.citations.iter().map(|c| format!("[{}]", c.code)).collect();
            if r.success {
                format!("- {} {}: {}", r.tool_id, tags, r.output)
            } else {
                format!("- {}: unavailable", r.tool_id)
            }
        })
        .collect();

    format!(
        "QUESTION:\n{}\n\nTOOL RESULTS:\n{}\n\nANSWER TO REVIEW:\n{}",
        query,
        if evidence.is_empty() { "(none)".to_string() } else { evidence.join("\n") },
        response
    )
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawViolation {
    Structured {
        code: String,
        #[serde(default)]
        detail: String,
        #[serde(default = "default_severity")]
        severity: Severity,
    },
    Plain(String),
}

fn default_severity() -> Severity {
    Severity::Blocking
}

#[derive(Debug, Deserialize)]
struct RawJudgeReply {
    confidence: f64,
    #[serde(default)]
    violations: Vec<RawViolation>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug)]
struct JudgeReply {
    confidence: f64,
    violations: Vec<Violation>,
    reasoning: String,
}

/// The reply's own `passed` field is ignored; the threshold decides.
fn parse_judge_reply(text: &str) -> Result<JudgeReply, String> {
    let raw: RawJudgeReply =
        serde_json::from_str(strip_json_fence(text)).map_err(|e| format!("invalid judge reply: {}", e))?;

    let violations = raw
        .violations
        .into_iter()
        .map(|v| match v {
            RawViolation::Structured { code, detail, severity } => Violation { code, detail, severity },
            RawViolation::Plain(detail) => Violation::blocking("JUDGE_VIOLATION", detail),
        })
        .collect();

    Ok(JudgeReply {
        confidence: raw.confidence.clamp(0.0, 1.0),
        violations,
        reasoning: raw.reasoning,
    })
}

fn join_codes(violations: &[Violation]) -> String {
    violations.iter().map(|v| v.code.as_str()).collect::<Vec<_>>().join(", ")
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
