//! Response synthesis
//!
//! Turns the question, the member-safe profile view and tool results into
//! prose with inline citation tags. The model never sees the member's name or
//! id; it addresses the member as [`MEMBER_NAME_TOKEN`], which the
//! orchestrator swaps for the real name after output guardrails.

use crate::country::Country;
use crate::llm::{call_with_timeout, ChatMessage, LlmClient, RateTable};
use crate::models::{MemberContext, SynthesisAttempt, ToolInvocationResult, Violation};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const MEMBER_NAME_TOKEN: &str = "[MEMBER_NAME]";

const SYNTHESIS_MAX_TOKENS: u32 = 1500;
const SYNTHESIS_TEMPERATURE: f32 = 0.2;

pub struct ResponseSynthesizer {
    llm: Arc<dyn LlmClient>,
    rates: RateTable,
    model: String,
    timeout: Duration,
}

impl ResponseSynthesizer {
    pub fn new(llm: Arc<dyn LlmClient>, rates: RateTable, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            rates,
            model: model.into(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One synthesis attempt. LLM failure yields an empty attempt with an error marker.
    pub async fn synthesize(
        &self,
        attempt: u32,
        query: &str,
        country: Country,
        member: &MemberContext,
        tool_results: &[ToolInvocationResult],
        prior_feedback: Option<&[Violation]>,
    ) -> SynthesisAttempt {
        let start = Instant::now();
        let feedback: Vec<String> = prior_feedback
            .map(|violations| violations.iter().map(|v| v.to_string()).collect())
            .unwrap_or_default();

        let messages = vec![
            ChatMessage::system(system_prompt(country)),
            ChatMessage::user(user_prompt(query, member, tool_results, &feedback)),
        ];

        let tool_ids = tool_results.iter().map(|r| r.tool_id.clone()).collect();

        match call_with_timeout(
            self.llm.as_ref(),
            &self.model,
            &messages,
            SYNTHESIS_MAX_TOKENS,
            SYNTHESIS_TEMPERATURE,
            self.timeout,
        )
        .await
        {
            Ok(completion) => {
                let cost_usd = self
                    .rates
                    .cost(&self.model, completion.input_tokens, completion.output_tokens);
                debug!(attempt, input_tokens = completion.input_tokens, output_tokens = completion.output_tokens, cost_usd, "Synthesis attempt complete");

                SynthesisAttempt {
                    attempt,
                    text: completion.text.trim().to_string(),
                    model: self.model.clone(),
                    tool_ids,
                    feedback,
                    input_tokens: completion.input_tokens,
                    output_tokens: completion.output_tokens,
                    cost_usd,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    error: None,
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "Synthesis attempt failed");
                SynthesisAttempt {
                    attempt,
                    text: String::new(),
                    model: self.model.clone(),
                    tool_ids,
                    feedback,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn system_prompt(country: Country) -> String {
    let terms = country.terminology();
    format!(
        r#"You are a {title} helping a member in {name}.

Rules:
- Address the member only as {token}. Never invent a name.
- Every factual claim must carry a citation tag such as [{example}] taken from the tool results.
- Repeat numbers exactly as they appear in the tool results. Do not round or recompute them.
- Use {name} terminology: {account} and {balance}; amounts in {currency} ({symbol}).
- If a tool failed, say that figure is unavailable rather than guessing.
- Keep the answer concise and educational. This is general information, not personal advice."#,
        title = terms.advisor_title,
        name = terms.name,
        token = MEMBER_NAME_TOKEN,
        example = format!("{}-TAX-001", country.code()),
        account = terms.retirement_account_term,
        balance = terms.balance_term,
        currency = terms.currency,
        symbol = terms.currency_symbol,
    )
}

fn user_prompt(
    query: &str,
    member: &MemberContext,
    tool_results: &[ToolInvocationResult],
    feedback: &[String],
) -> String {
    let mut prompt = String::new();

    prompt.push_str("MEMBER PROFILE:\n");
    prompt.push_str(&member.safe_view().to_string());
    prompt.push_str("\n\nTOOL RESULTS:\n");

    if tool_results.is_empty() {
        prompt.push_str("(no calculators were run)\n");
    }
    for result in tool_results {
        prompt.push_str(&format!("- {} ", result.tool_name.as_deref().unwrap_or(&result.tool_id)));
        prompt.push_str(&citation_tags(result));
        if result.success {
            prompt.push_str(&format!(": {}\n", result.output));
        } else {
            prompt.push_str(&format!(
                ": FAILED ({})\n",
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    prompt.push_str(&format!("\nQUESTION:\n{}\n", query));

    if !feedback.is_empty() {
        prompt.push_str("\nYour previous answer was rejected for these reasons. Address each one:\n");
        for item in feedback {
            prompt.push_str(&format!("- {}\n", item));
        }
    }

    prompt
}

fn citation_tags(result: &ToolInvocationResult) -> String {
    result
        .citations
        .iter()
        .map(|c| format!("[{}]", c.code))
        .collect::<Vec<_>>()
        .join("")
}

fn humanize(key: &str) -> String {
    key.replace('_', " ")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "n/a".to_string(),
        other => other.to_string(),
    }
}

/// Template answer built from tool results alone, used in deterministic mode
pub fn render_deterministic(country: Country, tool_results: &[ToolInvocationResult]) -> String {
    let terms = country.terminology();
    let successful: Vec<&ToolInvocationResult> = tool_results.iter().filter(|r| r.success).collect();

    if successful.is_empty() {
        return format!(
            "{}, none of the {} calculators could answer this question right now.",
            MEMBER_NAME_TOKEN, terms.name
        );
    }

    let mut out = format!("{}, here is what the {} calculators show:\n", MEMBER_NAME_TOKEN, terms.name);

    for result in successful {
        let label = result.tool_name.as_deref().unwrap_or(&result.tool_id);
        out.push_str(&format!("\n{} {}\n", label, citation_tags(result)));

        match &result.output {
            Value::Object(fields) => {
                for (key, value) in fields {
                    out.push_str(&format!("- {}: {}\n", humanize(key), render_value(value)));
                }
            }
            other => out.push_str(&format!("- {}\n", render_value(other))),
        }
    }

    for result in tool_results.iter().filter(|r| !r.success) {
        out.push_str(&format!("\n{} is unavailable.\n", result.tool_id));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::models::Citation;
    use crate::profile::sample_members;

    fn au_member() -> MemberContext {
        sample_members().into_iter().find(|m| m.country == Country::Au).unwrap()
    }

    fn eligibility_result() -> ToolInvocationResult {
        ToolInvocationResult {
            tool_id: "eligibility".to_string(),
            tool_name: Some("Preservation Age Check".to_string()),
            authority: Some("Australian Taxation Office".to_string()),
            citations: vec![Citation {
                code: "AU-TAX-001".to_string(),
                authority: "Australian Taxation Office".to_string(),
                title: "Superannuation lump sum taxation rules".to_string(),
                url: None,
            }],
            output: serde_json::json!({"preservation_age": 60, "can_access": false}),
            success: true,
            error: None,
            duration_ms: 1.0,
        }
    }

    fn synthesizer(llm: Arc<ScriptedLlmClient>) -> ResponseSynthesizer {
        ResponseSynthesizer::new(llm, RateTable::default(), "claude-opus-4-1", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_prompt_is_anonymized_and_tagged() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_text("claude-opus-4-1", "[MEMBER_NAME], your preservation age is 60 [AU-TAX-001].");
        let member = au_member();

        let attempt = synthesizer(llm.clone())
            .synthesize(1, "What is my preservation age?", Country::Au, &member, &[eligibility_result()], None)
            .await;

        assert!(attempt.error.is_none());
        assert!(attempt.cost_usd > 0.0);
        let prompt = &llm.prompts_for("claude-opus-4-1")[0];
        assert!(prompt.contains("[AU-TAX-001]"));
        assert!(prompt.contains("superannuation"));
        assert!(!prompt.contains(&member.name));
        assert!(!prompt.contains(&member.member_id));
    }

    #[tokio::test]
    async fn test_feedback_is_carried_into_retry_prompt() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.set_fallback("claude-opus-4-1", "answer");
        let feedback = vec![Violation::blocking("MISSING_CITATION", "no citation tags")];

        let attempt = synthesizer(llm.clone())
            .synthesize(2, "q", Country::Au, &au_member(), &[eligibility_result()], Some(&feedback))
            .await;

        assert_eq!(attempt.feedback, vec!["MISSING_CITATION: no citation tags".to_string()]);
        assert!(llm.prompts_for("claude-opus-4-1")[0].contains("MISSING_CITATION"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_not_fatal() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_error("claude-opus-4-1", "overloaded");

        let attempt = synthesizer(llm)
            .synthesize(1, "q", Country::Au, &au_member(), &[], None)
            .await;

        assert!(attempt.text.is_empty());
        assert!(attempt.error.unwrap().contains("overloaded"));
        assert_eq!(attempt.cost_usd, 0.0);
    }

    #[test]
    fn test_deterministic_render() {
        let mut failed = eligibility_result();
        failed.tool_id = "tax".to_string();
        failed.success = false;

        let text = render_deterministic(Country::Au, &[eligibility_result(), failed]);
        assert!(text.starts_with(MEMBER_NAME_TOKEN));
        assert!(text.contains("preservation age: 60"));
        assert!(text.contains("[AU-TAX-001]"));
        assert!(text.contains("tax is unavailable"));
    }
}
