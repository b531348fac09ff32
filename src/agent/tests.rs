use super::*;
use crate::audit::{AuditSink, InMemoryAuditSink};
use crate::country::Country;
use crate::guardrails::GUARDRAIL_CHECK_COST_USD;
use crate::llm::ScriptedLlmClient;
use crate::profile::{sample_members, InMemoryProfileStore};
use crate::tools::ReferenceCalculator;

const SYNTH: &str = "claude-opus-4-1";
const JUDGE: &str = "claude-sonnet-4";

struct Harness {
    orchestrator: Arc<Orchestrator>,
    llm: Arc<ScriptedLlmClient>,
    sink: Arc<InMemoryAuditSink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(AdvisorConfig::default())
    }

    fn with_config(config: AdvisorConfig) -> Self {
        let llm = Arc::new(ScriptedLlmClient::new());
        let sink = Arc::new(InMemoryAuditSink::new());
        let emitter = Arc::new(AuditEmitter::spawn(sink.clone() as Arc<dyn AuditSink>, 2));

        let orchestrator = Orchestrator::new(
            config,
            llm.clone(),
            Arc::new(CapabilityRegistry::bundled().unwrap()),
            Arc::new(ReferenceCalculator::new()),
            Arc::new(InMemoryProfileStore::with_members(sample_members())),
            emitter,
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            llm,
            sink,
        }
    }

    async fn drain(&self) -> Vec<AuditRecord> {
        self.orchestrator.audit_emitter().shutdown().await;
        self.sink.all().await
    }
}

fn judge_reply(confidence: f64) -> String {
    format!(
        r#"{{"passed": {}, "confidence": {}, "violations": [], "reasoning": "scored {}"}}"#,
        confidence >= 0.7,
        confidence,
        confidence
    )
}

fn preservation_request() -> QueryRequest {
    QueryRequest::new("AU001", "session-au", Country::Au, "What is my preservation age?")
}

fn assert_cost_additive(response: &AdvisoryResponse) {
    let b = response.cost_breakdown;
    assert_eq!(response.cost, b.classification + b.synthesis + b.validation + b.guardrails);
}

#[tokio::test]
async fn test_ssn_query_is_blocked_before_any_llm_call() {
    let h = Harness::new();
    let request = QueryRequest::new(
        "US001",
        "session-us",
        Country::Us,
        "My SSN is 123-45-6789, how much tax will I pay?",
    );

    let response = h.orchestrator.run(request).await;

    assert!(response.blocked);
    assert!(response.answer.is_none());
    assert_eq!(response.error.as_deref(), Some(INPUT_BLOCKED_MESSAGE));
    assert!(response.violations.iter().any(|v| v.contains("ssn")));
    assert_eq!(response.judge_verdict.verdict, Verdict::Blocked);
    assert_eq!(response.cost_breakdown.classification, 0.0);
    assert_eq!(response.cost_breakdown.synthesis, 0.0);
    assert_eq!(response.cost_breakdown.validation, 0.0);
    assert!(response.cost_breakdown.guardrails > 0.0);
    assert!(response.tools_called.is_empty());
    assert_eq!(h.llm.total_calls(), 0);
    assert_cost_additive(&response);

    let records = h.drain().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].judge_verdict, Verdict::Blocked);
    assert!(records[0].blocked);
    assert_eq!(records[0].cost, records[0].cost_breakdown.guardrails);
}

#[tokio::test]
async fn test_ssn_balance_question_costs_only_the_input_check() {
    let h = Harness::new();
    let request = QueryRequest::new(
        "AU001",
        "session-au-ssn",
        Country::Au,
        "My SSN is 123-45-6789, what's my balance?",
    );

    let response = h.orchestrator.run(request).await;

    assert!(response.blocked);
    assert!(response.answer.is_none());
    assert!(response.citations.is_empty());
    assert!((response.cost - GUARDRAIL_CHECK_COST_USD).abs() < 1e-12);
    assert_eq!(h.llm.total_calls(), 0);

    let records = h.drain().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].country, Country::Au);
    assert!((records[0].cost - GUARDRAIL_CHECK_COST_USD).abs() < 1e-12);
}

#[tokio::test]
async fn test_preservation_age_passes_first_attempt() {
    let h = Harness::new();
    h.llm.push_text(SYNTH, "[MEMBER_NAME], your preservation age is 60 [AU-TAX-001].");
    h.llm.push_text(JUDGE, judge_reply(0.92));

    let response = h.orchestrator.run(preservation_request()).await;

    let answer = response.answer.clone().unwrap();
    assert!(answer.contains("60"));
    assert!(answer.starts_with("Olivia Harris"));
    assert!(!answer.contains(MEMBER_NAME_TOKEN));
    assert_eq!(response.classification_method, Some(ClassificationMethod::Regex));
    assert_eq!(response.tools_called, vec!["eligibility".to_string()]);
    assert_eq!(response.citations[0].code, "AU-TAX-001");
    assert_eq!(response.judge_verdict.verdict, Verdict::Pass);
    assert_eq!(response.judge_verdict.attempts, 1);
    assert_eq!(response.synthesis_attempts, 1);
    assert!(response.error.is_none());
    assert_eq!(h.llm.call_count("gpt-oss-120b"), 0);
    assert_cost_additive(&response);

    let synthesis_prompt = &h.llm.prompts_for(SYNTH)[0];
    assert!(!synthesis_prompt.contains("Olivia Harris"));
    assert!(!synthesis_prompt.contains("AU001"));

    let records = h.drain().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].is_intact());
    assert_eq!(records[0].tool_used, vec!["eligibility".to_string()]);
    assert!(records[0].error_info.contains("\"classification_method\":\"regex\""));
}

#[tokio::test]
async fn test_missing_citation_triggers_one_retry_with_feedback() {
    let h = Harness::new();
    h.llm.push_text(SYNTH, "[MEMBER_NAME], your preservation age is 60.");
    h.llm.push_text(SYNTH, "[MEMBER_NAME], your preservation age is 60 [AU-TAX-001].");
    h.llm.push_text(JUDGE, judge_reply(0.88));

    let response = h.orchestrator.run(preservation_request()).await;

    assert_eq!(response.synthesis_attempts, 2);
    assert_eq!(response.judge_verdict.attempts, 2);
    assert!(response.judge_verdict.passed);
    assert!(response.answer.unwrap().contains("[AU-TAX-001]"));

    let prompts = h.llm.prompts_for(SYNTH);
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("MISSING_CITATION"));
    assert!(prompts[1].contains("MISSING_CITATION"));
}

#[tokio::test]
async fn test_deterministic_mode_skips_synthesis_and_judge() {
    let h = Harness::new();
    let request = preservation_request().with_validation_mode(ValidationMode::Deterministic);

    let response = h.orchestrator.run(request).await;

    assert_eq!(response.synthesis_attempts, 0);
    assert_eq!(response.judge_verdict.attempts, 0);
    assert_eq!(response.judge_verdict.confidence, 1.0);
    assert_eq!(response.judge_verdict.verdict, Verdict::Pass);
    assert_eq!(response.validation_mode, ValidationMode::Deterministic);
    assert_eq!(response.cost_breakdown.synthesis, 0.0);
    assert_eq!(response.cost_breakdown.validation, 0.0);
    assert_eq!(h.llm.total_calls(), 0);

    let answer = response.answer.clone().unwrap();
    assert!(answer.contains("preservation age: 60"));
    assert!(answer.contains("Olivia Harris"));
    assert_cost_additive(&response);

    let records = h.drain().await;
    assert_eq!(records[0].validation_attempts, 0);
    assert_eq!(records[0].synthesis_attempts, 0);
}

#[tokio::test]
async fn test_retry_budget_is_bounded_and_best_attempt_delivered() {
    let config = AdvisorConfig {
        max_validation_attempts: 10,
        ..AdvisorConfig::default()
    };
    let h = Harness::with_config(config);
    h.llm.push_text(SYNTH, "Attempt one: preservation age 60 [AU-TAX-001].");
    h.llm.push_text(SYNTH, "Attempt two: preservation age 60 [AU-TAX-001].");
    h.llm.push_text(SYNTH, "Attempt three: preservation age 60 [AU-TAX-001].");
    h.llm.push_text(JUDGE, judge_reply(0.4));
    h.llm.push_text(JUDGE, judge_reply(0.6));
    h.llm.push_text(JUDGE, judge_reply(0.6));

    let response = h.orchestrator.run(preservation_request()).await;

    assert_eq!(response.synthesis_attempts, 3);
    assert_eq!(response.judge_verdict.attempts, 3);
    assert_eq!(response.judge_verdict.verdict, Verdict::Fail);
    assert!(response.error.is_none());
    // Tie between attempts two and three goes to the later one
    assert!(response.answer.unwrap().starts_with("Attempt three"));
    assert!(h.llm.prompts_for(SYNTH)[1].contains("LOW_CONFIDENCE"));
}

#[tokio::test]
async fn test_uncited_answer_beats_later_empty_attempts() {
    let h = Harness::new();
    h.llm.push_text(SYNTH, "[MEMBER_NAME], your preservation age is 60.");
    h.llm.push_error(SYNTH, "endpoint overloaded");
    h.llm.push_error(SYNTH, "endpoint overloaded");

    let response = h.orchestrator.run(preservation_request()).await;

    assert_eq!(response.synthesis_attempts, 3);
    assert_eq!(response.error_code, None);
    assert!(response.answer.unwrap().contains("preservation age is 60"));
    // Verdict belongs to the delivered attempt
    assert_eq!(response.judge_verdict.verdict, Verdict::Fail);
    assert!(response
        .judge_verdict
        .violations
        .iter()
        .any(|v| v.code == "MISSING_CITATION"));
    assert_eq!(h.llm.call_count(JUDGE), 0);
}

#[tokio::test]
async fn test_cross_country_request_uses_request_country_rules() {
    let h = Harness::new();
    let request = QueryRequest::new("US001", "session-mixed", Country::Au, "What is my preservation age?")
        .with_validation_mode(ValidationMode::Deterministic);

    let response = h.orchestrator.run(request).await;

    assert_eq!(response.citations[0].code, "AU-TAX-001");
    assert!(response.answer.unwrap().contains("preservation age: 60"));
}

#[tokio::test]
async fn test_all_synthesis_failures_yield_no_answer() {
    let h = Harness::new();
    for _ in 0..3 {
        h.llm.push_error(SYNTH, "endpoint overloaded");
    }

    let response = h.orchestrator.run(preservation_request()).await;

    assert!(response.answer.is_none());
    assert_eq!(response.error_code, Some(ErrorCode::NoAnswer));
    assert_eq!(response.synthesis_attempts, 3);
    assert_eq!(response.judge_verdict.attempts, 3);
    assert_eq!(h.llm.call_count(JUDGE), 0);
    assert_cost_additive(&response);
}

#[tokio::test]
async fn test_toxic_output_is_withheld() {
    let h = Harness::new();
    h.llm.push_text(
        SYNTH,
        "What a stupid idiot moron question, your preservation age is 60 [AU-TAX-001].",
    );
    h.llm.push_text(JUDGE, judge_reply(0.9));

    let response = h.orchestrator.run(preservation_request()).await;

    assert!(response.answer.is_none());
    assert!(response.blocked);
    assert_eq!(response.error_code, Some(ErrorCode::OutputBlocked));
    assert_eq!(response.judge_verdict.verdict, Verdict::Blocked);
    assert!(response.citations.is_empty());
}

#[tokio::test]
async fn test_unknown_member_is_an_audited_error_with_partial_cost() {
    let h = Harness::new();
    let request = QueryRequest::new("ZZ999", "session-x", Country::Au, "What is my preservation age?");

    let response = h.orchestrator.run(request).await;

    assert!(response.answer.is_none());
    assert_eq!(response.error_code, Some(ErrorCode::MemberNotFound));
    assert_eq!(response.error.as_deref(), Some(MEMBER_NOT_FOUND_MESSAGE));
    assert_eq!(response.judge_verdict.verdict, Verdict::Error);
    assert!(response.cost_breakdown.guardrails > 0.0);
    assert_eq!(response.cost_breakdown.synthesis, 0.0);
    assert_cost_additive(&response);

    let records = h.drain().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].judge_verdict, Verdict::Error);
    assert!(records[0].error_info.contains("ZZ999"));
    assert_eq!(records[0].cost, response.cost);
}

#[tokio::test]
async fn test_concurrent_requests_each_produce_one_audit_record() {
    let h = Harness::new();
    h.llm.set_fallback(SYNTH, "[MEMBER_NAME], your preservation age is 60 [AU-TAX-001].");
    h.llm.set_fallback(JUDGE, judge_reply(0.9));

    let runs = (0..12).map(|i| {
        let orchestrator = h.orchestrator.clone();
        let request = QueryRequest::new("AU001", format!("s{}", i), Country::Au, "What is my preservation age?");
        async move { orchestrator.run(request).await }
    });
    let responses = futures::future::join_all(runs).await;

    assert!(responses.iter().all(|r| r.judge_verdict.passed));
    responses.iter().for_each(assert_cost_additive);

    let records = h.drain().await;
    assert_eq!(records.len(), 12);
    assert_eq!(h.orchestrator.audit_emitter().stats().written, 12);
}

#[tokio::test]
async fn test_phase_timings_follow_observability_flag() {
    let h = Harness::new();
    let mut request = preservation_request().with_validation_mode(ValidationMode::Deterministic);

    let observed = h.orchestrator.run(request.clone()).await;
    let phases: Vec<String> = observed
        .phase_timings
        .unwrap()
        .into_iter()
        .map(|t| t.phase)
        .collect();
    assert_eq!(
        phases,
        vec!["guardrail_in", "classify", "execute_tools", "synthesize", "guardrail_out"]
    );

    request.enable_observability = false;
    let quiet = h.orchestrator.run(request).await;
    assert!(quiet.phase_timings.is_none());
}

#[test]
fn test_state_transitions() {
    use OrchestratorState::*;

    assert!(Init.can_transition_to(GuardrailIn));
    assert!(Validate.can_transition_to(Retry));
    assert!(Retry.can_transition_to(Synthesize));
    assert!(ExecuteTools.can_transition_to(Error));
    assert!(!Done.can_transition_to(Error));
    assert!(!Classify.can_transition_to(Synthesize));
    assert!(!Retry.can_transition_to(GuardrailOut));
}
