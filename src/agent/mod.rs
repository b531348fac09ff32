//! Main orchestrator - one request lifecycle
//!
//! INIT → GUARDRAIL_IN → CLASSIFY → EXECUTE_TOOLS → SYNTHESIZE → VALIDATE
//!   → (RETRY → SYNTHESIZE | GUARDRAIL_OUT) → DONE, with ERROR reachable
//! from any step.
//!
//! Stage components degrade instead of failing. The only fatal paths are
//! profile store failures. Every request, blocked and errored ones included,
//! emits exactly one audit record.

use crate::audit::{error_info, truncate_chars, AuditEmitter, AuditRecord, MAX_PREVIEW_CHARS, MAX_QUERY_CHARS, MAX_RESPONSE_CHARS};
use crate::classifier::QueryClassifier;
use crate::config::AdvisorConfig;
use crate::error::OrchestrationError;
use crate::execution::ToolExecutor;
use crate::guardrails::{GuardrailVerdict, SafetyGuardrails, DEFAULT_INPUT_POLICIES, DEFAULT_OUTPUT_POLICIES};
use crate::llm::{LlmClient, RateTable};
use crate::models::{
    AdvisoryResponse, Citation, ClassificationMethod, CostBreakdown, ErrorCode, JudgeVerdict, MemberContext,
    PhaseTiming, QueryParams, QueryRequest, SynthesisAttempt, ToolInvocationResult, ValidationAttempt,
    ValidationMode, Verdict, Violation,
};
use crate::profile::MemberProfileStore;
use crate::synthesis::{render_deterministic, ResponseSynthesizer, MEMBER_NAME_TOKEN};
use crate::tools::{Calculator, CapabilityRegistry};
use crate::verification::ResponseValidator;
use crate::Result;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(test)]
mod tests;

const MEMBER_NOT_FOUND_MESSAGE: &str = "Member profile not found";
const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred while processing your request";
const NO_ANSWER_MESSAGE: &str = "No answer could be generated for this question";
const OUTPUT_BLOCKED_MESSAGE: &str = "The generated answer was withheld by safety checks";
const INPUT_BLOCKED_MESSAGE: &str = "Query blocked by safety policies";

//
// ================= State machine =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    GuardrailIn,
    Classify,
    ExecuteTools,
    Synthesize,
    Validate,
    Retry,
    GuardrailOut,
    Done,
    Error,
}

impl OrchestratorState {
    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;

        if next == Error {
            return !matches!(self, Done | Error);
        }

        matches!(
            (self, next),
            (Init, GuardrailIn)
                | (GuardrailIn, Classify)
                | (GuardrailIn, Done)
                | (Classify, ExecuteTools)
                | (ExecuteTools, Synthesize)
                | (Synthesize, Validate)
                | (Synthesize, GuardrailOut)
                | (Validate, Retry)
                | (Validate, GuardrailOut)
                | (Retry, Synthesize)
                | (GuardrailOut, Done)
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Init => "INIT",
            OrchestratorState::GuardrailIn => "GUARDRAIL_IN",
            OrchestratorState::Classify => "CLASSIFY",
            OrchestratorState::ExecuteTools => "EXECUTE_TOOLS",
            OrchestratorState::Synthesize => "SYNTHESIZE",
            OrchestratorState::Validate => "VALIDATE",
            OrchestratorState::Retry => "RETRY",
            OrchestratorState::GuardrailOut => "GUARDRAIL_OUT",
            OrchestratorState::Done => "DONE",
            OrchestratorState::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Per-request mutable state. Never shared between requests.
struct RequestContext {
    state: OrchestratorState,
    started: Instant,
    cost: CostBreakdown,
    classification_method: Option<ClassificationMethod>,
    phase_timings: Vec<PhaseTiming>,
    reasoning_trace: Vec<String>,
    synthesis_attempts: Vec<SynthesisAttempt>,
    validation_attempts: Vec<ValidationAttempt>,
    tool_results: Vec<ToolInvocationResult>,
}

impl RequestContext {
    fn new() -> Self {
        Self {
            state: OrchestratorState::Init,
            started: Instant::now(),
            cost: CostBreakdown::default(),
            classification_method: None,
            phase_timings: Vec::new(),
            reasoning_trace: vec!["INIT: request received".to_string()],
            synthesis_attempts: Vec::new(),
            validation_attempts: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    fn transition(&mut self, next: OrchestratorState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Unexpected state transition");
        }
        debug!(
            from = %self.state,
            to = %next,
            cost_usd = self.cost.total(),
            elapsed_ms = self.elapsed_ms(),
            "State transition"
        );
        self.reasoning_trace.push(format!("{} -> {}", self.state, next));
        self.state = next;
    }

    /// Repeated phases accumulate into one entry
    fn record_phase(&mut self, phase: &str, start: Instant) {
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        match self.phase_timings.iter_mut().find(|t| t.phase == phase) {
            Some(timing) => timing.duration_ms += duration_ms,
            None => self.phase_timings.push(PhaseTiming {
                phase: phase.to_string(),
                duration_ms,
            }),
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn tools_called(&self) -> Vec<String> {
        self.tool_results.iter().map(|r| r.tool_id.clone()).collect()
    }

    /// Citations of successful tools, deduplicated by code
    fn citations(&self) -> Vec<Citation> {
        let mut citations: Vec<Citation> = Vec::new();
        for citation in self
            .tool_results
            .iter()
            .filter(|r| r.success)
            .flat_map(|r| r.citations.iter())
        {
            if !citations.iter().any(|c| c.code == citation.code) {
                citations.push(citation.clone());
            }
        }
        citations
    }
}

/// What the request produced, before it is turned into a response and audit record
struct Outcome {
    answer: Option<String>,
    verdict: JudgeVerdict,
    blocked: bool,
    violations: Vec<String>,
    error_code: Option<ErrorCode>,
    error_message: Option<String>,
    /// Server-side only
    error_detail: Option<String>,
}

//
// ================= Orchestrator =================
//

pub struct Orchestrator {
    config: AdvisorConfig,
    guardrails: SafetyGuardrails,
    classifier: QueryClassifier,
    executor: ToolExecutor,
    synthesizer: ResponseSynthesizer,
    validator: ResponseValidator,
    profiles: Arc<dyn MemberProfileStore>,
    audit: Arc<AuditEmitter>,
}

impl Orchestrator {
    pub fn new(
        config: AdvisorConfig,
        llm: Arc<dyn LlmClient>,
        registry: Arc<CapabilityRegistry>,
        calculator: Arc<dyn Calculator>,
        profiles: Arc<dyn MemberProfileStore>,
        audit: Arc<AuditEmitter>,
    ) -> Self {
        let rates = RateTable::default();

        Self {
            guardrails: SafetyGuardrails::new(config.guardrails_enabled, config.toxicity_threshold),
            classifier: QueryClassifier::new(llm.clone(), rates.clone(), registry.clone(), &config),
            executor: ToolExecutor::new(registry, calculator, config.tool_timeout),
            synthesizer: ResponseSynthesizer::new(
                llm.clone(),
                rates.clone(),
                config.synthesis_model.clone(),
                config.llm_timeout,
            ),
            validator: ResponseValidator::new(
                llm,
                rates,
                config.judge_model.clone(),
                config.validation_pass_threshold,
                config.llm_timeout,
            ),
            profiles,
            audit,
            config,
        }
    }

    pub fn audit_emitter(&self) -> &Arc<AuditEmitter> {
        &self.audit
    }

    /// Run one request to completion. Never fails; errors become error responses.
    pub async fn run(&self, request: QueryRequest) -> AdvisoryResponse {
        let mut ctx = RequestContext::new();

        info!(
            session_id = %request.session_id,
            country = %request.country,
            validation_mode = %request.validation_mode,
            "Orchestrator: request received"
        );

        let outcome = match self.process(&request, &mut ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let failed_in = ctx.state;
                error!(session_id = %request.session_id, state = %failed_in, error = %e, "Orchestration failed");
                ctx.transition(OrchestratorState::Error);

                let (code, message) = match &e {
                    OrchestrationError::MemberNotFound(_) => (ErrorCode::MemberNotFound, MEMBER_NOT_FOUND_MESSAGE),
                    _ => (ErrorCode::InternalError, INTERNAL_ERROR_MESSAGE),
                };

                Outcome {
                    answer: None,
                    verdict: verdict_without_judge(
                        Verdict::Error,
                        request.validation_mode,
                        format!("Request failed during {}", failed_in),
                    ),
                    blocked: false,
                    violations: vec![],
                    error_code: Some(code),
                    error_message: Some(message.to_string()),
                    error_detail: Some(e.to_string()),
                }
            }
        };

        self.finish(&request, ctx, outcome)
    }

    async fn process(&self, request: &QueryRequest, ctx: &mut RequestContext) -> Result<Outcome> {
        // === GUARDRAIL_IN ===
        ctx.transition(OrchestratorState::GuardrailIn);
        let phase = Instant::now();
        let input = self.guardrails.validate_input(&request.query, DEFAULT_INPUT_POLICIES);
        ctx.cost.guardrails += input.cost_usd;
        ctx.record_phase("guardrail_in", phase);

        if input.blocked {
            ctx.transition(OrchestratorState::Done);
            return Ok(blocked_outcome(request, &input));
        }

        // === CLASSIFY ===
        ctx.transition(OrchestratorState::Classify);
        let phase = Instant::now();
        let classification = self.classifier.classify(&request.query, request.country).await;
        ctx.cost.classification += classification.cost_usd;
        ctx.classification_method = Some(classification.method);
        ctx.record_phase("classify", phase);
        ctx.reasoning_trace.push(format!(
            "CLASSIFY: {:?} via {} (confidence {:.2})",
            classification.tools, classification.method, classification.confidence
        ));

        // === EXECUTE_TOOLS ===
        ctx.transition(OrchestratorState::ExecuteTools);
        let phase = Instant::now();
        let member = self.profiles.load_member(&request.member_id).await?;
        if member.country != request.country {
            warn!(
                member_country = %member.country,
                request_country = %request.country,
                "Member country differs from request, using request country"
            );
        }
        let params = QueryParams::from_query(&request.query);
        ctx.tool_results = self
            .executor
            .execute(request.country, &classification.tools, &member, &params)
            .await;
        ctx.record_phase("execute_tools", phase);
        for result in &ctx.tool_results {
            ctx.reasoning_trace.push(format!(
                "OBSERVE: {} {} ({:.0} ms)",
                result.tool_id,
                if result.success { "ok" } else { "failed" },
                result.duration_ms
            ));
        }

        // === SYNTHESIZE / VALIDATE ===
        let (text, verdict) = match request.validation_mode {
            ValidationMode::Deterministic => {
                ctx.transition(OrchestratorState::Synthesize);
                let phase = Instant::now();
                let text = render_deterministic(request.country, &ctx.tool_results);
                ctx.record_phase("synthesize", phase);
                (text, JudgeVerdict::deterministic_pass())
            }
            ValidationMode::LlmJudge => self.synthesize_and_validate(request, &member, ctx).await,
        };

        if text.trim().is_empty() {
            ctx.transition(OrchestratorState::Error);
            return Ok(Outcome {
                answer: None,
                verdict,
                blocked: false,
                violations: vec![],
                error_code: Some(ErrorCode::NoAnswer),
                error_message: Some(NO_ANSWER_MESSAGE.to_string()),
                error_detail: Some("every synthesis attempt produced empty text".to_string()),
            });
        }

        // === GUARDRAIL_OUT ===
        ctx.transition(OrchestratorState::GuardrailOut);
        let phase = Instant::now();
        let output = self.guardrails.validate_output(&text, DEFAULT_OUTPUT_POLICIES);
        ctx.cost.guardrails += output.cost_usd;
        ctx.record_phase("guardrail_out", phase);
        ctx.transition(OrchestratorState::Done);

        if output.blocked {
            let mut verdict = verdict;
            verdict.verdict = Verdict::Blocked;
            return Ok(Outcome {
                answer: None,
                verdict,
                blocked: true,
                violations: output.messages(),
                error_code: Some(ErrorCode::OutputBlocked),
                error_message: Some(OUTPUT_BLOCKED_MESSAGE.to_string()),
                error_detail: Some("output guardrail blocked the answer".to_string()),
            });
        }

        let answer = output
            .masked_text
            .clone()
            .unwrap_or(text)
            .replace(MEMBER_NAME_TOKEN, &member.name);

        Ok(Outcome {
            answer: Some(answer),
            verdict,
            blocked: false,
            violations: output.messages(),
            error_code: None,
            error_message: None,
            error_detail: None,
        })
    }

    /// Bounded synthesize → validate loop. Returns the chosen text and its verdict.
    async fn synthesize_and_validate(
        &self,
        request: &QueryRequest,
        member: &MemberContext,
        ctx: &mut RequestContext,
    ) -> (String, JudgeVerdict) {
        let limit = self.config.validation_attempt_limit();
        let mut feedback: Option<Vec<Violation>> = None;

        for attempt in 1..=limit {
            if attempt > 1 {
                ctx.transition(OrchestratorState::Retry);
            }

            ctx.transition(OrchestratorState::Synthesize);
            let phase = Instant::now();
            let synthesis = self
                .synthesizer
                .synthesize(
                    attempt,
                    &request.query,
                    request.country,
                    member,
                    &ctx.tool_results,
                    feedback.as_deref(),
                )
                .await;
            ctx.cost.synthesis += synthesis.cost_usd;
            ctx.record_phase("synthesize", phase);

            ctx.transition(OrchestratorState::Validate);
            let phase = Instant::now();
            let validation = self
                .validator
                .validate(attempt, &request.query, &synthesis.text, request.country, &ctx.tool_results)
                .await;
            ctx.cost.validation += validation.cost_usd;
            ctx.record_phase("validate", phase);

            ctx.reasoning_trace.push(format!(
                "VALIDATE: attempt {} {} (confidence {:.2})",
                attempt,
                if validation.passed { "passed" } else { "failed" },
                validation.confidence
            ));

            let passed = validation.passed;
            feedback = Some(retry_feedback(&validation, self.config.validation_pass_threshold));
            ctx.synthesis_attempts.push(synthesis);
            ctx.validation_attempts.push(validation);

            if passed {
                break;
            }
        }

        // Passed first, then any text over none, then confidence; ties go to the later attempt.
        let chosen = ctx
            .synthesis_attempts
            .iter()
            .zip(&ctx.validation_attempts)
            .map(|(s, v)| (v.passed, !s.text.trim().is_empty(), v.confidence))
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        let attempts = ctx.validation_attempts.len() as u32;
        match (ctx.synthesis_attempts.get(chosen), ctx.validation_attempts.get(chosen)) {
            (Some(synthesis), Some(validation)) => {
                if !validation.passed {
                    warn!(
                        attempts,
                        chosen = chosen + 1,
                        confidence = validation.confidence,
                        "Validation budget exhausted, delivering best attempt"
                    );
                }
                (
                    synthesis.text.clone(),
                    JudgeVerdict::from_attempt(validation, ValidationMode::LlmJudge, attempts),
                )
            }
            _ => (
                String::new(),
                verdict_without_judge(Verdict::Error, ValidationMode::LlmJudge, "no attempts ran".to_string()),
            ),
        }
    }

    fn finish(&self, request: &QueryRequest, ctx: RequestContext, outcome: Outcome) -> AdvisoryResponse {
        let elapsed_ms = ctx.elapsed_ms();
        let citations = if outcome.answer.is_some() { ctx.citations() } else { vec![] };
        let tools_called = ctx.tools_called();
        let synthesis_attempts = ctx.synthesis_attempts.len() as u32;

        let record = AuditRecord {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: request.member_id.clone(),
            session_id: request.session_id.clone(),
            country: request.country,
            query_string: truncate_chars(&request.query, MAX_QUERY_CHARS),
            agent_response: outcome.answer.as_deref().map(|a| truncate_chars(a, MAX_RESPONSE_CHARS)),
            result_preview: truncate_chars(outcome.answer.as_deref().unwrap_or(""), MAX_PREVIEW_CHARS),
            cost: ctx.cost.total(),
            cost_breakdown: ctx.cost,
            classification_method: ctx.classification_method,
            citations: citations.clone(),
            tool_used: tools_called.clone(),
            judge_verdict: outcome.verdict.verdict,
            judge_confidence: outcome.verdict.confidence,
            judge_reasoning: outcome.verdict.reasoning.clone(),
            blocked: outcome.blocked,
            error_info: error_info(outcome.error_detail.as_deref(), &ctx.cost, ctx.classification_method),
            validation_mode: request.validation_mode,
            validation_attempts: outcome.verdict.attempts,
            synthesis_attempts,
            total_time_seconds: elapsed_ms / 1000.0,
            record_hash: String::new(),
        }
        .seal();

        let event_id = record.event_id;
        if !self.audit.emit(record) {
            warn!(session_id = %request.session_id, event_id = %event_id, "Audit record not queued");
        }

        let phase_timings = if request.enable_observability {
            info!(
                session_id = %request.session_id,
                state = %ctx.state,
                phases = ?ctx.phase_timings.iter().map(|t| format!("{}={:.1}ms", t.phase, t.duration_ms)).collect::<Vec<_>>(),
                classification_cost = ctx.cost.classification,
                synthesis_cost = ctx.cost.synthesis,
                validation_cost = ctx.cost.validation,
                guardrail_cost = ctx.cost.guardrails,
                total_cost = ctx.cost.total(),
                elapsed_ms,
                "Request complete"
            );
            Some(ctx.phase_timings.clone())
        } else {
            debug!(
                session_id = %request.session_id,
                trace = ?ctx.reasoning_trace,
                total_cost = ctx.cost.total(),
                elapsed_ms,
                "Request complete"
            );
            None
        };

        AdvisoryResponse {
            session_id: request.session_id.clone(),
            answer: outcome.answer,
            citations,
            judge_verdict: outcome.verdict,
            tools_called,
            cost: ctx.cost.total(),
            cost_breakdown: ctx.cost,
            validation_mode: request.validation_mode,
            blocked: outcome.blocked,
            violations: outcome.violations,
            error: outcome.error_message,
            error_code: outcome.error_code,
            classification_method: ctx.classification_method,
            synthesis_attempts,
            elapsed_ms,
            phase_timings,
        }
    }
}

fn blocked_outcome(request: &QueryRequest, input: &GuardrailVerdict) -> Outcome {
    Outcome {
        answer: None,
        verdict: verdict_without_judge(
            Verdict::Blocked,
            request.validation_mode,
            format!("Input blocked: {:?}", input.categories()),
        ),
        blocked: true,
        violations: input.messages(),
        error_code: None,
        error_message: Some(INPUT_BLOCKED_MESSAGE.to_string()),
        error_detail: Some(input.messages().join("; ")),
    }
}

fn verdict_without_judge(verdict: Verdict, mode: ValidationMode, reasoning: String) -> JudgeVerdict {
    JudgeVerdict {
        verdict,
        passed: false,
        confidence: 0.0,
        reasoning,
        violations: vec![],
        validation_mode: mode,
        attempts: 0,
    }
}

/// Violations handed to the next synthesis attempt
fn retry_feedback(validation: &ValidationAttempt, threshold: f64) -> Vec<Violation> {
    if !validation.violations.is_empty() || validation.passed {
        return validation.violations.clone();
    }
    vec![Violation::blocking(
        "LOW_CONFIDENCE",
        format!(
            "judge confidence {:.2} is below {:.2}; make the answer more specific and grounded",
            validation.confidence, threshold
        ),
    )]
}
