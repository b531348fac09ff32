//! Offline demo: one question per country, scripted LLM replies

use pension_advisor_orchestrator::{
    agent::Orchestrator,
    audit::{AuditEmitter, InMemoryAuditSink},
    config::AdvisorConfig,
    country::Country,
    llm::ScriptedLlmClient,
    models::{QueryRequest, ValidationMode},
    profile::{sample_members, InMemoryProfileStore},
    tools::{CapabilityRegistry, ReferenceCalculator},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const JUDGE_PASS: &str =
    r#"{"passed": true, "confidence": 0.9, "violations": [], "reasoning": "Grounded in tool results with citations"}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Pension Advisor Orchestrator starting (offline demo)");

    let config = AdvisorConfig::default();

    let llm = Arc::new(ScriptedLlmClient::new());
    llm.push_text(
        &config.synthesis_model,
        "[MEMBER_NAME], your preservation age is 60, so you can access your superannuation in 2 years [AU-TAX-001].",
    );
    llm.push_text(
        &config.synthesis_model,
        "[MEMBER_NAME], a withdrawal before 59½ attracts ordinary income tax plus a 10% early withdrawal penalty [US-TAX-001][US-PENALTY-001].",
    );
    llm.set_fallback(&config.judge_model, JUDGE_PASS);

    let sink = Arc::new(InMemoryAuditSink::new());
    let orchestrator = Orchestrator::new(
        config,
        llm,
        Arc::new(CapabilityRegistry::bundled()?),
        Arc::new(ReferenceCalculator::new()),
        Arc::new(InMemoryProfileStore::with_members(sample_members())),
        Arc::new(AuditEmitter::spawn(sink.clone(), 2)),
    );

    let requests = vec![
        QueryRequest::new("AU001", "demo-au", Country::Au, "What is my preservation age?"),
        QueryRequest::new("US001", "demo-us", Country::Us, "How much tax will I pay on a $40,000 withdrawal?"),
        QueryRequest::new("UK001", "demo-uk", Country::Uk, "How much State Pension will I get?")
            .with_validation_mode(ValidationMode::Deterministic),
        QueryRequest::new("IN001", "demo-in", Country::In, "My SSN is 123-45-6789, what is my EPS?"),
    ];

    for request in requests {
        let response = orchestrator.run(request).await;

        println!("\n=== {} ===", response.session_id);
        match (&response.answer, response.blocked) {
            (Some(answer), _) => println!("{}", answer),
            (None, true) => println!("Blocked: {}", response.violations.join("; ")),
            (None, false) => println!("Error: {}", response.error.as_deref().unwrap_or("unknown")),
        }
        println!(
            "Verdict: {} (confidence {:.2}, {} attempt(s))",
            response.judge_verdict.verdict, response.judge_verdict.confidence, response.judge_verdict.attempts
        );
        println!("Tools: {:?}", response.tools_called);
        println!("Cost: ${:.6}", response.cost);
    }

    orchestrator.audit_emitter().shutdown().await;
    println!("\nAudit records written: {}", sink.len().await);

    Ok(())
}
