use pension_advisor_orchestrator::{
    agent::Orchestrator,
    api::start_server,
    audit::{AuditEmitter, AuditSink, InMemoryAuditSink, PostgresAuditSink},
    config::AdvisorConfig,
    llm::{LlmClient, ScriptedLlmClient, ServingEndpointClient},
    profile::{sample_members, InMemoryProfileStore, MemberProfileStore, PostgresProfileStore},
    tools::{Calculator, CapabilityRegistry, HttpCalculator, ReferenceCalculator},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AdvisorConfig::from_env()?;

    info!("Pension Advisor Orchestrator - API Server");
    info!(port = config.port, synthesis_model = %config.synthesis_model, judge_model = %config.judge_model, "Configuration loaded");

    let registry = Arc::new(CapabilityRegistry::load(config.capability_registry_path.as_deref())?);

    let llm: Arc<dyn LlmClient> = match &config.serving_base_url {
        Some(base_url) => Arc::new(ServingEndpointClient::new(
            base_url.clone(),
            config.serving_token.clone().unwrap_or_default(),
            config.llm_timeout,
        )?),
        None => {
            warn!("SERVING_ENDPOINT_BASE_URL not set, only deterministic mode will produce answers");
            Arc::new(ScriptedLlmClient::new())
        }
    };

    let calculator: Arc<dyn Calculator> = match &config.calculator_base_url {
        Some(base_url) => Arc::new(HttpCalculator::new(base_url, config.tool_timeout)?),
        None => {
            info!("CALCULATOR_API_BASE_URL not set, using reference calculators");
            Arc::new(ReferenceCalculator::new())
        }
    };

    let profiles: Arc<dyn MemberProfileStore>;
    let sink: Arc<dyn AuditSink>;
    match &config.database_url {
        Some(url) => {
            profiles = Arc::new(PostgresProfileStore::connect_lazy(url)?);
            sink = Arc::new(PostgresAuditSink::connect_lazy(url)?);
        }
        None => {
            warn!("No database configured, using in-memory profiles and audit trail");
            profiles = Arc::new(InMemoryProfileStore::with_members(sample_members()));
            sink = Arc::new(InMemoryAuditSink::new());
        }
    }

    let emitter = Arc::new(AuditEmitter::spawn(sink, config.audit_workers));
    let port = config.port;

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        llm,
        registry,
        calculator,
        profiles,
        emitter,
    ));

    info!("Orchestrator initialized");

    start_server(orchestrator, port).await?;

    Ok(())
}
