//! Tool executor
//!
//! Resolves classifier tool ids against the capability registry and invokes
//! the calculator for each. Invocations run concurrently and results come back
//! in issued order. A failing or unknown tool never affects its siblings.
//!
//! No LLM is allowed here, and the executor holds no per-request state.

use crate::country::Country;
use crate::error::OrchestrationError;
use crate::models::{MemberContext, QueryParams, ToolInvocationResult};
use crate::tools::{Calculator, CapabilityRegistry};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum tools per request
const MAX_TOOLS_PER_REQUEST: usize = 8;

pub struct ToolExecutor {
    registry: Arc<CapabilityRegistry>,
    calculator: Arc<dyn Calculator>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, calculator: Arc<dyn Calculator>, timeout: Duration) -> Self {
        Self {
            registry,
            calculator,
            timeout,
        }
    }

    pub async fn execute(
        &self,
        country: Country,
        tool_ids: &[String],
        member: &MemberContext,
        params: &QueryParams,
    ) -> Vec<ToolInvocationResult> {
        if tool_ids.len() > MAX_TOOLS_PER_REQUEST {
            warn!(
                requested = tool_ids.len(),
                limit = MAX_TOOLS_PER_REQUEST,
                "Too many tools requested, extra ids will fail"
            );
        }

        let invocations = tool_ids
            .iter()
            .enumerate()
            .map(|(position, tool_id)| self.invoke_one(country, tool_id, position, member, params));

        let results = join_all(invocations).await;

        debug!(
            country = %country,
            tool_count = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            "Tool execution completed"
        );

        results
    }

    async fn invoke_one(
        &self,
        country: Country,
        tool_id: &str,
        position: usize,
        member: &MemberContext,
        params: &QueryParams,
    ) -> ToolInvocationResult {
        let start = Instant::now();

        if position >= MAX_TOOLS_PER_REQUEST {
            return failed(tool_id, "tool limit exceeded".to_string(), start);
        }

        let capability = match self.registry.resolve(country, tool_id) {
            Ok(capability) => capability,
            Err(e) => {
                warn!(country = %country, tool_id = %tool_id, "Tool not registered");
                let message = match e {
                    OrchestrationError::UnknownTool(_) => format!("unknown tool: {}", tool_id),
                    other => other.to_string(),
                };
                return failed(tool_id, message, start);
            }
        };

        let outcome = tokio::time::timeout(
            self.timeout,
            self.calculator.invoke(&capability, member, params),
        )
        .await;

        let (success, output, error): (bool, Value, Option<String>) = match outcome {
            Ok(Ok(output)) => (true, output, None),
            Ok(Err(e)) => {
                warn!(tool_id = %tool_id, error = %e, "Tool execution failed");
                (false, Value::Null, Some(e.to_string()))
            }
            Err(_) => {
                let e = OrchestrationError::timeout(format!("tool {}", tool_id), self.timeout);
                warn!(tool_id = %tool_id, error = %e, "Tool execution timed out");
                (false, Value::Null, Some(e.to_string()))
            }
        };

        ToolInvocationResult {
            tool_id: capability.tool.to_string(),
            tool_name: Some(capability.name.clone()),
            authority: Some(capability.authority.clone()),
            citations: capability.citations.clone(),
            output,
            success,
            error,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

fn failed(tool_id: &str, error: String, start: Instant) -> ToolInvocationResult {
    ToolInvocationResult {
        tool_id: tool_id.to_string(),
        tool_name: None,
        authority: None,
        citations: vec![],
        output: Value::Null,
        success: false,
        error: Some(error),
        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}
