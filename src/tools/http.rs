//! HTTP-backed calculator
//!
//! Posts each invocation to `{base}/calculators/{callable}` on the calculator
//! service. Only the member-safe profile view leaves the process.

use super::{Calculator, Capability};
use crate::error::OrchestrationError;
use crate::models::{MemberContext, QueryParams};
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::error;

#[derive(Clone)]
pub struct HttpCalculator {
    client: Client,
    base_url: String,
}

impl HttpCalculator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestrationError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, capability: &Capability) -> String {
        format!("{}/calculators/{}", self.base_url, capability.callable)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(url = %url, "Calculator request failed: {}", e);
                OrchestrationError::Tool(format!("Calculator request failed for {}: {}", url, e))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::Tool(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(OrchestrationError::Tool(format!(
                "Calculator returned {} for {}: {}",
                status, url, body
            )));
        }

        Ok(body)
    }
}

pub(crate) fn request_body(capability: &Capability, member: &MemberContext, params: &QueryParams) -> Value {
    json!({
        "country": capability.country,
        "tool": capability.tool,
        "member": member.safe_view(),
        "params": params,
    })
}

#[async_trait::async_trait]
impl Calculator for HttpCalculator {
    async fn invoke(
        &self,
        capability: &Capability,
        member: &MemberContext,
        params: &QueryParams,
    ) -> Result<Value> {
        let body = request_body(capability, member, params);
        let response = self.post_json(&self.url_for(capability), &body).await?;

        // Services wrap results as {"data": ...} or return them bare
        Ok(response.get("data").cloned().unwrap_or(response))
    }
}
