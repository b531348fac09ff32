//! Model serving endpoint client
//!
//! Chat-completions style endpoint at `{base}/serving-endpoints/{model}/invocations`.
//! Uses a long-lived reqwest::Client for connection pooling.

use super::{estimate_tokens, ChatMessage, LlmClient, LlmCompletion};
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Reusable serving endpoint client (connection-pooled)
pub struct ServingEndpointClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ServingEndpointClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestrationError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn endpoint_url(&self, model_id: &str) -> String {
        format!("{}/serving-endpoints/{}/invocations", self.base_url, model_id)
    }
}

#[async_trait]
impl LlmClient for ServingEndpointClient {
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<LlmCompletion> {
        if self.token.is_empty() {
            return Err(OrchestrationError::Llm(
                "SERVING_ENDPOINT_TOKEN not configured".to_string(),
            ));
        }

        let request = ChatRequest {
            messages,
            max_tokens,
            temperature,
        };

        debug!(model_id = %model_id, message_count = messages.len(), "Calling serving endpoint");

        let response = self
            .client
            .post(self.endpoint_url(model_id))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(model_id = %model_id, "Serving endpoint request failed: {}", e);
                OrchestrationError::Llm(format!("request to {} failed: {}", model_id, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(model_id = %model_id, %status, "Serving endpoint error response: {}", error_text);
            return Err(OrchestrationError::Llm(format!(
                "{} returned {}: {}",
                model_id, status, error_text
            )));
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            error!(model_id = %model_id, "Failed to parse serving endpoint response: {}", e);
            OrchestrationError::Llm(format!("parse error from {}: {}", model_id, e))
        })?;

        completion_from_response(body, messages)
    }
}

fn completion_from_response(body: ChatResponse, messages: &[ChatMessage]) -> Result<LlmCompletion> {
    let text = body
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| OrchestrationError::Llm("Empty choices in completion".to_string()))?;

    let (input_tokens, output_tokens) = match body.usage {
        Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
        None => {
            let prompt_len: u32 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
            (prompt_len, estimate_tokens(&text))
        }
    };

    Ok(LlmCompletion {
        text,
        input_tokens,
        output_tokens,
    })
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let messages = vec![ChatMessage::system("You are a judge"), ChatMessage::user("Score this")];
        let request = ChatRequest {
            messages: &messages,
            max_tokens: 300,
            temperature: 0.1,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"role\":\"system\""));
        assert!(json.contains("Score this"));
    }

    #[test]
    fn test_usage_is_preferred_over_estimate() {
        let body: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#,
        )
        .unwrap();
        let completion = completion_from_response(body, &[]).unwrap();
        assert_eq!((completion.input_tokens, completion.output_tokens), (12, 3));
    }

    #[test]
    fn test_missing_usage_falls_back_to_estimate() {
        let body: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"abcdefgh"}}]}"#).unwrap();
        let completion = completion_from_response(body, &[ChatMessage::user("abcd")]).unwrap();
        assert_eq!(completion.input_tokens, 1);
        assert_eq!(completion.output_tokens, 2);
    }

    #[test]
    fn test_endpoint_url() {
        let client = ServingEndpointClient::new("https://host/", "t", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint_url("claude-sonnet-4"),
            "https://host/serving-endpoints/claude-sonnet-4/invocations"
        );
    }
}
