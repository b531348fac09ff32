//! LLM access layer
//!
//! Every model call in the pipeline goes through [`LlmClient`]. Cost is never
//! reported by the backend; callers price completions with [`RateTable`].

use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub mod pricing;
pub mod serving;

pub use pricing::{ModelRate, RateTable};
pub use serving::ServingEndpointClient;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<LlmCompletion>;
}

/// Rough token estimate used when a backend omits usage
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() + 3) / 4) as u32
}

/// Strip a markdown code fence around a JSON reply
pub fn strip_json_fence(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Run an LLM call under a deadline
pub async fn call_with_timeout(
    client: &dyn LlmClient,
    model_id: &str,
    messages: &[ChatMessage],
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
) -> Result<LlmCompletion> {
    match tokio::time::timeout(timeout, client.call(model_id, messages, max_tokens, temperature)).await {
        Ok(result) => result,
        Err(_) => Err(OrchestrationError::timeout(format!("llm call to {}", model_id), timeout)),
    }
}

//
// ================= Scripted client =================
//

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(String),
    /// Sleeps before answering; used to exercise timeouts
    Delayed(Duration, String),
}

/// Offline LLM double with per-model reply queues.
///
/// Used by tests and the demo binary. When a model's queue is empty the
/// model's fallback reply is returned, or an error if none is set.
#[derive(Default)]
pub struct ScriptedLlmClient {
    queues: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    fallbacks: Mutex<HashMap<String, String>>,
    calls: Mutex<HashMap<String, usize>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, model_id: &str, reply: ScriptedReply) -> &Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(model_id.to_string()).or_default().push_back(reply);
        }
        self
    }

    pub fn push_text(&self, model_id: &str, text: impl Into<String>) -> &Self {
        self.push(model_id, ScriptedReply::Text(text.into()))
    }

    pub fn push_error(&self, model_id: &str, message: impl Into<String>) -> &Self {
        self.push(model_id, ScriptedReply::Error(message.into()))
    }

    pub fn set_fallback(&self, model_id: &str, text: impl Into<String>) -> &Self {
        if let Ok(mut fallbacks) = self.fallbacks.lock() {
            fallbacks.insert(model_id.to_string(), text.into());
        }
        self
    }

    pub fn call_count(&self, model_id: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(model_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|calls| calls.values().sum()).unwrap_or(0)
    }

    /// Concatenated message contents of every call made to `model_id`
    pub fn prompts_for(&self, model_id: &str) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| {
                prompts
                    .iter()
                    .filter(|(model, _)| model == model_id)
                    .map(|(_, prompt)| prompt.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_reply(&self, model_id: &str) -> Option<ScriptedReply> {
        let queued = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(model_id).and_then(|q| q.pop_front()));

        queued.or_else(|| {
            self.fallbacks
                .lock()
                .ok()
                .and_then(|fallbacks| fallbacks.get(model_id).cloned())
                .map(ScriptedReply::Text)
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<LlmCompletion> {
        let prompt: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(model_id.to_string()).or_insert(0) += 1;
        }
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((model_id.to_string(), prompt.clone()));
        }

        let text = match self.next_reply(model_id) {
            Some(ScriptedReply::Text(text)) => text,
            Some(ScriptedReply::Error(message)) => return Err(OrchestrationError::Llm(message)),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                text
            }
            None => {
                return Err(OrchestrationError::Llm(format!(
                    "no scripted reply for model {}",
                    model_id
                )))
            }
        };

        Ok(LlmCompletion {
            input_tokens: estimate_tokens(&prompt),
            output_tokens: estimate_tokens(&text),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_json_fence() {
        assert_eq!(strip_json_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_scripted_queue_then_fallback() {
        let client = ScriptedLlmClient::new();
        client.push_text("m", "first").set_fallback("m", "again");

        let messages = vec![ChatMessage::user("hello")];
        let first = client.call("m", &messages, 100, 0.0).await.unwrap();
        let second = client.call("m", &messages, 100, 0.0).await.unwrap();

        assert_eq!(first.text, "first");
        assert_eq!(second.text, "again");
        assert_eq!(client.call_count("m"), 2);
        assert_eq!(first.input_tokens, estimate_tokens("hello"));
    }

    #[tokio::test]
    async fn test_scripted_error_and_missing_model() {
        let client = ScriptedLlmClient::new();
        client.push_error("m", "boom");
        let messages = vec![ChatMessage::user("hi")];

        assert!(client.call("m", &messages, 10, 0.0).await.is_err());
        assert!(client.call("other", &messages, 10, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let client = ScriptedLlmClient::new();
        client.push("m", ScriptedReply::Delayed(Duration::from_millis(200), "late".into()));

        let result = call_with_timeout(
            &client,
            "m",
            &[ChatMessage::user("hi")],
            10,
            0.0,
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(result, Err(OrchestrationError::Timeout { .. })));
    }
}
