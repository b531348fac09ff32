//! Query classifier cascade
//!
//! Cheapest-first: pattern rules, then example similarity, then one LLM
//! call. The first stage with an unambiguous answer wins and later stages do
//! not run. `classify` never fails; a broken LLM stage yields a
//! low-confidence fallback.

use crate::config::AdvisorConfig;
use crate::country::Country;
use crate::llm::{call_with_timeout, strip_json_fence, ChatMessage, LlmClient, RateTable};
use crate::models::{ClassificationMethod, ClassificationResult, StageOutcome};
use crate::tools::{CapabilityRegistry, ToolId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub mod embedding;
pub mod rules;

pub use embedding::{Embedder, ExampleIndex, HashingEmbedder};

const REGEX_CONFIDENCE: f64 = 1.0;
const EMBEDDING_CONFIDENCE: f64 = 0.8;
const LLM_DEFAULT_CONFIDENCE: f64 = 0.6;
const FALLBACK_CONFIDENCE: f64 = 0.1;
const CLASSIFIER_MAX_TOKENS: u32 = 200;

pub struct QueryClassifier {
    llm: Arc<dyn LlmClient>,
    rates: RateTable,
    registry: Arc<CapabilityRegistry>,
    embedder: Box<dyn Embedder>,
    index: ExampleIndex,
    model: String,
    similarity_threshold: f64,
    margin: f64,
    embedding_cost_usd: f64,
    timeout: Duration,
}

impl QueryClassifier {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        rates: RateTable,
        registry: Arc<CapabilityRegistry>,
        config: &AdvisorConfig,
    ) -> Self {
        Self::with_embedder(llm, rates, registry, Box::new(HashingEmbedder::default()), config)
    }

    pub fn with_embedder(
        llm: Arc<dyn LlmClient>,
        rates: RateTable,
        registry: Arc<CapabilityRegistry>,
        embedder: Box<dyn Embedder>,
        config: &AdvisorConfig,
    ) -> Self {
        let index = ExampleIndex::build(embedder.as_ref());
        Self {
            llm,
            rates,
            registry,
            embedder,
            index,
            model: config.classifier_model.clone(),
            similarity_threshold: config.embedding_similarity_threshold,
            margin: config.embedding_margin,
            embedding_cost_usd: config.embedding_cost_usd,
            timeout: config.classifier_timeout,
        }
    }

    pub async fn classify(&self, query: &str, country: Country) -> ClassificationResult {
        let started = Instant::now();
        let mut stages = Vec::with_capacity(3);

        // Stage 1
        let stage_start = Instant::now();
        let rule_hit = rules::unambiguous_match(query, country);
        stages.push(StageOutcome {
            method: ClassificationMethod::Regex,
            resolved: rule_hit.is_some(),
            cost_usd: 0.0,
            latency_ms: elapsed_ms(stage_start),
        });
        if let Some(tool) = rule_hit {
            debug!(country = %country, tool = %tool, "Classified by rules");
            return finish(vec![tool.to_string()], REGEX_CONFIDENCE, ClassificationMethod::Regex, stages, started, None);
        }

        // Stage 2
        let stage_start = Instant::now();
        let similar = self
            .index
            .best_match(&self.embedder.embed(query))
            .filter(|m| m.score >= self.similarity_threshold && m.score - m.runner_up >= self.margin);
        stages.push(StageOutcome {
            method: ClassificationMethod::Embedding,
            resolved: similar.is_some(),
            cost_usd: self.embedding_cost_usd,
            latency_ms: elapsed_ms(stage_start),
        });
        if let Some(m) = similar {
            debug!(country = %country, tool = %m.tool, score = m.score, "Classified by similarity");
            return finish(
                vec![m.tool.to_string()],
                EMBEDDING_CONFIDENCE,
                ClassificationMethod::Embedding,
                stages,
                started,
                None,
            );
        }

        // Stage 3
        let stage_start = Instant::now();
        let (outcome, cost) = self.classify_with_llm(query, country).await;
        stages.push(StageOutcome {
            method: ClassificationMethod::Llm,
            resolved: outcome.is_ok(),
            cost_usd: cost,
            latency_ms: elapsed_ms(stage_start),
        });

        match outcome {
            Ok((tools, confidence)) => finish(tools, confidence, ClassificationMethod::Llm, stages, started, None),
            Err(note) => {
                warn!(country = %country, note = %note, "Classifier fell back");
                finish(vec![], FALLBACK_CONFIDENCE, ClassificationMethod::Llm, stages, started, Some(note))
            }
        }
    }

    fn build_prompt(&self, query: &str, country: Country) -> String {
        let tool_lines: Vec<String> = ToolId::ALL
            .iter()
            .filter_map(|tool| self.registry.get(country, *tool))
            .map(|cap| format!("- {}: {} ({})", cap.tool, cap.description, cap.authority))
            .collect();

        format!(
            r#"You route {country} retirement questions to calculators.

Available tools:
{tools}

Question: {query}

Return ONLY valid JSON:
{{"tools": ["<tool id>", ...], "confidence": <0.0 to 1.0>, "reasoning": "<brief>"}}
Use an empty list if no tool applies."#,
            country = country.terminology().name,
            tools = tool_lines.join("\n"),
            query = query,
        )
    }

    /// Returns the parsed outcome and the cost actually incurred
    async fn classify_with_llm(
        &self,
        query: &str,
        country: Country,
    ) -> (std::result::Result<(Vec<String>, f64), String>, f64) {
        let messages = vec![ChatMessage::user(self.build_prompt(query, country))];

        let completion = match call_with_timeout(
            self.llm.as_ref(),
            &self.model,
            &messages,
            CLASSIFIER_MAX_TOKENS,
            0.0,
            self.timeout,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => return (Err(format!("classifier llm failed: {}", e)), 0.0),
        };

        let cost = self
            .rates
            .cost(&self.model, completion.input_tokens, completion.output_tokens);

        (parse_classifier_reply(&completion.text), cost)
    }
}

fn parse_classifier_reply(text: &str) -> std::result::Result<(Vec<String>, f64), String> {
    let json: serde_json::Value = serde_json::from_str(strip_json_fence(text))
        .map_err(|e| format!("unparseable classifier reply: {}", e))?;

    let tools: Vec<String> = json
        .get("tools")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "classifier reply has no tools array".to_string())?
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.trim().to_lowercase()))
        .filter(|s| !s.is_empty())
        .collect();

    let confidence = json
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(if tools.is_empty() { FALLBACK_CONFIDENCE } else { LLM_DEFAULT_CONFIDENCE });

    Ok((tools, confidence))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn finish(
    tools: Vec<String>,
    confidence: f64,
    method: ClassificationMethod,
    stages: Vec<StageOutcome>,
    started: Instant,
    note: Option<String>,
) -> ClassificationResult {
    ClassificationResult {
        tools,
        confidence,
        method,
        cost_usd: stages.iter().map(|s| s.cost_usd).sum(),
        latency_ms: elapsed_ms(started),
        stages,
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn classifier(llm: Arc<ScriptedLlmClient>) -> QueryClassifier {
        let config = AdvisorConfig::default();
        QueryClassifier::new(
            llm,
            RateTable::default(),
            Arc::new(CapabilityRegistry::bundled().unwrap()),
            &config,
        )
    }

    #[tokio::test]
    async fn test_stage_one_never_reports_llm() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let classifier = classifier(llm.clone());

        for (query, country) in [
            ("What is my preservation age?", Country::Au),
            ("How much tax will I pay on a $50,000 withdrawal?", Country::Au),
            ("When should I start Social Security?", Country::Us),
            ("How much State Pension will I get?", Country::Uk),
            ("How much EPS will I receive?", Country::In),
        ] {
            let result = classifier.classify(query, country).await;
            assert_eq!(result.method, ClassificationMethod::Regex, "{}", query);
            assert_eq!(result.cost_usd, 0.0);
            assert_eq!(result.confidence, 1.0);
            assert_eq!(result.stages.len(), 1);
        }
        assert_eq!(llm.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cost_ordering_across_stages() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_text(
            "gpt-oss-120b",
            r#"```json
{"tools": ["benefit"], "confidence": 0.72, "reasoning": "asks about entitlements"}
```"#,
        );
        let classifier = classifier(llm.clone());

        let regex = classifier.classify("What is my preservation age?", Country::Au).await;
        let embedding = classifier
            .classify("Will my savings last through retirement?", Country::Au)
            .await;
        let fallback = classifier
            .classify("Could you walk me through my options given my situation?", Country::Au)
            .await;

        assert_eq!(embedding.method, ClassificationMethod::Embedding);
        assert_eq!(embedding.tools, vec!["projection".to_string()]);
        assert_eq!(fallback.method, ClassificationMethod::Llm);
        assert_eq!(fallback.tools, vec!["benefit".to_string()]);
        assert!((fallback.confidence - 0.72).abs() < 1e-9);

        assert!(regex.cost_usd <= embedding.cost_usd);
        assert!(embedding.cost_usd <= fallback.cost_usd);
        assert_eq!(fallback.stages.len(), 3);
        assert_eq!(llm.call_count("gpt-oss-120b"), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_yields_low_confidence_fallback() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_error("gpt-oss-120b", "endpoint down");
        let classifier = classifier(llm);

        let result = classifier
            .classify("Could you walk me through my options given my situation?", Country::Uk)
            .await;

        assert_eq!(result.method, ClassificationMethod::Llm);
        assert!(result.tools.is_empty());
        assert!(result.confidence < 0.5);
        assert!(result.note.unwrap().contains("endpoint down"));
    }

    #[test]
    fn test_parse_reply_rejects_garbage() {
        assert!(parse_classifier_reply("I think tax").is_err());
        let (tools, confidence) = parse_classifier_reply(r#"{"tools": ["Tax", "made_up"]}"#).unwrap();
        assert_eq!(tools, vec!["tax".to_string(), "made_up".to_string()]);
        assert_eq!(confidence, LLM_DEFAULT_CONFIDENCE);
    }
}
