//! Per-model token pricing

use serde::{Deserialize, Serialize};
use tracing::warn;

/// USD per million tokens
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelRate {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// Fixed rate table keyed by a model family fragment.
///
/// Lookup is by substring so `databricks-claude-opus-4-1` and `claude-opus-4-1`
/// resolve to the same family. Unknown models are charged the most expensive
/// known rate.
#[derive(Debug, Clone)]
pub struct RateTable {
    entries: Vec<(String, ModelRate)>,
}

impl RateTable {
    pub fn new(entries: Vec<(String, ModelRate)>) -> Self {
        Self { entries }
    }

    pub fn rate_for(&self, model_id: &str) -> ModelRate {
        let lowered = model_id.to_lowercase();
        if let Some((_, rate)) = self
            .entries
            .iter()
            .find(|(family, _)| lowered.contains(family.as_str()))
        {
            return *rate;
        }

        warn!(model_id = %model_id, "No rate configured for model, charging ceiling rate");
        self.ceiling()
    }

    pub fn cost(&self, model_id: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        self.rate_for(model_id).cost(input_tokens, output_tokens)
    }

    fn ceiling(&self) -> ModelRate {
        self.entries
            .iter()
            .map(|(_, rate)| *rate)
            .fold(ModelRate::new(0.0, 0.0), |acc, rate| {
                ModelRate::new(
                    acc.input_per_million.max(rate.input_per_million),
                    acc.output_per_million.max(rate.output_per_million),
                )
            })
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::new(vec![
            ("opus".to_string(), ModelRate::new(15.0, 75.0)),
            ("sonnet".to_string(), ModelRate::new(3.0, 15.0)),
            ("haiku".to_string(), ModelRate::new(0.80, 4.0)),
            ("gpt-oss".to_string(), ModelRate::new(0.15, 0.60)),
        ])
    }
}
