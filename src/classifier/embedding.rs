//! Stage 2: similarity against labelled example utterances

use crate::tools::ToolId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Turns text into a unit-length vector
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "i", "my", "me", "is", "are", "am", "do", "does", "will", "can", "to",
    "of", "for", "on", "in", "at", "what", "how", "much", "be", "it", "and", "or", "if", "with",
];

/// Feature-hashing bag of words and bigrams
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(16),
        }
    }

    fn bucket(&self, feature: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        (hasher.finish() % self.dimensions as u64) as usize
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = tokens(text);

        for token in &tokens {
            vector[self.bucket(token)] += 1.0;
        }
        for pair in tokens.windows(2) {
            vector[self.bucket(&format!("{} {}", pair[0], pair[1]))] += 0.5;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

const EXAMPLES: &[(ToolId, &[&str])] = &[
    (ToolId::Eligibility, &[
        "when am i allowed to access my retirement savings",
        "can i get my money out now",
        "am i old enough to withdraw",
        "at what age can i start withdrawing",
        "am i allowed to retire and take my savings",
    ]),
    (ToolId::Tax, &[
        "how much will the government take from my withdrawal",
        "what will i owe on a lump sum",
        "will my withdrawal be taxed",
        "what deductions apply when i cash out",
    ]),
    (ToolId::Benefit, &[
        "what government pension payments am i entitled to",
        "can i get government support in retirement",
        "how much pension income will the government pay me",
        "am i entitled to the public pension",
    ]),
    (ToolId::Projection, &[
        "will my savings last through retirement",
        "what will my balance be when i retire",
        "how long will my money last",
        "how big will my retirement savings grow",
        "will i have enough to retire comfortably",
    ]),
];

/// Result of a similarity lookup
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    pub tool: ToolId,
    pub score: f64,
    pub runner_up: f64,
}

/// Precomputed embeddings of the labelled examples
pub struct ExampleIndex {
    entries: Vec<(ToolId, Vec<f32>)>,
}

impl ExampleIndex {
    pub fn build(embedder: &dyn Embedder) -> Self {
        let entries = EXAMPLES
            .iter()
            .flat_map(|(tool, examples)| examples.iter().map(move |e| (*tool, embedder.embed(e))))
            .collect();
        Self { entries }
    }

    /// Best tool and the best score of any other tool
    pub fn best_match(&self, query_vector: &[f32]) -> Option<SimilarityMatch> {
        let mut best_per_tool: Vec<(ToolId, f64)> = Vec::new();
        for (tool, vector) in &self.entries {
            let score = cosine(query_vector, vector);
            match best_per_tool.iter_mut().find(|(t, _)| t == tool) {
                Some((_, best)) if score > *best => *best = score,
                Some(_) => {}
                None => best_per_tool.push((*tool, score)),
            }
        }

        best_per_tool.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let (tool, score) = *best_per_tool.first()?;
        let runner_up = best_per_tool.get(1).map(|(_, s)| *s).unwrap_or(0.0);

        Some(SimilarityMatch { tool, score, runner_up })
    }
}
