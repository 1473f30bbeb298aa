//! Expert selection.
//!
//! Pure, synchronous decision logic: given a query and a registry
//! snapshot, produce the ordered list of experts to run plus a
//! human-readable rationale per pick. No I/O; the only external input is
//! an optional query embedder, injected as a trait object.
//!
//! Resolution order:
//! 1. Chitchat queries route to the fast-path expert (single pick).
//! 2. Otherwise candidates are scored by the configured strategy.
//! 3. Ties break by cost class ascending, then id. Fully deterministic.

use std::sync::Arc;

use ens_domain::config::{SelectionConfig, SelectionStrategy};
use ens_domain::query::Query;
use ens_domain::trace::SelectionMode;

use crate::chitchat::ChitchatClassifier;
use crate::registry::RegisteredExpert;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The result of a selection decision.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub mode: SelectionMode,
    pub expert_ids: Vec<String>,
    /// One human-readable line per selected expert (or a single line
    /// explaining an empty outcome), recorded into the trace.
    pub rationale: Vec<String>,
}

/// Produces a query embedding for the `embedding`/`hybrid` strategies.
/// Without one configured, those strategies contribute no candidates.
pub trait QueryEmbedder: Send + Sync {
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

pub struct Selector {
    chitchat: ChitchatClassifier,
    embedder: Option<Arc<dyn QueryEmbedder>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Selector {
    pub fn new(config: &SelectionConfig, embedder: Option<Arc<dyn QueryEmbedder>>) -> Self {
        Self {
            chitchat: ChitchatClassifier::new(&config.chitchat_patterns),
            embedder,
        }
    }

    pub fn select(
        &self,
        query: &Query,
        snapshot: &[RegisteredExpert],
        config: &SelectionConfig,
    ) -> SelectionOutcome {
        let tokens = tokenize(&query.text);
        if tokens.is_empty() {
            return SelectionOutcome {
                mode: SelectionMode::FanOut,
                expert_ids: Vec::new(),
                rationale: vec!["empty query".into()],
            };
        }

        // Chitchat fast path, when a fast-path expert exists.
        if self.chitchat.is_chitchat(&query.text) {
            if let Some(expert) = snapshot
                .iter()
                .find(|e| e.descriptor.capability_tags.contains(&config.fast_path_tag))
            {
                return SelectionOutcome {
                    mode: SelectionMode::FastPath,
                    expert_ids: vec![expert.descriptor.id.clone()],
                    rationale: vec![format!(
                        "chitchat fast path via '{}'",
                        config.fast_path_tag
                    )],
                };
            }
            // No fast-path expert registered: fall through to fan-out.
        }

        let query_embedding = match config.strategy {
            SelectionStrategy::Keyword => None,
            _ => self.embedder.as_ref().and_then(|e| e.embed(&query.text)),
        };

        let mut candidates: Vec<Candidate> = Vec::new();
        for expert in snapshot {
            let matched: Vec<&str> = expert
                .descriptor
                .keyword_triggers
                .iter()
                .filter(|t| tokens.iter().any(|tok| tok == *t))
                .map(|t| t.as_str())
                .collect();
            let keyword_hit = !matched.is_empty();

            let similarity = match (&query_embedding, &expert.descriptor.semantic_embedding) {
                (Some(q), Some(e)) => {
                    let sim = cosine(q, e);
                    (sim >= config.similarity_floor).then_some(sim)
                }
                _ => None,
            };

            let (score, rationale) = match config.strategy {
                SelectionStrategy::Keyword => {
                    if !keyword_hit {
                        continue;
                    }
                    (1.0, format!("keywords [{}]", matched.join(", ")))
                }
                SelectionStrategy::Embedding => match similarity {
                    Some(sim) => (sim, format!("similarity {sim:.2}")),
                    None => continue,
                },
                SelectionStrategy::Hybrid => {
                    let base = if keyword_hit { 1.0 } else { 0.0 };
                    match (keyword_hit, similarity) {
                        (false, None) => continue,
                        (true, None) => (base, format!("keywords [{}]", matched.join(", "))),
                        (false, Some(sim)) => (sim, format!("similarity {sim:.2}")),
                        (true, Some(sim)) => (
                            base + sim,
                            format!("keywords [{}] + similarity {sim:.2}", matched.join(", ")),
                        ),
                    }
                }
            };

            candidates.push(Candidate {
                expert,
                score,
                rationale,
            });
        }

        // Score descending, then cost class ascending, then id. Stable
        // across runs.
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.expert.descriptor.cost_class.cmp(&b.expert.descriptor.cost_class))
                .then(a.expert.descriptor.id.cmp(&b.expert.descriptor.id))
        });
        candidates.truncate(config.max_experts);

        SelectionOutcome {
            mode: SelectionMode::FanOut,
            expert_ids: candidates
                .iter()
                .map(|c| c.expert.descriptor.id.clone())
                .collect(),
            rationale: candidates
                .iter()
                .map(|c| format!("{}: {}", c.expert.descriptor.id, c.rationale))
                .collect(),
        }
    }
}

struct Candidate<'a> {
    expert: &'a RegisteredExpert,
    score: f32,
    rationale: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Case-fold and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Cosine similarity; 0.0 for mismatched or zero-magnitude vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
