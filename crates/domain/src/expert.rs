use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::query::Query;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Relative invocation cost of an expert.
///
/// Derives `Ord` so selection tie-breaking can prefer cheaper experts
/// (`Cheap < Normal < Heavy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Cheap,
    Normal,
    Heavy,
}

/// Static metadata describing a registered expert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertDescriptor {
    /// Unique id within the registry (e.g. `"maps"`, `"yelp"`).
    pub id: String,
    pub display_name: String,
    /// Capabilities used for routing decisions (e.g. `"chitchat"`).
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    /// Lowercased tokens that, when present in a query, select this expert.
    #[serde(default)]
    pub keyword_triggers: BTreeSet<String>,
    /// Embedding of this expert's domain, compared against query embeddings.
    #[serde(default)]
    pub semantic_embedding: Option<Vec<f32>>,
    #[serde(default = "d_normal")]
    pub cost_class: CostClass,
    #[serde(default)]
    pub supports_streaming: bool,
    /// Per-expert invocation deadline. The executor clamps this to the
    /// configured global expert timeout.
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
}

impl ExpertDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            capability_tags: BTreeSet::new(),
            keyword_triggers: BTreeSet::new(),
            semantic_embedding: None,
            cost_class: CostClass::Normal,
            supports_streaming: false,
            timeout_ms: d_timeout_ms(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.insert(tag.into());
        self
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keyword_triggers
            .extend(triggers.into_iter().map(|t| t.into().to_lowercase()));
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.semantic_embedding = Some(embedding);
        self
    }

    pub fn with_cost_class(mut self, cost_class: CostClass) -> Self {
        self.cost_class = cost_class;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

fn d_normal() -> CostClass {
    CostClass::Normal
}
fn d_timeout_ms() -> u64 {
    20_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Structured payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    InteractiveMap,
    Image,
    JsonBlock,
    CodeBlock,
}

impl PayloadKind {
    /// Whether the mixer must keep this payload out of the summarizer's
    /// input and append it verbatim. Code blocks travel *through* the
    /// summarizer instead (their fencing must survive intact).
    pub fn preserved_verbatim(self) -> bool {
        !matches!(self, Self::CodeBlock)
    }

    /// Stable lowercase label, used for placeholder tokens.
    pub fn label(self) -> &'static str {
        match self {
            Self::InteractiveMap => "interactive_map",
            Self::Image => "image",
            Self::JsonBlock => "json_block",
            Self::CodeBlock => "code_block",
        }
    }
}

/// A machine-readable block an expert produced alongside its text.
///
/// The mixer never rewrites `raw`: maps, images, and JSON blocks reach
/// the caller byte-for-byte as the expert emitted them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredPayload {
    pub kind: PayloadKind,
    pub raw: String,
    /// Byte span of this payload within the expert's `text_output`, when
    /// it was carved out of the text rather than produced separately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
}

impl StructuredPayload {
    pub fn new(kind: PayloadKind, raw: impl Into<String>) -> Self {
        Self {
            kind,
            raw: raw.into(),
            span: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStatus {
    Success,
    Timeout,
    Error,
    Cancelled,
}

impl ExpertStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The outcome of one expert invocation.
///
/// Created by the executor (which stamps authoritative timestamps and the
/// descriptor id) and handed to the mixer; never mutated afterwards.
/// Invariant: `ended_at >= started_at`.
#[derive(Debug, Clone, Serialize)]
pub struct ExpertResult {
    pub expert_id: String,
    pub status: ExpertStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub text_output: String,
    pub structured_payloads: Vec<StructuredPayload>,
    pub token_usage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExpertResult {
    /// A successful result. Experts typically build their return value
    /// with this; the executor overwrites the timestamps with its own.
    pub fn success(expert_id: impl Into<String>, text_output: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            expert_id: expert_id.into(),
            status: ExpertStatus::Success,
            started_at: now,
            ended_at: now,
            text_output: text_output.into(),
            structured_payloads: Vec::new(),
            token_usage: 0,
            error_message: None,
        }
    }

    /// A non-success slot (timeout, error, cancellation).
    pub fn failed(
        expert_id: impl Into<String>,
        status: ExpertStatus,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        error_message: impl Into<String>,
    ) -> Self {
        let message = error_message.into();
        Self {
            expert_id: expert_id.into(),
            status,
            started_at,
            ended_at: ended_at.max(started_at),
            text_output: String::new(),
            structured_payloads: Vec::new(),
            token_usage: 0,
            error_message: if message.is_empty() {
                None
            } else {
                Some(message)
            },
        }
    }

    pub fn with_payload(mut self, payload: StructuredPayload) -> Self {
        self.structured_payloads.push(payload);
        self
    }

    pub fn with_token_usage(mut self, token_usage: u32) -> Self {
        self.token_usage = token_usage;
        self
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Expert trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A specialist agent the orchestrator can fan out to.
///
/// Implementations may block on I/O but must watch `cancel` at their I/O
/// boundaries and return promptly when it fires. Returning `Err` (or
/// panicking) never escapes the executor; either becomes an
/// `ExpertResult` with `status = Error`.
#[async_trait::async_trait]
pub trait Expert: Send + Sync {
    async fn invoke(&self, query: &Query, cancel: CancellationToken) -> Result<ExpertResult>;
}
