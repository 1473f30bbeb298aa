use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::expert::{ExpertResult, ExpertStatus};
use crate::query::Query;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the selector routed a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Single low-latency expert, mixer synthesis bypassed.
    FastPath,
    /// Concurrent fan-out to the selected experts.
    FanOut,
}

/// Structured trace events emitted per request.
///
/// Serialized with an internal `kind` tag so dashboards and log pipelines
/// can switch on it directly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    SelectionBegin,
    SelectionEnd {
        mode: SelectionMode,
        selected: Vec<String>,
        rationale: Vec<String>,
    },
    ExpertBegin {
        expert_id: String,
    },
    ExpertEnd {
        expert_id: String,
        status: ExpertStatus,
    },
    MixingBegin,
    MixingEnd,
    CacheHit,
    FastPath,
    /// Synthetic event a lagging subscriber receives in place of the
    /// events it missed. Never part of a sealed trace.
    SubscriberDropped {
        missed: u64,
    },
}

/// One entry in a request's trace stream. `seq` starts at 1 and is
/// strictly increasing within a request.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

impl TraceEvent {
    /// Write this event as one structured log line.
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ens_event");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sealed trace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A wall-clock interval.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Window {
    pub t0: DateTime<Utc>,
    pub t1: DateTime<Utc>,
}

impl Window {
    pub fn new(t0: DateTime<Utc>, t1: DateTime<Utc>) -> Self {
        Self { t0, t1 }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.t1 - self.t0).num_milliseconds().max(0) as u64
    }
}

/// Compact per-expert record embedded in a sealed trace.
#[derive(Debug, Clone, Serialize)]
pub struct ExpertSummary {
    pub expert_id: String,
    pub status: ExpertStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub token_usage: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&ExpertResult> for ExpertSummary {
    fn from(r: &ExpertResult) -> Self {
        Self {
            expert_id: r.expert_id.clone(),
            status: r.status,
            started_at: r.started_at,
            ended_at: r.ended_at,
            duration_ms: r.duration_ms(),
            token_usage: r.token_usage,
            error_message: r.error_message.clone(),
        }
    }
}

/// The sealed record of one request: every decision, timing, and event.
///
/// Assembled incrementally while the request runs and frozen when the
/// trace closes. `emitted_events` is authoritative; live subscribers may
/// drop under backpressure, the sealed trace never does.
#[derive(Debug, Clone, Serialize)]
pub struct MoETrace {
    pub request_id: String,
    pub query: Query,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_window: Option<Window>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_window: Option<Window>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixing_window: Option<Window>,
    pub selected_expert_ids: Vec<String>,
    pub per_expert: Vec<ExpertSummary>,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub emitted_events: Vec<TraceEvent>,
}
