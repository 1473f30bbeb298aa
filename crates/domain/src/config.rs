use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub endpointing: EndpointingConfig,
    /// Queries longer than this are rejected as invalid.
    #[serde(default = "d_8000")]
    pub max_query_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            selection: SelectionConfig::default(),
            execution: ExecutionConfig::default(),
            mixer: MixerConfig::default(),
            cache: CacheConfig::default(),
            trace: TraceConfig::default(),
            endpointing: EndpointingConfig::default(),
            max_query_chars: d_8000(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    Keyword,
    Embedding,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Upper bound on fan-out width.
    #[serde(default = "d_3")]
    pub max_experts: usize,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Embedding matches below this cosine similarity are rejected.
    #[serde(default = "d_02")]
    pub similarity_floor: f32,
    /// Capability tag that marks the expert eligible for the fast path.
    #[serde(default = "d_fast_path_tag")]
    pub fast_path_tag: String,
    /// Anchored regexes matched against the normalized query; a hit routes
    /// the query onto the fast path.
    #[serde(default = "d_chitchat_patterns")]
    pub chitchat_patterns: Vec<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_experts: 3,
            strategy: SelectionStrategy::Hybrid,
            similarity_floor: 0.2,
            fast_path_tag: d_fast_path_tag(),
            chitchat_patterns: d_chitchat_patterns(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Global clamp on per-expert deadlines (descriptors may ask for less).
    #[serde(default = "d_20000")]
    pub expert_timeout_ms: u64,
    /// Hard wall-clock cutoff for one fan-out request.
    #[serde(default = "d_30000")]
    pub request_deadline_ms: u64,
    /// Reduced request deadline applied to fast-path queries.
    #[serde(default = "d_3000")]
    pub fast_path_deadline_ms: u64,
    /// How long a cancelled expert gets to observe the signal before its
    /// task is abandoned.
    #[serde(default = "d_500")]
    pub cancel_grace_ms: u64,
    /// Process-wide cap on concurrently running experts, across requests.
    #[serde(default = "d_16")]
    pub max_concurrent_experts: usize,
    /// How long a selected expert waits for an execution slot before its
    /// slot is marked timed-out without invocation.
    #[serde(default = "d_1000")]
    pub admission_wait_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            expert_timeout_ms: 20_000,
            request_deadline_ms: 30_000,
            fast_path_deadline_ms: 3_000,
            cancel_grace_ms: 500,
            max_concurrent_experts: 16,
            admission_wait_ms: 1_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mixing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfig {
    /// Regexes that detect a request for a map view; used to trigger the
    /// geocoding fallback when no interactive map payload was produced.
    #[serde(default = "d_map_intent_patterns")]
    pub map_intent_patterns: Vec<String>,
    /// Returned when the fast-path expert fails.
    #[serde(default = "d_fast_path_fail")]
    pub fast_path_fail_fallback: String,
    /// Returned when every selected expert fails.
    #[serde(default = "d_all_failed")]
    pub all_failed_fallback: String,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            map_intent_patterns: d_map_intent_patterns(),
            fast_path_fail_fallback: d_fast_path_fail(),
            all_failed_fallback: d_all_failed(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_300000")]
    pub ttl_ms: u64,
    /// LRU capacity. 0 = unbounded.
    #[serde(default = "d_1024")]
    pub max_entries: usize,
    /// Context keys folded into the fingerprint, so personalized sessions
    /// never share cache entries.
    #[serde(default = "d_fingerprint_keys")]
    pub fingerprint_context_keys: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 300_000,
            max_entries: 1024,
            fingerprint_context_keys: d_fingerprint_keys(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Live-subscriber window; a subscriber lagging past this many events
    /// is dropped with a single tail marker.
    #[serde(default = "d_1024")]
    pub buffer_max: usize,
    /// How many sealed traces the bus keeps for dashboard queries.
    #[serde(default = "d_256")]
    pub history_max: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            buffer_max: 1024,
            history_max: 256,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpointing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thresholds for the semantic endpointing decision loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointingConfig {
    /// Silence required to flush an utterance judged ambiguous.
    #[serde(default = "d_600")]
    pub min_silence_ambiguous_ms: u64,
    /// Silence required to flush an utterance judged complete.
    #[serde(default = "d_1000")]
    pub min_silence_complete_ms: u64,
    /// Safety cap: a buffer older than this flushes regardless.
    #[serde(default = "d_30000")]
    pub max_buffer_ms: u64,
    /// A buffer ending in one of these tokens is never complete.
    #[serde(default = "d_incomplete_enders")]
    pub incomplete_enders: Vec<String>,
}

impl Default for EndpointingConfig {
    fn default() -> Self {
        Self {
            min_silence_ambiguous_ms: 600,
            min_silence_complete_ms: 1_000,
            max_buffer_ms: 30_000,
            incomplete_enders: d_incomplete_enders(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default value helpers (serde)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_3() -> usize {
    3
}
fn d_16() -> usize {
    16
}
fn d_256() -> usize {
    256
}
fn d_1024() -> usize {
    1024
}
fn d_8000() -> usize {
    8_000
}
fn d_02() -> f32 {
    0.2
}
fn d_500() -> u64 {
    500
}
fn d_600() -> u64 {
    600
}
fn d_1000() -> u64 {
    1_000
}
fn d_3000() -> u64 {
    3_000
}
fn d_20000() -> u64 {
    20_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_300000() -> u64 {
    300_000
}
fn d_true() -> bool {
    true
}
fn d_fast_path_tag() -> String {
    "chitchat".into()
}
fn d_fingerprint_keys() -> Vec<String> {
    vec!["session_id".into()]
}
fn d_fast_path_fail() -> String {
    "Sorry, I didn't catch that — could you say it again?".into()
}
fn d_all_failed() -> String {
    "I couldn't get an answer for that right now. Please try again in a moment.".into()
}
fn d_chitchat_patterns() -> Vec<String> {
    vec![
        r"^(hi|hello|hey|yo|howdy)$".into(),
        r"^good (morning|afternoon|evening|night)$".into(),
        r"^how are you( doing| today)?$".into(),
        r"^(thanks|thank you|thx|ty)( so much| a lot)?$".into(),
        r"^(ok|okay|k|cool|nice|great|awesome|perfect|got it|sounds good)$".into(),
        r"^(yes|yeah|yep|yup|no|nope|sure|alright)$".into(),
        r"^(bye|goodbye|see you|see ya|later)$".into(),
        r"^what('s| is) up$".into(),
    ]
}
fn d_map_intent_patterns() -> Vec<String> {
    vec![
        r"\bon (a|the) map\b".into(),
        r"\bmap (view|of)\b".into(),
        r"\bshow\b.*\bmap\b".into(),
        r"\bwhere (is|are)\b".into(),
    ]
}
fn d_incomplete_enders() -> Vec<String> {
    [
        // Conjunctions.
        "and", "or", "but", "so", "because", "although", "while", "if", "then", "than",
        // Prepositions.
        "to", "of", "in", "on", "at", "for", "from", "by", "about", "with", "without", "near",
        "between", "into", "over", "under", "after", "before", "during", "versus", "vs", "per",
        // Determiners and possessives.
        "the", "a", "an", "my", "your", "his", "her", "their", "our", "its", "this", "that",
        "these", "those", "some", "any",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_defaults() {
        let c = SelectionConfig::default();
        assert_eq!(c.max_experts, 3);
        assert_eq!(c.strategy, SelectionStrategy::Hybrid);
        assert!((c.similarity_floor - 0.2).abs() < f32::EPSILON);
        assert_eq!(c.fast_path_tag, "chitchat");
        assert!(!c.chitchat_patterns.is_empty());
    }

    #[test]
    fn execution_defaults() {
        let c = ExecutionConfig::default();
        assert_eq!(c.expert_timeout_ms, 20_000);
        assert_eq!(c.request_deadline_ms, 30_000);
        assert_eq!(c.fast_path_deadline_ms, 3_000);
        assert_eq!(c.cancel_grace_ms, 500);
        assert_eq!(c.max_concurrent_experts, 16);
        assert_eq!(c.admission_wait_ms, 1_000);
    }

    #[test]
    fn cache_defaults() {
        let c = CacheConfig::default();
        assert!(c.enabled);
        assert_eq!(c.ttl_ms, 300_000);
        assert_eq!(c.max_entries, 1024);
        assert_eq!(c.fingerprint_context_keys, vec!["session_id".to_string()]);
    }

    #[test]
    fn endpointing_defaults() {
        let c = EndpointingConfig::default();
        assert_eq!(c.min_silence_ambiguous_ms, 600);
        assert_eq!(c.min_silence_complete_ms, 1_000);
        assert_eq!(c.max_buffer_ms, 30_000);
        assert!(c.incomplete_enders.iter().any(|w| w == "and"));
        assert!(c.incomplete_enders.iter().any(|w| w == "the"));
    }

    #[test]
    fn strategy_deserializes_lowercase() {
        let s: SelectionStrategy = serde_json::from_str("\"keyword\"").unwrap();
        assert_eq!(s, SelectionStrategy::Keyword);
    }
}
