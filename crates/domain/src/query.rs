use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A user query routed through the orchestrator.
///
/// Immutable once constructed. `id` is orchestrator-assigned and
/// monotonically unique within the process (`"q-17"`), so traces and cache
/// diagnostics can always be correlated back to a request.
#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub id: String,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
    /// Session memory handles and routing hints (e.g. `session_id`,
    /// `utterance_id`). Values the cache fingerprints on are configured
    /// separately.
    pub context: HashMap<String, serde_json::Value>,
}

impl Query {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            submitted_at: Utc::now(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    /// Fetch a context value as a string, if present and a string.
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_str_lookup() {
        let mut ctx = HashMap::new();
        ctx.insert("session_id".to_string(), serde_json::json!("s-42"));
        ctx.insert("depth".to_string(), serde_json::json!(3));
        let q = Query::new("q-1", "hello").with_context(ctx);

        assert_eq!(q.context_str("session_id"), Some("s-42"));
        // Non-string values are not coerced.
        assert_eq!(q.context_str("depth"), None);
        assert_eq!(q.context_str("missing"), None);
    }
}
