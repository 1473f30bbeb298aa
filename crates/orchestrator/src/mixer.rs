//! Result mixing.
//!
//! Turns a collected set of expert results into the user-facing text and
//! payload list. Machine-readable payloads (maps, images, JSON blocks)
//! never pass through the summarizer; it sees a placeholder token and the
//! raw block is appended verbatim. Code blocks do travel through the
//! summarizer, fencing intact.
//!
//! Deterministic for fixed inputs: contributions always feed the
//! summarizer in selection order, and the concatenation fallback uses the
//! same order.

use std::sync::Arc;

use regex::Regex;

use ens_domain::config::MixerConfig;
use ens_domain::error::Result;
use ens_domain::expert::{ExpertResult, PayloadKind, StructuredPayload};
use ens_domain::query::Query;
use ens_domain::trace::SelectionMode;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Composes one answer from several expert contributions. External and
/// possibly non-deterministic; the mixer treats it as a black box.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        query_text: &str,
        contributions: &[(String, String)],
    ) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct MapMarker {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

/// Extracts `(name, address)` pairs from result text and geocodes them,
/// used when a query asked for a map but no expert produced one.
#[async_trait::async_trait]
pub trait GeocodingFallback: Send + Sync {
    async fn extract_and_geocode(&self, text: &str) -> Result<Vec<MapMarker>>;
}

/// Detects that a query asked for a map view. Pure and swappable.
pub struct MapIntentDetector {
    patterns: Vec<Regex>,
}

impl MapIntentDetector {
    pub fn new(patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "skipping invalid map intent pattern");
                    None
                }
            })
            .collect();
        Self { patterns: compiled }
    }

    pub fn wants_map(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.patterns.iter().any(|re| re.is_match(&lowered))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mixer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Mixer {
    summarizer: Option<Arc<dyn Summarizer>>,
    geocoder: Option<Arc<dyn GeocodingFallback>>,
    map_intent: MapIntentDetector,
}

impl Mixer {
    pub fn new(
        config: &MixerConfig,
        summarizer: Option<Arc<dyn Summarizer>>,
        geocoder: Option<Arc<dyn GeocodingFallback>>,
    ) -> Self {
        Self {
            summarizer,
            geocoder,
            map_intent: MapIntentDetector::new(&config.map_intent_patterns),
        }
    }

    /// Produce `(text, payloads)` from the collected results. Failed
    /// experts never contribute to user-facing text; they live on in the
    /// trace only.
    pub async fn mix(
        &self,
        query: &Query,
        results: &[ExpertResult],
        mode: SelectionMode,
        config: &MixerConfig,
    ) -> (String, Vec<StructuredPayload>) {
        if mode == SelectionMode::FastPath {
            // Exactly one expert ran; its output is forwarded untouched.
            return match results.iter().find(|r| r.status.is_success()) {
                Some(r) => (r.text_output.clone(), r.structured_payloads.clone()),
                None => (config.fast_path_fail_fallback.clone(), Vec::new()),
            };
        }

        let successes: Vec<&ExpertResult> =
            results.iter().filter(|r| r.status.is_success()).collect();
        if successes.is_empty() {
            return (config.all_failed_fallback.clone(), Vec::new());
        }

        let (text, mut payloads) = if successes.len() == 1 {
            let only = successes[0];
            (only.text_output.clone(), only.structured_payloads.clone())
        } else {
            self.synthesize(query, &successes).await
        };

        // Map intent with no map produced: geocode venues out of the text.
        let has_map = payloads.iter().any(|p| p.kind == PayloadKind::InteractiveMap);
        if !has_map && self.map_intent.wants_map(&query.text) {
            if let Some(payload) = self.geocode_fallback(&successes).await {
                payloads.push(payload);
            }
        }

        (text, payloads)
    }

    /// Multi-expert synthesis: preserved payloads are swapped for
    /// placeholder tokens before the summarizer sees the text, then
    /// appended verbatim after its answer.
    async fn synthesize(
        &self,
        query: &Query,
        successes: &[&ExpertResult],
    ) -> (String, Vec<StructuredPayload>) {
        let mut preserved: Vec<StructuredPayload> = Vec::new();
        let mut contributions: Vec<(String, String)> = Vec::new();

        for result in successes {
            let mut text = result.text_output.clone();
            for payload in &result.structured_payloads {
                if !payload.kind.preserved_verbatim() {
                    continue;
                }
                let placeholder = format!("[attachment:{}]", payload.kind.label());
                text = match payload.span {
                    // Carved out of the text: substitute in place.
                    Some((start, end))
                        if start <= end
                            && end <= text.len()
                            && text.is_char_boundary(start)
                            && text.is_char_boundary(end) =>
                    {
                        format!("{}{}{}", &text[..start], placeholder, &text[end..])
                    }
                    _ => {
                        if text.is_empty() {
                            placeholder
                        } else {
                            format!("{text}\n{placeholder}")
                        }
                    }
                };
                preserved.push(payload.clone());
            }
            contributions.push((result.expert_id.clone(), text));
        }

        let body = match &self.summarizer {
            Some(summarizer) => {
                match summarizer.summarize(&query.text, &contributions).await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(error = %e, "summarizer failed, concatenating results");
                        concatenate(&contributions)
                    }
                }
            }
            None => concatenate(&contributions),
        };

        let mut text = body;
        for payload in &preserved {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&payload.raw);
        }

        (text, preserved)
    }

    async fn geocode_fallback(&self, successes: &[&ExpertResult]) -> Option<StructuredPayload> {
        let geocoder = self.geocoder.as_ref()?;
        let combined = successes
            .iter()
            .map(|r| r.text_output.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if combined.is_empty() {
            return None;
        }

        match geocoder.extract_and_geocode(&combined).await {
            Ok(markers) if markers.len() >= 2 => {
                let raw = serde_json::json!({
                    "markers": markers
                        .iter()
                        .map(|m| serde_json::json!({"name": m.name, "lat": m.lat, "lng": m.lng}))
                        .collect::<Vec<_>>(),
                })
                .to_string();
                tracing::info!(markers = markers.len(), "synthesized map via geocoding fallback");
                Some(StructuredPayload::new(PayloadKind::InteractiveMap, raw))
            }
            Ok(markers) => {
                tracing::debug!(markers = markers.len(), "too few markers for a map");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "geocoding fallback failed");
                None
            }
        }
    }
}

/// Summarizer-failure fallback: successful texts in selection order,
/// blank-line separated.
fn concatenate(contributions: &[(String, String)]) -> String {
    contributions
        .iter()
        .map(|(_, text)| text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
