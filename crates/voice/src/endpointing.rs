//! Semantic endpointing.
//!
//! Deciding when a speaker has finished is what keeps long queries from
//! fragmenting: a fixed "flush after N ms of silence" rule chops
//! multi-clause requests into useless pieces. Instead, each transcript
//! update is scored for completeness, and the silence required before
//! flushing scales with how finished the text looks.
//!
//! Everything here is pure state over explicit clocks, with no timers
//! and no I/O, so the decision table is unit-testable tick by tick. The async
//! loop in [`driver`](crate::driver) owns the actual timers.

use chrono::{DateTime, Utc};

use ens_domain::config::EndpointingConfig;
use ens_orchestrator::chitchat::ChitchatClassifier;
use ens_orchestrator::selector::tokenize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Incomplete,
    Ambiguous,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The utterance is clearly unfinished; keep buffering.
    Continue,
    /// Plausibly finished; hold for more silence before flushing.
    Wait,
    /// Flush the buffer and dispatch.
    Endpoint,
}

/// Interrogative openers. Auxiliaries ("can", "could") are deliberately
/// absent: "can you show me" opens a question but is rarely the whole of
/// one.
const QUESTION_WORDS: &[&str] = &[
    "who", "what", "when", "where", "why", "how", "which", "whose", "whom",
];

/// Tokens that suggest the text carries a predicate.
const VERB_HINTS: &[&str] = &[
    "is", "are", "was", "were", "am", "be", "been", "show", "find", "get", "tell", "give", "go",
    "see", "know", "think", "make", "want", "need", "help", "look", "search", "book", "order",
    "play", "call", "open", "close", "turn", "set", "list", "sort", "compare", "recommend",
    "take", "bring", "send", "buy", "visit", "plan", "have", "has", "had", "do", "does", "did",
];

/// Trailing tokens that pull the score down even past the hard ender
/// check (kept separate so a trimmed-down `incomplete_enders` config does
/// not disable the penalty).
const TRAILING_CONNECTIVES: &[&str] = &[
    "and", "or", "but", "so", "because", "to", "of", "in", "on", "at", "for", "from", "by",
    "about", "with", "near",
];

fn is_verb_like(token: &str) -> bool {
    VERB_HINTS.contains(&token)
        || (token.len() > 4 && (token.ends_with("ing") || token.ends_with("ed")))
}

/// Score how finished a transcript looks.
pub fn assess(text: &str, config: &EndpointingConfig) -> Completeness {
    let tokens = tokenize(text);
    if tokens.len() < 3 {
        return Completeness::Incomplete;
    }
    let Some(last) = tokens.last() else {
        return Completeness::Incomplete;
    };
    if config.incomplete_enders.iter().any(|e| e == last) {
        return Completeness::Incomplete;
    }

    let mut score = 0.0f32;
    if tokens.iter().any(|t| is_verb_like(t)) {
        score += 0.4;
    }
    if QUESTION_WORDS.contains(&tokens[0].as_str()) && tokens.len() >= 3 {
        score += 0.3;
    } else if tokens.len() >= 5 {
        score += 0.3;
    }
    if text.trim_end().ends_with(['.', '!', '?']) {
        score += 0.2;
    }
    if TRAILING_CONNECTIVES.contains(&last.as_str()) {
        score -= 0.3;
    }

    if score > 0.8 {
        Completeness::Complete
    } else if score < 0.5 {
        Completeness::Incomplete
    } else {
        Completeness::Ambiguous
    }
}

/// The decision table. The buffer-age safety cap fires first, whatever
/// the completeness.
pub fn decide(
    completeness: Completeness,
    silence_ms: u64,
    buffer_ms: u64,
    config: &EndpointingConfig,
) -> Decision {
    if buffer_ms > config.max_buffer_ms {
        return Decision::Endpoint;
    }
    match completeness {
        Completeness::Incomplete => Decision::Continue,
        Completeness::Ambiguous => {
            if silence_ms >= config.min_silence_ambiguous_ms {
                Decision::Endpoint
            } else {
                Decision::Wait
            }
        }
        Completeness::Complete => {
            if silence_ms >= config.min_silence_complete_ms {
                Decision::Endpoint
            } else {
                Decision::Wait
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Speech events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEventKind {
    /// Partial hypothesis; refreshes the silence clock only.
    Interim,
    /// Committed transcript fragment; appended to the buffer.
    Final,
    /// The transcriber's own voice-activity signal that speech stopped.
    EndOfSpeech,
}

#[derive(Debug, Clone)]
pub struct SpeechEvent {
    pub kind: SpeechEventKind,
    pub text: String,
    pub arrived_at: DateTime<Utc>,
}

impl SpeechEvent {
    pub fn interim(text: impl Into<String>, arrived_at: DateTime<Utc>) -> Self {
        Self { kind: SpeechEventKind::Interim, text: text.into(), arrived_at }
    }

    pub fn final_text(text: impl Into<String>, arrived_at: DateTime<Utc>) -> Self {
        Self { kind: SpeechEventKind::Final, text: text.into(), arrived_at }
    }

    pub fn end_of_speech(arrived_at: DateTime<Utc>) -> Self {
        Self { kind: SpeechEventKind::EndOfSpeech, text: String::new(), arrived_at }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpointer state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Buffers transcript fragments and applies the decision rules.
///
/// Silence thresholds are consulted at two points:
/// - on `EndOfSpeech` events, with the silence the transcriber measured —
///   this is where the ambiguous threshold can fire early;
/// - on timer re-checks (no new events), where the flush horizon is the
///   complete-silence threshold. A `Final` arriving mid-gap resets the
///   clock, which is what keeps 600–900 ms pauses between clauses from
///   fragmenting a long request.
///
/// Chitchat fragments endpoint immediately on `Final`; no reason to make
/// "thanks" wait out a silence window.
pub struct Endpointer {
    config: EndpointingConfig,
    chitchat: ChitchatClassifier,
    fragments: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

impl Endpointer {
    pub fn new(config: EndpointingConfig, chitchat: ChitchatClassifier) -> Self {
        Self {
            config,
            chitchat,
            fragments: Vec::new(),
            started_at: None,
            last_update: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// The buffered utterance so far, fragments joined by single spaces.
    pub fn buffered_text(&self) -> String {
        self.fragments.join(" ")
    }

    fn buffer_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    fn silence_ms(&self, now: DateTime<Utc>) -> u64 {
        self.last_update
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Feed one speech event; the event's own arrival time is the clock.
    pub fn handle_event(&mut self, event: &SpeechEvent) -> Decision {
        let now = event.arrived_at;
        match event.kind {
            SpeechEventKind::Interim => {
                if !event.text.trim().is_empty() {
                    self.started_at.get_or_insert(now);
                    self.last_update = Some(now);
                }
                Decision::Continue
            }
            SpeechEventKind::Final => {
                let text = event.text.trim();
                if !text.is_empty() {
                    self.started_at.get_or_insert(now);
                    self.fragments.push(text.to_string());
                }
                self.last_update = Some(now);

                if self.fragments.is_empty() {
                    return Decision::Continue;
                }
                let buffered = self.buffered_text();
                if self.chitchat.is_chitchat(&buffered) {
                    return Decision::Endpoint;
                }
                // This event just reset the silence clock; only the
                // buffer-age cap can flush here.
                decide(
                    assess(&buffered, &self.config),
                    0,
                    self.buffer_ms(now),
                    &self.config,
                )
            }
            SpeechEventKind::EndOfSpeech => {
                if self.fragments.is_empty() {
                    return Decision::Continue;
                }
                decide(
                    assess(&self.buffered_text(), &self.config),
                    self.silence_ms(now),
                    self.buffer_ms(now),
                    &self.config,
                )
            }
        }
    }

    /// Timer re-check between events.
    pub fn check_silence(&self, now: DateTime<Utc>) -> Decision {
        if self.fragments.is_empty() {
            return Decision::Continue;
        }
        let completeness = assess(&self.buffered_text(), &self.config);
        let silence = self.silence_ms(now);
        let buffer = self.buffer_ms(now);
        match completeness {
            // Unfinished text only flushes via the age cap.
            Completeness::Incomplete => decide(completeness, silence, buffer, &self.config),
            // Between events the flush horizon is the conservative
            // complete-silence threshold, whatever the score says; a
            // mid-gap Final resets the clock before we get here.
            _ => {
                if buffer > self.config.max_buffer_ms
                    || silence >= self.config.min_silence_complete_ms
                {
                    Decision::Endpoint
                } else {
                    Decision::Wait
                }
            }
        }
    }

    /// When the driver should wake if no further events arrive.
    pub fn wake_deadline(&self) -> Option<DateTime<Utc>> {
        let started_at = self.started_at?;
        let cap = started_at + chrono::Duration::milliseconds(self.config.max_buffer_ms as i64 + 1);
        if self.fragments.is_empty() {
            return Some(cap);
        }
        let completeness = assess(&self.buffered_text(), &self.config);
        let deadline = match (completeness, self.last_update) {
            (Completeness::Incomplete, _) | (_, None) => cap,
            (_, Some(last)) => {
                let silence_flush = last
                    + chrono::Duration::milliseconds(self.config.min_silence_complete_ms as i64);
                silence_flush.min(cap)
            }
        };
        Some(deadline)
    }

    /// Drain the buffer, returning the assembled utterance.
    pub fn take_utterance(&mut self) -> Option<String> {
        if self.fragments.is_empty() {
            self.started_at = None;
            self.last_update = None;
            return None;
        }
        let text = self.buffered_text();
        self.fragments.clear();
        self.started_at = None;
        self.last_update = None;
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ens_domain::config::SelectionConfig;

    fn config() -> EndpointingConfig {
        EndpointingConfig::default()
    }

    fn classifier() -> ChitchatClassifier {
        ChitchatClassifier::new(&SelectionConfig::default().chitchat_patterns)
    }

    // ── assess ─────────────────────────────────────────────────────

    #[test]
    fn short_text_is_incomplete() {
        assert_eq!(assess("show me", &config()), Completeness::Incomplete);
        assert_eq!(assess("", &config()), Completeness::Incomplete);
    }

    #[test]
    fn trailing_connective_is_incomplete() {
        assert_eq!(
            assess("find me restaurants and", &config()),
            Completeness::Incomplete
        );
        assert_eq!(
            assess("what is the weather in", &config()),
            Completeness::Incomplete
        );
    }

    #[test]
    fn question_with_terminator_is_complete() {
        // 0.4 (verb) + 0.3 (question opener) + 0.2 (terminator) = 0.9.
        assert_eq!(
            assess("where is the nearest pharmacy?", &config()),
            Completeness::Complete
        );
    }

    #[test]
    fn long_statement_without_punctuation_is_ambiguous() {
        // 0.4 (verb) + 0.3 (≥5 words) = 0.7.
        assert_eq!(
            assess("show me the best greek restaurants downtown", &config()),
            Completeness::Ambiguous
        );
    }

    #[test]
    fn question_opener_with_few_words_is_incomplete() {
        // "can" is not an interrogative opener; 4 words → verb bonus only.
        assert_eq!(assess("can you show me", &config()), Completeness::Incomplete);
    }

    // ── decide ─────────────────────────────────────────────────────

    #[test]
    fn decision_table_rows() {
        let c = config();
        assert_eq!(decide(Completeness::Incomplete, 10_000, 100, &c), Decision::Continue);
        assert_eq!(decide(Completeness::Ambiguous, 599, 100, &c), Decision::Wait);
        assert_eq!(decide(Completeness::Ambiguous, 600, 100, &c), Decision::Endpoint);
        assert_eq!(decide(Completeness::Complete, 999, 100, &c), Decision::Wait);
        assert_eq!(decide(Completeness::Complete, 1_000, 100, &c), Decision::Endpoint);
    }

    #[test]
    fn buffer_cap_flushes_any_completeness() {
        let c = config();
        assert_eq!(decide(Completeness::Incomplete, 0, 30_001, &c), Decision::Endpoint);
        assert_eq!(decide(Completeness::Ambiguous, 0, 30_001, &c), Decision::Endpoint);
        assert_eq!(decide(Completeness::Complete, 0, 30_001, &c), Decision::Endpoint);
    }

    // ── endpointer ─────────────────────────────────────────────────

    fn at(base: DateTime<Utc>, offset_ms: i64) -> DateTime<Utc> {
        base + chrono::Duration::milliseconds(offset_ms)
    }

    #[test]
    fn fragmented_long_query_flushes_once() {
        let base = Utc::now();
        let mut ep = Endpointer::new(config(), classifier());

        // Three fragments, 700 ms apart: past the ambiguous threshold
        // but short of the complete one.
        assert_eq!(
            ep.handle_event(&SpeechEvent::final_text("Can you show me", at(base, 0))),
            Decision::Continue
        );
        assert_ne!(ep.check_silence(at(base, 650)), Decision::Endpoint);

        assert_ne!(
            ep.handle_event(&SpeechEvent::final_text(
                "the top three Greek restaurants in San Francisco",
                at(base, 700),
            )),
            Decision::Endpoint
        );
        assert_ne!(ep.check_silence(at(base, 1_350)), Decision::Endpoint);

        assert_ne!(
            ep.handle_event(&SpeechEvent::final_text("sorted by rating", at(base, 1_400))),
            Decision::Endpoint
        );

        // Not yet: silence after the last fragment is below the complete
        // threshold.
        assert_ne!(ep.check_silence(at(base, 2_300)), Decision::Endpoint);
        // Past it: flush exactly one assembled utterance.
        assert_eq!(ep.check_silence(at(base, 2_450)), Decision::Endpoint);
        assert_eq!(
            ep.take_utterance().as_deref(),
            Some("Can you show me the top three Greek restaurants in San Francisco sorted by rating")
        );
        assert!(ep.is_empty());
    }

    #[test]
    fn chitchat_final_endpoints_immediately() {
        let base = Utc::now();
        let mut ep = Endpointer::new(config(), classifier());
        assert_eq!(
            ep.handle_event(&SpeechEvent::final_text("thanks!", base)),
            Decision::Endpoint
        );
        assert_eq!(ep.take_utterance().as_deref(), Some("thanks!"));
    }

    #[test]
    fn end_of_speech_uses_measured_silence() {
        let base = Utc::now();
        let mut ep = Endpointer::new(config(), classifier());
        ep.handle_event(&SpeechEvent::final_text(
            "show me the best greek restaurants downtown",
            base,
        ));

        // Ambiguous buffer: the transcriber-confirmed 650 ms silence is
        // past the ambiguous threshold.
        assert_eq!(
            ep.handle_event(&SpeechEvent::end_of_speech(at(base, 650))),
            Decision::Endpoint
        );
    }

    #[test]
    fn interim_refreshes_silence_clock() {
        let base = Utc::now();
        let mut ep = Endpointer::new(config(), classifier());
        ep.handle_event(&SpeechEvent::final_text(
            "show me the best greek restaurants downtown",
            base,
        ));
        ep.handle_event(&SpeechEvent::interim("and also", at(base, 900)));

        // 1 100 ms after the Final, but only 200 ms after the interim.
        assert_ne!(ep.check_silence(at(base, 1_100)), Decision::Endpoint);
        assert_eq!(ep.check_silence(at(base, 1_950)), Decision::Endpoint);
    }

    #[test]
    fn buffer_age_cap_flushes_incomplete_text() {
        let base = Utc::now();
        let mut ep = Endpointer::new(
            EndpointingConfig {
                max_buffer_ms: 2_000,
                ..config()
            },
            classifier(),
        );
        ep.handle_event(&SpeechEvent::final_text("find me a", base));
        assert_eq!(ep.check_silence(at(base, 1_999)), Decision::Continue);
        assert_eq!(ep.check_silence(at(base, 2_100)), Decision::Endpoint);
    }

    #[test]
    fn empty_final_does_not_start_a_buffer() {
        let base = Utc::now();
        let mut ep = Endpointer::new(config(), classifier());
        assert_eq!(
            ep.handle_event(&SpeechEvent::final_text("   ", base)),
            Decision::Continue
        );
        assert!(ep.is_empty());
        assert!(ep.take_utterance().is_none());
    }

    #[test]
    fn wake_deadline_tracks_completeness() {
        let base = Utc::now();
        let mut ep = Endpointer::new(config(), classifier());
        assert!(ep.wake_deadline().is_none());

        // Incomplete buffer → wake at the age cap.
        ep.handle_event(&SpeechEvent::final_text("find me a", base));
        let cap_wake = ep.wake_deadline().unwrap();
        assert!(cap_wake > at(base, 30_000));

        // Ambiguous buffer → wake at the complete-silence horizon.
        ep.handle_event(&SpeechEvent::final_text(
            "good greek restaurant downtown please",
            at(base, 500),
        ));
        assert_eq!(ep.wake_deadline().unwrap(), at(base, 1_500));
    }
}
