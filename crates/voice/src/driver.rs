//! The voice front-end: consumes a transcription event stream, assembles
//! utterances via the [`Endpointer`](crate::endpointing::Endpointer), and
//! dispatches each completed utterance to the orchestrator.
//!
//! The loop is event-driven with one timer: between events it sleeps
//! until the endpointer's wake deadline (silence horizon or buffer-age
//! cap) and re-checks. Responses go out over an `mpsc` channel supplied
//! by the caller; routing errors are logged and the loop keeps going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use ens_domain::response::FinalResponse;
use ens_orchestrator::chitchat::ChitchatClassifier;
use ens_orchestrator::orchestrator::Orchestrator;

use crate::endpointing::{Decision, Endpointer, SpeechEvent};

/// Fallback poll interval while nothing is buffered.
const IDLE_WAKE: Duration = Duration::from_secs(60);

pub struct VoiceDriver {
    orchestrator: Arc<Orchestrator>,
    endpointer: Endpointer,
}

impl VoiceDriver {
    /// Build a driver sharing the orchestrator's endpointing thresholds
    /// and chitchat patterns, so voice and text entry points classify
    /// identically.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = orchestrator.config();
        let endpointer = Endpointer::new(
            config.endpointing.clone(),
            ChitchatClassifier::new(&config.selection.chitchat_patterns),
        );
        Self {
            orchestrator,
            endpointer,
        }
    }

    /// Consume the speech stream until it ends. Every endpointed
    /// utterance is routed through the orchestrator and the response sent
    /// to `responses`. A non-empty buffer is flushed when the source
    /// closes, so trailing words are never lost.
    pub async fn run<S>(mut self, mut source: S, responses: mpsc::Sender<FinalResponse>)
    where
        S: futures_core::Stream<Item = SpeechEvent> + Unpin + Send,
    {
        loop {
            let wake = self.wake_in();
            tokio::select! {
                event = source.next() => {
                    match event {
                        Some(event) => {
                            if self.endpointer.handle_event(&event) == Decision::Endpoint {
                                self.flush(&responses).await;
                            }
                        }
                        None => {
                            if !self.endpointer.is_empty() {
                                tracing::debug!("speech source closed, flushing remainder");
                                self.flush(&responses).await;
                            }
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep(wake) => {
                    if self.endpointer.check_silence(Utc::now()) == Decision::Endpoint {
                        self.flush(&responses).await;
                    }
                }
            }
        }
    }

    fn wake_in(&self) -> Duration {
        match self.endpointer.wake_deadline() {
            Some(deadline) => (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(1)),
            None => IDLE_WAKE,
        }
    }

    async fn flush(&mut self, responses: &mpsc::Sender<FinalResponse>) {
        let Some(text) = self.endpointer.take_utterance() else {
            return;
        };

        let mut context = HashMap::new();
        context.insert(
            "utterance_id".to_string(),
            serde_json::json!(Uuid::new_v4().to_string()),
        );
        let query = self.orchestrator.new_query_with_context(text, context);
        let request_id = query.id.clone();
        tracing::info!(request_id = %request_id, "dispatching endpointed utterance");

        match self.orchestrator.route_query(query).await {
            Ok(response) => {
                if responses.send(response).await.is_err() {
                    tracing::debug!(request_id = %request_id, "response receiver dropped");
                }
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "utterance routing failed");
            }
        }
    }
}
