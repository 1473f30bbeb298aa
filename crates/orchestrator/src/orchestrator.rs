//! The request pipeline: cache lookup, selection, fan-out, mixing, and
//! trace emission for one query.
//!
//! Request states: `Accepted → CacheCheck → {CacheReturn | Selecting →
//! Executing → Mixing → Completed} | Failed`. Every path closes the trace
//! and releases the cache build slot; the caller always gets either a
//! [`FinalResponse`] or a typed error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use ens_domain::config::OrchestratorConfig;
use ens_domain::error::{Error, Result};
use ens_domain::query::Query;
use ens_domain::response::FinalResponse;
use ens_domain::trace::{SelectionMode, TraceEventKind, Window};

use crate::cache::{fingerprint, ResponseCache};
use crate::executor::Executor;
use crate::mixer::{GeocodingFallback, Mixer, Summarizer};
use crate::registry::{ExpertRegistry, RegisteredExpert};
use crate::selector::{QueryEmbedder, Selector};
use crate::tracebus::{TraceBus, TraceHandle};

/// External services the pipeline consults. All optional; the
/// orchestrator degrades gracefully without them (concatenation instead
/// of synthesis, keyword-only selection, no map fallback).
#[derive(Default)]
pub struct Collaborators {
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub geocoder: Option<Arc<dyn GeocodingFallback>>,
    pub embedder: Option<Arc<dyn QueryEmbedder>>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ExpertRegistry>,
    cache: ResponseCache,
    bus: TraceBus,
    selector: Selector,
    executor: Executor,
    mixer: Mixer,
    next_query_seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let selector = Selector::new(&config.selection, collaborators.embedder);
        let executor = Executor::new(&config.execution);
        let mixer = Mixer::new(
            &config.mixer,
            collaborators.summarizer,
            collaborators.geocoder,
        );
        Self {
            registry: Arc::new(ExpertRegistry::new()),
            cache: ResponseCache::new(&config.cache),
            bus: TraceBus::new(&config.trace),
            selector,
            executor,
            mixer,
            next_query_seq: AtomicU64::new(0),
            config,
        }
    }

    pub fn registry(&self) -> &ExpertRegistry {
        &self.registry
    }

    pub fn trace_bus(&self) -> &TraceBus {
        &self.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Construct a query with the next monotonic id.
    pub fn new_query(&self, text: impl Into<String>) -> Query {
        let seq = self.next_query_seq.fetch_add(1, Ordering::Relaxed) + 1;
        Query::new(format!("q-{seq}"), text)
    }

    pub fn new_query_with_context(
        &self,
        text: impl Into<String>,
        context: std::collections::HashMap<String, serde_json::Value>,
    ) -> Query {
        self.new_query(text).with_context(context)
    }

    pub async fn route_query(&self, query: Query) -> Result<FinalResponse> {
        self.route_query_cancellable(query, CancellationToken::new())
            .await
    }

    /// Route one query through the pipeline. `cancel` is the caller's
    /// signal (e.g. client disconnect); it propagates to every expert
    /// task, and a cancelled request never populates the cache.
    pub async fn route_query_cancellable(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> Result<FinalResponse> {
        if query.text.trim().is_empty() {
            return Err(Error::InvalidQuery("empty query text".into()));
        }
        if query.text.chars().count() > self.config.max_query_chars {
            return Err(Error::InvalidQuery(format!(
                "query exceeds {} chars",
                self.config.max_query_chars
            )));
        }

        let handle = self.bus.open(&query);
        tracing::debug!(request_id = %query.id, "request accepted");

        let fp = fingerprint(&query, &self.config.cache.fingerprint_context_keys);
        if let Some(hit) = self.cache.get(&fp) {
            return Ok(self.cache_return(handle, &hit));
        }

        // Coalesce concurrent builds of the same fingerprint; whoever got
        // there first usually left the entry for us.
        let _slot = self.cache.begin_build(&fp).await;
        if let Some(hit) = self.cache.get(&fp) {
            return Ok(self.cache_return(handle, &hit));
        }

        // Selection.
        let snapshot = self.registry.snapshot();
        let selection_t0 = Utc::now();
        handle.emit(TraceEventKind::SelectionBegin);
        let outcome = self
            .selector
            .select(&query, &snapshot, &self.config.selection);
        handle.emit(TraceEventKind::SelectionEnd {
            mode: outcome.mode,
            selected: outcome.expert_ids.clone(),
            rationale: outcome.rationale.clone(),
        });
        handle.set_selection_window(Window::new(selection_t0, Utc::now()));
        handle.record_selection(&outcome.expert_ids);

        if outcome.mode == SelectionMode::FanOut && snapshot.is_empty() {
            self.bus.close(handle);
            return Err(Error::EmptyRegistry);
        }

        let deadline_ms = match outcome.mode {
            SelectionMode::FastPath => {
                handle.emit(TraceEventKind::FastPath);
                self.config.execution.fast_path_deadline_ms
            }
            SelectionMode::FanOut => self.config.execution.request_deadline_ms,
        };

        let selected: Vec<RegisteredExpert> = outcome
            .expert_ids
            .iter()
            .filter_map(|id| {
                snapshot
                    .iter()
                    .find(|e| &e.descriptor.id == id)
                    .cloned()
            })
            .collect();

        // Fan-out.
        tracing::debug!(request_id = %query.id, experts = selected.len(), "executing");
        let execution_t0 = Utc::now();
        let results = self
            .executor
            .execute(
                &query,
                &selected,
                &self.config.execution,
                deadline_ms,
                &handle,
                &cancel,
            )
            .await;
        handle.set_execution_window(Window::new(execution_t0, Utc::now()));
        handle.record_results(results.iter());

        if cancel.is_cancelled() {
            self.bus.close(handle);
            return Err(Error::Cancelled);
        }

        // Mixing.
        let mixing_t0 = Utc::now();
        handle.emit(TraceEventKind::MixingBegin);
        let (text, payloads) = self
            .mixer
            .mix(&query, &results, outcome.mode, &self.config.mixer)
            .await;
        handle.emit(TraceEventKind::MixingEnd);
        handle.set_mixing_window(Window::new(mixing_t0, Utc::now()));

        let any_success = results.iter().any(|r| r.status.is_success());
        let trace = self.bus.close(handle);
        tracing::info!(
            request_id = %trace.request_id,
            latency_ms = trace.latency_ms,
            experts = trace.per_expert.len(),
            succeeded = any_success,
            "request completed"
        );

        let response = FinalResponse {
            text,
            structured_payloads: payloads,
            trace,
        };
        if any_success {
            self.cache.put(&fp, response.clone());
        }
        Ok(response)
    }

    /// Serve a cached response, re-sealed under the current request's
    /// trace. Selector, executor, and mixer are all bypassed.
    fn cache_return(&self, handle: TraceHandle, hit: &FinalResponse) -> FinalResponse {
        handle.emit(TraceEventKind::CacheHit);
        handle.set_cache_hit();
        let trace = self.bus.close(handle);
        tracing::debug!(request_id = %trace.request_id, "cache hit");
        FinalResponse {
            text: hit.text.clone(),
            structured_payloads: hit.structured_payloads.clone(),
            trace,
        }
    }
}
