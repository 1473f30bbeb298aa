//! Per-request trace channel.
//!
//! Each request opens a handle; components emit ordered events through it;
//! zero or more observers (dashboard, logs, tests) subscribe for a live
//! stream. Closing the handle seals everything into an immutable
//! [`MoETrace`]. The sealed trace is authoritative; live subscribers are
//! best-effort and may be dropped under backpressure.
//!
//! Sealed traces are kept in a bounded ring for dashboard queries, newest
//! last.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use ens_domain::config::TraceConfig;
use ens_domain::query::Query;
use ens_domain::trace::{ExpertSummary, MoETrace, TraceEvent, TraceEventKind, Window};

/// A boxed async stream of trace events.
pub type EventStream = Pin<Box<dyn futures_core::Stream<Item = TraceEvent> + Send>>;

/// External observer notified of every event and the sealed trace.
pub trait TraceSink: Send + Sync {
    fn on_event(&self, event: &TraceEvent);
    fn on_close(&self, trace: &MoETrace);
}

/// Sink that mirrors every trace event into the process log.
pub struct LogSink;

impl TraceSink for LogSink {
    fn on_event(&self, event: &TraceEvent) {
        event.log();
    }

    fn on_close(&self, trace: &MoETrace) {
        tracing::info!(
            request_id = %trace.request_id,
            latency_ms = trace.latency_ms,
            cache_hit = trace.cache_hit,
            experts = trace.per_expert.len(),
            "trace sealed"
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live, cloneable handle to one request's trace.
#[derive(Clone)]
pub struct TraceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    request_id: String,
    sinks: Arc<Vec<Arc<dyn TraceSink>>>,
    state: Mutex<HandleState>,
}

struct HandleState {
    next_seq: u64,
    events: Vec<TraceEvent>,
    /// Live fan-out; taken on close so subscriber streams terminate.
    tx: Option<broadcast::Sender<TraceEvent>>,
    closed: bool,
    // Incrementally assembled summary, frozen on close.
    opened_at: DateTime<Utc>,
    query: Query,
    selection_window: Option<Window>,
    execution_window: Option<Window>,
    mixing_window: Option<Window>,
    selected_expert_ids: Vec<String>,
    per_expert: Vec<ExpertSummary>,
    cache_hit: bool,
}

impl TraceHandle {
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// Append an event. Assigns the next `seq`, fans out to live
    /// subscribers and sinks. Emissions after close are discarded.
    pub fn emit(&self, kind: TraceEventKind) {
        let event = {
            let mut state = self.inner.state.lock();
            if state.closed {
                tracing::warn!(
                    request_id = %self.inner.request_id,
                    "trace event emitted after close, discarding"
                );
                return;
            }
            state.next_seq += 1;
            let event = TraceEvent {
                seq: state.next_seq,
                timestamp: Utc::now(),
                kind,
            };
            state.events.push(event.clone());
            if let Some(tx) = &state.tx {
                // No receivers is fine; replay covers late subscribers.
                let _ = tx.send(event.clone());
            }
            event
        };

        // Sinks run outside the lock; a slow sink must not stall emitters.
        for sink in self.inner.sinks.iter() {
            sink.on_event(&event);
        }
    }

    pub fn set_selection_window(&self, window: Window) {
        self.inner.state.lock().selection_window = Some(window);
    }

    pub fn set_execution_window(&self, window: Window) {
        self.inner.state.lock().execution_window = Some(window);
    }

    pub fn set_mixing_window(&self, window: Window) {
        self.inner.state.lock().mixing_window = Some(window);
    }

    pub fn set_cache_hit(&self) {
        self.inner.state.lock().cache_hit = true;
    }

    pub fn record_selection(&self, expert_ids: &[String]) {
        self.inner.state.lock().selected_expert_ids = expert_ids.to_vec();
    }

    pub fn record_results<'a, I>(&self, results: I)
    where
        I: IntoIterator<Item = &'a ens_domain::expert::ExpertResult>,
    {
        let summaries: Vec<ExpertSummary> = results.into_iter().map(ExpertSummary::from).collect();
        self.inner.state.lock().per_expert = summaries;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns trace configuration, registered sinks, and the ring of recently
/// sealed traces.
pub struct TraceBus {
    buffer_max: usize,
    history_max: usize,
    sinks: RwLock<Arc<Vec<Arc<dyn TraceSink>>>>,
    history: Mutex<VecDeque<MoETrace>>,
}

impl TraceBus {
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            buffer_max: config.buffer_max.max(1),
            history_max: config.history_max,
            sinks: RwLock::new(Arc::new(Vec::new())),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Register an observer for all future traces.
    pub fn add_sink(&self, sink: Arc<dyn TraceSink>) {
        let mut sinks = self.sinks.write();
        let mut next = sinks.as_ref().clone();
        next.push(sink);
        *sinks = Arc::new(next);
    }

    /// Start a trace for one request.
    pub fn open(&self, query: &Query) -> TraceHandle {
        let (tx, _) = broadcast::channel(self.buffer_max);
        TraceHandle {
            inner: Arc::new(HandleInner {
                request_id: query.id.clone(),
                sinks: self.sinks.read().clone(),
                state: Mutex::new(HandleState {
                    next_seq: 0,
                    events: Vec::new(),
                    tx: Some(tx),
                    closed: false,
                    opened_at: Utc::now(),
                    query: query.clone(),
                    selection_window: None,
                    execution_window: None,
                    mixing_window: None,
                    selected_expert_ids: Vec::new(),
                    per_expert: Vec::new(),
                    cache_hit: false,
                }),
            }),
        }
    }

    /// Subscribe to a trace. Yields every event already emitted, then live
    /// events until the trace closes. A subscriber lagging past the buffer
    /// window receives one `SubscriberDropped` marker and its stream ends;
    /// the sealed trace is unaffected.
    pub fn subscribe(&self, handle: &TraceHandle) -> EventStream {
        let (snapshot, rx) = {
            let state = handle.inner.state.lock();
            let rx = state.tx.as_ref().map(|tx| tx.subscribe());
            (state.events.clone(), rx)
        };

        Box::pin(async_stream::stream! {
            let mut last_seq = 0u64;
            for event in snapshot {
                last_seq = event.seq;
                yield event;
            }
            let Some(mut rx) = rx else { return };
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // The replay snapshot may overlap the live feed.
                        if event.seq > last_seq {
                            last_seq = event.seq;
                            yield event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield TraceEvent {
                            seq: last_seq + 1,
                            timestamp: Utc::now(),
                            kind: TraceEventKind::SubscriberDropped { missed },
                        };
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Seal the trace. No further events are accepted; subscriber streams
    /// end once they drain. Returns the immutable record and retains a
    /// copy in the history ring.
    pub fn close(&self, handle: TraceHandle) -> MoETrace {
        let trace = {
            let mut state = handle.inner.state.lock();
            state.closed = true;
            state.tx = None;
            MoETrace {
                request_id: handle.inner.request_id.clone(),
                query: state.query.clone(),
                selection_window: state.selection_window,
                execution_window: state.execution_window,
                mixing_window: state.mixing_window,
                selected_expert_ids: state.selected_expert_ids.clone(),
                per_expert: state.per_expert.clone(),
                latency_ms: (Utc::now() - state.opened_at).num_milliseconds().max(0) as u64,
                cache_hit: state.cache_hit,
                // Cloned, not drained: buffered events stay deliverable to
                // late subscribers until the handle itself is dropped.
                emitted_events: state.events.clone(),
            }
        };

        for sink in handle.inner.sinks.iter() {
            sink.on_close(&trace);
        }

        if self.history_max > 0 {
            let mut history = self.history.lock();
            history.push_back(trace.clone());
            while history.len() > self.history_max {
                history.pop_front();
            }
        }

        trace
    }

    /// Recently sealed traces, oldest first.
    pub fn recent(&self) -> Vec<MoETrace> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn bus() -> TraceBus {
        TraceBus::new(&TraceConfig::default())
    }

    fn open(bus: &TraceBus) -> TraceHandle {
        bus.open(&Query::new("q-1", "hello"))
    }

    #[test]
    fn seq_is_strictly_increasing() {
        let bus = bus();
        let handle = open(&bus);
        handle.emit(TraceEventKind::SelectionBegin);
        handle.emit(TraceEventKind::MixingBegin);
        handle.emit(TraceEventKind::MixingEnd);

        let trace = bus.close(handle);
        let seqs: Vec<u64> = trace.emitted_events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn emit_after_close_is_discarded() {
        let bus = bus();
        let handle = open(&bus);
        let clone = handle.clone();
        handle.emit(TraceEventKind::SelectionBegin);
        let trace = bus.close(handle);
        assert_eq!(trace.emitted_events.len(), 1);

        // The surviving clone can no longer grow the sealed trace.
        clone.emit(TraceEventKind::MixingBegin);
    }

    #[tokio::test]
    async fn late_subscriber_replays_then_ends_on_close() {
        let bus = bus();
        let handle = open(&bus);
        handle.emit(TraceEventKind::SelectionBegin);
        handle.emit(TraceEventKind::MixingBegin);

        let stream = bus.subscribe(&handle);
        handle.emit(TraceEventKind::MixingEnd);
        bus.close(handle);

        let events: Vec<TraceEvent> = stream.collect().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn subscriber_after_close_gets_buffered_events() {
        let bus = bus();
        let handle = open(&bus);
        handle.emit(TraceEventKind::CacheHit);
        let subscriber_handle = handle.clone();
        bus.close(handle);

        let events: Vec<TraceEvent> = bus.subscribe(&subscriber_handle).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, TraceEventKind::CacheHit));
    }

    #[tokio::test]
    async fn lagging_subscriber_is_dropped_with_marker() {
        let bus = TraceBus::new(&TraceConfig {
            buffer_max: 4,
            history_max: 16,
        });
        let handle = open(&bus);
        let mut stream = bus.subscribe(&handle);

        // Flood well past the live window without draining the stream.
        for _ in 0..64 {
            handle.emit(TraceEventKind::MixingBegin);
        }

        let mut saw_drop = false;
        while let Some(event) = stream.next().await {
            if matches!(event.kind, TraceEventKind::SubscriberDropped { .. }) {
                saw_drop = true;
                break;
            }
        }
        assert!(saw_drop);

        // The sealed trace still carries everything.
        let trace = bus.close(handle);
        assert_eq!(trace.emitted_events.len(), 64);
    }

    #[test]
    fn history_ring_is_bounded() {
        let bus = TraceBus::new(&TraceConfig {
            buffer_max: 8,
            history_max: 2,
        });
        for i in 0..5 {
            let handle = bus.open(&Query::new(format!("q-{i}"), "x"));
            bus.close(handle);
        }
        let recent = bus.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, "q-3");
        assert_eq!(recent[1].request_id, "q-4");
    }

    #[test]
    fn sink_sees_events_and_close() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counting {
            events: AtomicUsize,
            closes: AtomicUsize,
        }
        impl TraceSink for Counting {
            fn on_event(&self, _event: &TraceEvent) {
                self.events.fetch_add(1, Ordering::SeqCst);
            }
            fn on_close(&self, _trace: &MoETrace) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = bus();
        let sink = Arc::new(Counting::default());
        bus.add_sink(sink.clone());

        let handle = open(&bus);
        handle.emit(TraceEventKind::SelectionBegin);
        handle.emit(TraceEventKind::FastPath);
        bus.close(handle);

        assert_eq!(sink.events.load(Ordering::SeqCst), 2);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }
}
