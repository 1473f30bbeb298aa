//! Concurrent expert execution.
//!
//! One task per selected expert, all bound to a shared cancellation
//! signal. The returned list preserves selection order: result `i`
//! always belongs to slot `i` no matter when it completed. A process-wide
//! admission semaphore bounds in-flight experts across every request so a
//! wide fan-out cannot exhaust downstream quotas.
//!
//! Deadlines:
//! - per expert: `min(descriptor.timeout_ms, expert_timeout_ms)`;
//! - per request: the caller-supplied deadline; when it fires, running
//!   experts are signalled, given `cancel_grace_ms` to wind down, and then
//!   abandoned with their slots marked timed out at the deadline instant.
//!
//! An expert error or panic never touches sibling slots.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ens_domain::config::ExecutionConfig;
use ens_domain::expert::{ExpertResult, ExpertStatus};
use ens_domain::query::Query;
use ens_domain::trace::TraceEventKind;

use crate::registry::RegisteredExpert;
use crate::tracebus::TraceHandle;

pub struct Executor {
    admission: Arc<Semaphore>,
}

impl Executor {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(config.max_concurrent_experts)),
        }
    }

    /// Run the selected experts concurrently and collect one result per
    /// slot. Returns when every task has terminated or been abandoned.
    ///
    /// `deadline_ms` is the request-wide cutoff (callers pass the reduced
    /// fast-path deadline where applicable). `caller_cancel` is the
    /// request's own signal; when it fires, slots resolve as cancelled.
    pub async fn execute(
        &self,
        query: &Query,
        selected: &[RegisteredExpert],
        config: &ExecutionConfig,
        deadline_ms: u64,
        trace: &TraceHandle,
        caller_cancel: &CancellationToken,
    ) -> Vec<ExpertResult> {
        if selected.is_empty() {
            return Vec::new();
        }

        let request_start = Utc::now();
        let deadline_utc = request_start + chrono::Duration::milliseconds(deadline_ms as i64);
        let deadline_at = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        let grace = Duration::from_millis(config.cancel_grace_ms);

        // Child of the caller's token: caller cancellation propagates to
        // every expert, while a deadline firing here stays local.
        let exec_token = caller_cancel.child_token();
        let query = Arc::new(query.clone());

        let mut set: JoinSet<(usize, ExpertResult)> = JoinSet::new();
        for (slot, expert) in selected.iter().enumerate() {
            let per_expert = Duration::from_millis(
                expert.descriptor.timeout_ms.min(config.expert_timeout_ms),
            );
            set.spawn(run_expert(RunArgs {
                slot,
                expert: expert.clone(),
                query: query.clone(),
                admission: self.admission.clone(),
                admission_wait: Duration::from_millis(config.admission_wait_ms),
                per_expert_deadline: per_expert,
                grace,
                deadline_utc,
                exec_token: exec_token.clone(),
                caller_cancel: caller_cancel.clone(),
                trace: trace.clone(),
            }));
        }

        let mut slots: Vec<Option<ExpertResult>> = (0..selected.len()).map(|_| None).collect();

        let drained =
            tokio::time::timeout_at(deadline_at, drain(&mut set, &mut slots)).await;
        if drained.is_err() {
            // Request deadline: signal everyone still running, give them
            // the grace window, then abandon whatever is left.
            exec_token.cancel();
            let _ = tokio::time::timeout(grace, drain(&mut set, &mut slots)).await;
            set.abort_all();
            while let Some(joined) = set.join_next().await {
                if let Ok((slot, result)) = joined {
                    slots[slot] = Some(result);
                }
            }
        }

        let mut results = Vec::with_capacity(selected.len());
        for (slot, expert) in selected.iter().enumerate() {
            let result = match slots[slot].take() {
                Some(result) => result,
                None => {
                    // Abandoned task: it never produced a terminal event.
                    let id = expert.descriptor.id.clone();
                    tracing::warn!(expert_id = %id, "expert abandoned at request deadline");
                    trace.emit(TraceEventKind::ExpertEnd {
                        expert_id: id.clone(),
                        status: ExpertStatus::Timeout,
                    });
                    ExpertResult::failed(
                        id,
                        ExpertStatus::Timeout,
                        request_start,
                        deadline_utc,
                        "request deadline exceeded",
                    )
                }
            };
            results.push(result);
        }
        results
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-expert task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunArgs {
    slot: usize,
    expert: RegisteredExpert,
    query: Arc<Query>,
    admission: Arc<Semaphore>,
    admission_wait: Duration,
    per_expert_deadline: Duration,
    grace: Duration,
    deadline_utc: DateTime<Utc>,
    exec_token: CancellationToken,
    caller_cancel: CancellationToken,
    trace: TraceHandle,
}

async fn run_expert(args: RunArgs) -> (usize, ExpertResult) {
    let RunArgs {
        slot,
        expert,
        query,
        admission,
        admission_wait,
        per_expert_deadline,
        grace,
        deadline_utc,
        exec_token,
        caller_cancel,
        trace,
    } = args;
    let id = expert.descriptor.id.clone();

    // Admission gate: a saturated pool times the slot out without ever
    // invoking the expert.
    let queued_at = Utc::now();
    let _permit = match tokio::time::timeout(admission_wait, admission.acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        _ => {
            tracing::warn!(expert_id = %id, "no execution slot within admission window");
            return (
                slot,
                ExpertResult::failed(
                    id,
                    ExpertStatus::Timeout,
                    queued_at,
                    Utc::now(),
                    "admission wait exceeded",
                ),
            );
        }
    };

    let started = Utc::now();
    trace.emit(TraceEventKind::ExpertBegin {
        expert_id: id.clone(),
    });

    let child = exec_token.child_token();
    // Panics are converted to error results here so a misbehaving expert
    // never disturbs its siblings' join handles.
    let invoke = AssertUnwindSafe(expert.handle.invoke(&query, child.clone())).catch_unwind();
    tokio::pin!(invoke);

    let result = tokio::select! {
        outcome = &mut invoke => {
            let ended = Utc::now();
            match outcome {
                Ok(Ok(mut r)) => {
                    r.expert_id = id.clone();
                    r.started_at = started;
                    r.ended_at = ended.max(started);
                    r
                }
                Ok(Err(e)) => {
                    tracing::warn!(expert_id = %id, error = %e, "expert failed");
                    ExpertResult::failed(&id, ExpertStatus::Error, started, ended, e.to_string())
                }
                Err(_) => {
                    tracing::warn!(expert_id = %id, "expert panicked");
                    ExpertResult::failed(&id, ExpertStatus::Error, started, ended, "expert panicked")
                }
            }
        }
        _ = tokio::time::sleep(per_expert_deadline) => {
            let ended = Utc::now();
            child.cancel();
            let _ = tokio::time::timeout(grace, &mut invoke).await;
            ExpertResult::failed(&id, ExpertStatus::Timeout, started, ended, "expert timeout")
        }
        _ = exec_token.cancelled() => {
            child.cancel();
            let _ = tokio::time::timeout(grace, &mut invoke).await;
            if caller_cancel.is_cancelled() {
                ExpertResult::failed(
                    &id,
                    ExpertStatus::Cancelled,
                    started,
                    Utc::now(),
                    "request cancelled",
                )
            } else {
                // The request deadline fired; the slot ends at the deadline
                // instant regardless of when the expert noticed.
                ExpertResult::failed(
                    &id,
                    ExpertStatus::Timeout,
                    started,
                    deadline_utc,
                    "request deadline exceeded",
                )
            }
        }
    };

    trace.emit(TraceEventKind::ExpertEnd {
        expert_id: id,
        status: result.status,
    });
    (slot, result)
}

async fn drain(set: &mut JoinSet<(usize, ExpertResult)>, slots: &mut [Option<ExpertResult>]) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((slot, result)) => slots[slot] = Some(result),
            Err(e) => tracing::warn!(error = %e, "expert task failed to join"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracebus::TraceBus;
    use ens_domain::config::TraceConfig;
    use ens_domain::error::{Error, Result};
    use ens_domain::expert::{Expert, ExpertDescriptor};
    use ens_domain::trace::TraceEventKind;

    struct Echo;

    #[async_trait::async_trait]
    impl Expert for Echo {
        async fn invoke(&self, query: &Query, _cancel: CancellationToken) -> Result<ExpertResult> {
            Ok(ExpertResult::success("echo", query.text.clone()))
        }
    }

    /// Sleeps for the given duration, honoring cancellation.
    struct Sleepy(u64);

    #[async_trait::async_trait]
    impl Expert for Sleepy {
        async fn invoke(&self, _query: &Query, cancel: CancellationToken) -> Result<ExpertResult> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.0)) => {
                    Ok(ExpertResult::success("sleepy", "done sleeping"))
                }
                _ = cancel.cancelled() => Err(Error::Cancelled),
            }
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Expert for Failing {
        async fn invoke(&self, _query: &Query, _cancel: CancellationToken) -> Result<ExpertResult> {
            Err(Error::Internal("downstream 503".into()))
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl Expert for Panicking {
        async fn invoke(&self, _query: &Query, _cancel: CancellationToken) -> Result<ExpertResult> {
            panic!("unexpected payload shape")
        }
    }

    fn entry(id: &str, handle: Arc<dyn Expert>) -> RegisteredExpert {
        RegisteredExpert {
            descriptor: Arc::new(ExpertDescriptor::new(id, id)),
            handle,
        }
    }

    fn entry_with_timeout(id: &str, handle: Arc<dyn Expert>, timeout_ms: u64) -> RegisteredExpert {
        RegisteredExpert {
            descriptor: Arc::new(ExpertDescriptor::new(id, id).with_timeout_ms(timeout_ms)),
            handle,
        }
    }

    fn trace_handle(bus: &TraceBus) -> TraceHandle {
        bus.open(&Query::new("q-1", "test"))
    }

    #[tokio::test]
    async fn results_preserve_selection_order() {
        let config = ExecutionConfig::default();
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        // "slow" completes after "fast" but must stay in slot 0.
        let selected = vec![
            entry("slow", Arc::new(Sleepy(80))),
            entry("fast", Arc::new(Echo)),
        ];
        let results = executor
            .execute(
                &Query::new("q-1", "hi"),
                &selected,
                &config,
                5_000,
                &trace,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].expert_id, "slow");
        assert_eq!(results[1].expert_id, "fast");
        assert!(results.iter().all(|r| r.status.is_success()));
        assert!(results.iter().all(|r| r.ended_at >= r.started_at));
    }

    #[tokio::test]
    async fn failures_are_isolated_per_slot() {
        let config = ExecutionConfig::default();
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        let selected = vec![
            entry("boom", Arc::new(Failing)),
            entry("panic", Arc::new(Panicking)),
            entry("ok", Arc::new(Echo)),
        ];
        let results = executor
            .execute(
                &Query::new("q-1", "hi"),
                &selected,
                &config,
                5_000,
                &trace,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].status, ExpertStatus::Error);
        assert!(results[0].error_message.as_deref().unwrap().contains("503"));
        assert_eq!(results[1].status, ExpertStatus::Error);
        assert_eq!(results[1].error_message.as_deref(), Some("expert panicked"));
        assert_eq!(results[2].status, ExpertStatus::Success);
    }

    #[tokio::test]
    async fn per_expert_timeout_marks_slot() {
        let config = ExecutionConfig {
            cancel_grace_ms: 50,
            ..Default::default()
        };
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        let selected = vec![
            entry_with_timeout("stuck", Arc::new(Sleepy(10_000)), 60),
            entry("ok", Arc::new(Echo)),
        ];
        let results = executor
            .execute(
                &Query::new("q-1", "hi"),
                &selected,
                &config,
                5_000,
                &trace,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].status, ExpertStatus::Timeout);
        assert_eq!(results[1].status, ExpertStatus::Success);
    }

    #[tokio::test]
    async fn request_deadline_backfills_timeouts_at_deadline() {
        let config = ExecutionConfig {
            cancel_grace_ms: 100,
            ..Default::default()
        };
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        let started = Utc::now();
        let selected = vec![
            entry("forever", Arc::new(Sleepy(60_000))),
            entry("ok", Arc::new(Echo)),
        ];
        let results = executor
            .execute(
                &Query::new("q-1", "hi"),
                &selected,
                &config,
                120,
                &trace,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0].status, ExpertStatus::Timeout);
        assert_eq!(results[1].status, ExpertStatus::Success);
        // ended_at ≤ request start + deadline + grace (plus scheduling slack).
        let cutoff = started + chrono::Duration::milliseconds(120 + 100 + 200);
        assert!(results[0].ended_at <= cutoff);
    }

    #[tokio::test]
    async fn caller_cancellation_marks_slots_cancelled() {
        let config = ExecutionConfig {
            cancel_grace_ms: 50,
            ..Default::default()
        };
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        let caller = CancellationToken::new();
        let canceller = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            canceller.cancel();
        });

        let selected = vec![entry("forever", Arc::new(Sleepy(60_000)))];
        let results = executor
            .execute(
                &Query::new("q-1", "hi"),
                &selected,
                &config,
                10_000,
                &trace,
                &caller,
            )
            .await;

        assert_eq!(results[0].status, ExpertStatus::Cancelled);
    }

    #[tokio::test]
    async fn zero_concurrency_times_out_without_invocation() {
        let config = ExecutionConfig {
            max_concurrent_experts: 0,
            admission_wait_ms: 50,
            ..Default::default()
        };
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        let selected = vec![entry("a", Arc::new(Echo)), entry("b", Arc::new(Echo))];
        let results = executor
            .execute(
                &Query::new("q-1", "hi"),
                &selected,
                &config,
                5_000,
                &trace,
                &CancellationToken::new(),
            )
            .await;

        assert!(results.iter().all(|r| r.status == ExpertStatus::Timeout));
        // Never admitted → no begin/end events for either expert.
        let trace = bus.close(trace);
        assert!(!trace
            .emitted_events
            .iter()
            .any(|e| matches!(e.kind, TraceEventKind::ExpertBegin { .. })));
    }

    #[tokio::test]
    async fn expert_events_bracket_execution() {
        let config = ExecutionConfig::default();
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        let selected = vec![entry("echo", Arc::new(Echo))];
        executor
            .execute(
                &Query::new("q-1", "hi"),
                &selected,
                &config,
                5_000,
                &trace,
                &CancellationToken::new(),
            )
            .await;

        let trace = bus.close(trace);
        let kinds: Vec<&TraceEventKind> = trace.emitted_events.iter().map(|e| &e.kind).collect();
        assert!(matches!(kinds[0], TraceEventKind::ExpertBegin { expert_id } if expert_id == "echo"));
        assert!(matches!(
            kinds[1],
            TraceEventKind::ExpertEnd { expert_id, status: ExpertStatus::Success } if expert_id == "echo"
        ));
    }

    #[tokio::test]
    async fn empty_selection_short_circuits() {
        let config = ExecutionConfig::default();
        let executor = Executor::new(&config);
        let bus = TraceBus::new(&TraceConfig::default());
        let trace = trace_handle(&bus);

        let results = executor
            .execute(
                &Query::new("q-1", "hi"),
                &[],
                &config,
                5_000,
                &trace,
                &CancellationToken::new(),
            )
            .await;
        assert!(results.is_empty());
    }
}
