//! Worker execution loop
//!
//! Each worker is a tokio task running: poll stop -> generate -> execute ->
//! record -> repeat. Iterations are unpaced; the only thing that ends the
//! loop is the run's [`StopSignal`].

use crate::config::RunConfig;
use crate::connection::ConnectionManager;
use crate::metrics::stats::SharedStats;
use crate::query::QueryGenerator;
use crate::report::serde_secs;
use crate::signal::StopSignal;
use crate::store::{ErrorClass, Store, StoreError, WorkerId};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Everything a worker needs from its run, handed over at spawn time.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub store: Arc<dyn Store>,
    pub stop: StopSignal,
    pub stats: Option<Arc<SharedStats>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Running,
    Stopping,
    Terminated,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerPhase::Running,
            1 => WorkerPhase::Stopping,
            _ => WorkerPhase::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerPhase::Running => 0,
            WorkerPhase::Stopping => 1,
            WorkerPhase::Terminated => 2,
        }
    }
}

/// Final (or last-known) counters of one worker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerReport {
    pub id: WorkerId,
    pub query_count: u64,
    pub error_count: u64,
    pub reconnects: u64,
    pub reconnect_failures: u64,
    pub connect_failures: u64,
    #[serde(rename = "elapsed_secs", with = "serde_secs")]
    pub elapsed: Duration,
    pub phase: WorkerPhase,
    /// False when the counts were read from a worker that never terminated.
    pub complete: bool,
}

/// Lock-free mirror of a worker's counters, readable while it runs.
#[derive(Debug, Default)]
pub struct WorkerProgress {
    queries: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    reconnect_failures: AtomicU64,
    connect_failures: AtomicU64,
    phase: AtomicU8,
}

impl WorkerProgress {
    fn publish(&self, state: &WorkerState) {
        self.queries.store(state.query_count, Ordering::Relaxed);
        self.errors.store(state.error_count, Ordering::Relaxed);
        self.reconnects.store(state.reconnects, Ordering::Relaxed);
        self.reconnect_failures
            .store(state.reconnect_failures, Ordering::Relaxed);
        self.connect_failures
            .store(state.connect_failures, Ordering::Relaxed);
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Last-known counts, flagged incomplete.
    pub fn snapshot(&self, id: WorkerId, elapsed: Duration) -> WorkerReport {
        WorkerReport {
            id,
            query_count: self.queries.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            reconnect_failures: self.reconnect_failures.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            elapsed,
            phase: self.phase(),
            complete: false,
        }
    }
}

/// Private per-worker state; owned by the worker task only.
struct WorkerState {
    id: WorkerId,
    query_count: u64,
    error_count: u64,
    reconnects: u64,
    reconnect_failures: u64,
    connect_failures: u64,
    started: Instant,
    connections: ConnectionManager,
}

impl WorkerState {
    fn into_report(self, phase: WorkerPhase) -> WorkerReport {
        WorkerReport {
            id: self.id,
            query_count: self.query_count,
            error_count: self.error_count,
            reconnects: self.reconnects,
            reconnect_failures: self.reconnect_failures,
            connect_failures: self.connect_failures,
            elapsed: self.started.elapsed(),
            phase,
            complete: true,
        }
    }
}

pub struct Worker {
    id: WorkerId,
    ctx: RunContext,
    generator: QueryGenerator,
    progress: Arc<WorkerProgress>,
}

impl Worker {
    pub fn new(id: WorkerId, ctx: RunContext) -> Self {
        let generator = QueryGenerator::new(
            &ctx.config.shapes,
            ctx.config.selection,
            ctx.config.window_start,
            ctx.config.seed.map(|s| s.wrapping_add(u64::from(id))),
        );
        Self {
            id,
            ctx,
            generator,
            progress: Arc::new(WorkerProgress::default()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn progress(&self) -> Arc<WorkerProgress> {
        Arc::clone(&self.progress)
    }

    /// Run until the stop signal is observed, then close the connection and
    /// return the final counters.
    pub async fn run(self) -> WorkerReport {
        let Worker {
            id,
            ctx,
            mut generator,
            progress,
        } = self;
        let mut state = WorkerState {
            id,
            query_count: 0,
            error_count: 0,
            reconnects: 0,
            reconnect_failures: 0,
            connect_failures: 0,
            started: Instant::now(),
            connections: ConnectionManager::new(id, Arc::clone(&ctx.store)),
        };
        progress.set_phase(WorkerPhase::Running);
        tracing::debug!(worker_id = id, "Worker started");

        loop {
            if ctx.stop.is_set() {
                progress.set_phase(WorkerPhase::Stopping);
                break;
            }

            let spec = generator.next_spec();
            let t0 = Instant::now();
            // `true` in the error tuple: the connection could not even be opened
            let result: Result<_, (StoreError, bool)> = match state.connections.get().await {
                Ok(conn) => conn.execute(&spec).await.map_err(|e| (e, false)),
                Err(e) => Err((e, true)),
            };

            match result {
                Ok(outcome) => {
                    let latency = t0.elapsed();
                    state.query_count += 1;
                    if let Some(stats) = &ctx.stats {
                        stats.record_query(latency).await;
                    }
                    tracing::trace!(
                        worker_id = id,
                        shape = %spec.shape(),
                        latency_ms = latency.as_secs_f64() * 1000.0,
                        documents = outcome.documents,
                        "Query completed"
                    );
                }
                Err((err, connect_failed)) => {
                    state.error_count += 1;
                    if let Some(stats) = &ctx.stats {
                        stats.record_error().await;
                    }
                    let class = ctx.store.classify(&err);
                    tracing::debug!(
                        worker_id = id,
                        shape = %spec.shape(),
                        class = ?class,
                        error = %err,
                        errors = state.error_count,
                        "Query failed"
                    );
                    if connect_failed {
                        state.connect_failures += 1;
                    } else if class == ErrorClass::Connection {
                        match state.connections.replace().await {
                            Ok(()) => {
                                state.reconnects += 1;
                                if let Some(stats) = &ctx.stats {
                                    stats.record_reconnect().await;
                                }
                            }
                            Err(e) => {
                                state.reconnect_failures += 1;
                                tracing::warn!(worker_id = id, error = %e, "Reconnect failed");
                            }
                        }
                    }
                }
            }
            progress.publish(&state);
        }

        state.connections.close().await;
        progress.publish(&state);
        progress.set_phase(WorkerPhase::Terminated);
        let report = state.into_report(WorkerPhase::Terminated);
        tracing::debug!(
            worker_id = id,
            queries = report.query_count,
            errors = report.error_count,
            reconnects = report.reconnects,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Worker finished"
        );
        report
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("store", &self.ctx.store.name())
            .field("phase", &self.progress.phase())
            .finish()
    }
}
