//! Orchestrator: spawns workers, enforces the run budget, coordinates
//! shutdown, and reduces worker results into a [`RunResult`].

use crate::config::RunConfig;
use crate::error::{SetupError, SetupResult};
use crate::metrics::stats::SharedStats;
use crate::report::{Reporter, RunMeta, RunResult};
use crate::signal::StopSignal;
use crate::store::{Store, StoreBuilder, StoreError, WorkerId};
use crate::worker::{RunContext, Worker, WorkerProgress, WorkerReport};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep_until, timeout, timeout_at};

/// Worker id used for the setup probe connection.
const PROBE_ID: WorkerId = WorkerId::MAX;

struct WorkerHandle {
    id: WorkerId,
    progress: Arc<WorkerProgress>,
    task: JoinHandle<WorkerReport>,
}

/// Runs one load test. Create a new orchestrator for every run.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    store: Arc<dyn Store>,
    stop: StopSignal,
    stats: Arc<SharedStats>,
    run_id: String,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: RunConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            stop: StopSignal::new(),
            stats: Arc::new(SharedStats::new()),
            run_id: uuid::Uuid::new_v4().to_string(),
            started: AtomicBool::new(false),
        }
    }

    /// Validate the config and resolve its store descriptor.
    pub fn from_config(config: RunConfig) -> SetupResult<Self> {
        config.validate()?;
        let store = StoreBuilder::open(&config.store).map_err(SetupError::Descriptor)?;
        Ok(Self::new(config, store))
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Handle for requesting an early stop from outside the run.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Live aggregate, for progress output while the run is going.
    pub fn stats(&self) -> Arc<SharedStats> {
        Arc::clone(&self.stats)
    }

    /// Run the load test.
    ///
    /// Only setup failures are errors; query failures and stragglers end up
    /// in the returned result. The probe is bounded by `join_timeout`, so the
    /// whole call returns within `duration + 2 * join_timeout` plus
    /// scheduling slack. A second call fails with [`SetupError::AlreadyRun`].
    pub async fn run(&self) -> SetupResult<RunResult> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SetupError::AlreadyRun);
        }
        self.config.validate()?;
        timeout(self.config.join_timeout, self.probe())
            .await
            .map_err(|_| SetupError::Probe(StoreError::Timeout))??;

        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + self.config.duration;

        tracing::info!(
            run_id = %self.run_id,
            store = self.store.name(),
            workers = self.config.workers,
            duration_secs = self.config.duration.as_secs_f64(),
            shapes = ?self.config.shapes,
            "Starting load test"
        );

        let mut handles = Vec::with_capacity(self.config.workers as usize);
        for id in 0..self.config.workers {
            let ctx = RunContext {
                config: Arc::clone(&self.config),
                store: Arc::clone(&self.store),
                stop: self.stop.clone(),
                stats: Some(Arc::clone(&self.stats)),
            };
            let worker = Worker::new(id, ctx);
            let progress = worker.progress();
            handles.push(WorkerHandle {
                id,
                progress,
                task: tokio::spawn(worker.run()),
            });
        }

        let interrupted = self.monitor(start, deadline).await;
        self.stop.trigger();
        tracing::info!(
            join_timeout_secs = self.config.join_timeout.as_secs_f64(),
            "Signaling workers to stop"
        );

        let reports = self.join(handles, start).await;
        let latency = self.stats.latency().await;
        let result = Reporter::reduce(
            RunMeta {
                run_id: self.run_id.clone(),
                started_at,
                duration: start.elapsed(),
                interrupted,
            },
            reports,
            latency,
        );

        if !result.is_graceful() {
            tracing::warn!(
                count = result.non_graceful.len(),
                workers = ?result.non_graceful,
                "Workers did not shut down gracefully"
            );
        }
        tracing::info!(
            elapsed_secs = result.duration.as_secs_f64(),
            total_queries = result.total_queries,
            total_errors = result.total_errors,
            qps = result.queries_per_second(),
            "Load test completed"
        );
        Ok(result)
    }

    /// Run with Ctrl+C triggering the stop signal.
    pub async fn run_with_signal_handling(&self) -> SetupResult<RunResult> {
        let stop = self.stop.clone();
        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                    stop.trigger();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        });

        let result = self.run().await;
        signal_handle.abort();
        result
    }

    /// One connect + ping against the store before any worker exists.
    async fn probe(&self) -> SetupResult<()> {
        let mut conn = self.store.connect(PROBE_ID).await.map_err(SetupError::Probe)?;
        let ping = conn.ping().await;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Closing probe connection failed");
        }
        ping.map_err(SetupError::Probe)
    }

    /// Wait for the deadline or an external stop, logging status along the
    /// way. Returns `true` when stopped from outside.
    async fn monitor(&self, start: Instant, deadline: Instant) -> bool {
        let period = self.config.status_interval;
        let mut ticker = interval_at(start + period, period);
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = &mut expiry => {
                    tracing::info!("Run duration reached");
                    return false;
                }
                _ = self.stop.wait() => {
                    tracing::info!("Stop requested before run duration elapsed");
                    return true;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let (queries, errors) = self.stats.counts().await;
                    tracing::info!(
                        elapsed_secs = now.duration_since(start).as_secs(),
                        remaining_secs = deadline.saturating_duration_since(now).as_secs(),
                        queries,
                        errors,
                        "Status update"
                    );
                }
            }
        }
    }

    /// Join every worker against one shared deadline. Stragglers are aborted
    /// and reported with their last-known counts.
    async fn join(&self, handles: Vec<WorkerHandle>, start: Instant) -> Vec<WorkerReport> {
        let join_deadline = Instant::now() + self.config.join_timeout;
        let mut reports = Vec::with_capacity(handles.len());

        for WorkerHandle { id, progress, mut task } in handles {
            match timeout_at(join_deadline, &mut task).await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    tracing::error!(worker_id = id, error = %e, "Worker task failed");
                    reports.push(progress.snapshot(id, start.elapsed()));
                }
                Err(_) => {
                    tracing::warn!(
                        worker_id = id,
                        phase = ?progress.phase(),
                        "Worker did not terminate within join timeout"
                    );
                    // Dropping the future closes its connection
                    task.abort();
                    reports.push(progress.snapshot(id, start.elapsed()));
                }
            }
        }
        reports
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("store", &self.store.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;
    use crate::store::{ConnectOptions, Engine, StoreDescriptor};
    use std::time::Duration;

    fn config(workers: u32, duration_ms: u64, join_ms: u64) -> RunConfig {
        let mut config = RunConfig::new(StoreDescriptor::new(Engine::Mock, ConnectOptions::default()));
        config.workers = workers;
        config.duration = Duration::from_millis(duration_ms);
        config.join_timeout = Duration::from_millis(join_ms);
        config.status_interval = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn probe_failure_is_fatal_and_spawns_nothing() {
        let store = Arc::new(MockStore::new().with_max_connects(0));
        let orchestrator = Orchestrator::new(config(3, 100, 100), store.clone());
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, SetupError::Probe(_)));
        assert_eq!(store.executes(), 0);
        assert_eq!(store.connect_failures(), 1);
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let store = Arc::new(MockStore::new());
        let orchestrator = Orchestrator::new(config(0, 100, 100), store.clone());
        assert!(matches!(orchestrator.run().await, Err(SetupError::InvalidWorkers)));
        assert_eq!(store.connects(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn external_stop_ends_run_early() {
        let store = Arc::new(MockStore::new().with_latency(Duration::from_millis(1)));
        let orchestrator = Orchestrator::new(config(2, 60_000, 1_000), store);
        let stop = orchestrator.stop_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.trigger();
        });
        let started = std::time::Instant::now();
        let result = orchestrator.run().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.interrupted);
        assert!(result.is_graceful());
    }

    /// Accepts the connect call and then never answers.
    struct StalledStore;

    #[async_trait::async_trait]
    impl Store for StalledStore {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn connect(
            &self,
            _worker_id: WorkerId,
        ) -> Result<Box<dyn crate::store::Connection>, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_store_fails_setup_within_join_timeout() {
        let orchestrator = Orchestrator::new(config(2, 100, 100), Arc::new(StalledStore));
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(3), orchestrator.run())
            .await
            .expect("run() must not block on a stalled store");
        assert!(matches!(outcome, Err(SetupError::Probe(StoreError::Timeout))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_run_is_rejected() {
        let store = Arc::new(MockStore::new().with_latency(Duration::from_millis(1)));
        let orchestrator = Orchestrator::new(config(1, 100, 500), store.clone());
        let first = orchestrator.run().await.unwrap();
        assert!(!first.interrupted);
        let connects = store.connects();
        assert!(matches!(orchestrator.run().await, Err(SetupError::AlreadyRun)));
        assert_eq!(store.connects(), connects);
    }

    #[test]
    fn from_config_resolves_mock_descriptor() {
        let orchestrator = Orchestrator::from_config(config(1, 100, 100))
            .unwrap()
            .with_run_id("abc");
        assert_eq!(orchestrator.run_id(), "abc");
        assert_eq!(orchestrator.config().workers, 1);
    }
}
