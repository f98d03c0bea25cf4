//! In-process simulated store (feature `store-mock`).
//!
//! Lets the harness run end to end without a backend and gives tests exact
//! control over latency and failure modes.
use crate::query::QuerySpec;
use crate::store::{
    ConnectOptions, Connection, QueryOutcome, Store, StoreError, WorkerId,
};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureMode {
    #[default]
    None,
    /// Every query fails with a plain query error.
    Query,
    /// Every query fails with a dropped-connection error.
    Connection,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "query" => Ok(Self::Query),
            "connection" | "network" => Ok(Self::Connection),
            other => Err(format!("unknown mock failure mode: {}", other)),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    closes: AtomicU64,
    executes: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MockStore {
    latency: Duration,
    failure: FailureMode,
    hang_worker: Option<WorkerId>,
    max_connects: Option<u64>,
    counters: Arc<Counters>,
}

pub fn open(opts: &ConnectOptions) -> Result<Arc<dyn Store>, StoreError> {
    let parse_u64 = |key: &str| -> Result<Option<u64>, StoreError> {
        opts.get(key)
            .map(|v| v.parse::<u64>().map_err(|e| StoreError::Connect(format!("{}: {}", key, e))))
            .transpose()
    };
    let mut store = MockStore::new();
    if let Some(ms) = parse_u64("latency_ms")? {
        store = store.with_latency(Duration::from_millis(ms));
    }
    if let Some(mode) = opts.get("fail") {
        store = store.with_failure(mode.parse().map_err(StoreError::Connect)?);
    }
    if let Some(id) = opts.get("hang_worker") {
        let id = id
            .parse::<WorkerId>()
            .map_err(|e| StoreError::Connect(format!("hang_worker: {}", e)))?;
        store = store.with_hang_worker(id);
    }
    if let Some(n) = parse_u64("max_connects")? {
        store = store.with_max_connects(n);
    }
    if opts.get("connect_fail").is_some_and(|v| v == "true" || v == "1") {
        store = store.with_max_connects(0);
    }
    Ok(Arc::new(store))
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failure(mut self, failure: FailureMode) -> Self {
        self.failure = failure;
        self
    }

    /// The given worker's first query never returns.
    pub fn with_hang_worker(mut self, worker_id: WorkerId) -> Self {
        self.hang_worker = Some(worker_id);
        self
    }

    /// Connection attempts beyond the first `n` fail.
    pub fn with_max_connects(mut self, n: u64) -> Self {
        self.max_connects = Some(n);
        self
    }

    /// Successful connects, including the setup probe.
    pub fn connects(&self) -> u64 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn connect_failures(&self) -> u64 {
        self.counters.connect_failures.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> u64 {
        self.counters.executes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Store for MockStore {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, worker_id: WorkerId) -> Result<Box<dyn Connection>, StoreError> {
        tokio::task::yield_now().await;
        let attempts =
            self.counters.connects.load(Ordering::SeqCst) + self.counters.connect_failures.load(Ordering::SeqCst);
        if self.max_connects.is_some_and(|max| attempts >= max) {
            self.counters.connect_failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Connect("mock store refused connection".into()));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            hang: self.hang_worker == Some(worker_id),
            latency: self.latency,
            failure: self.failure,
            counters: self.counters.clone(),
        }))
    }
}

struct MockConnection {
    hang: bool,
    latency: Duration,
    failure: FailureMode,
    counters: Arc<Counters>,
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, spec: &QuerySpec) -> Result<QueryOutcome, StoreError> {
        self.counters.executes.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
        match self.failure {
            FailureMode::None => {}
            FailureMode::Query => return Err(StoreError::Query("simulated query failure".into())),
            FailureMode::Connection => {
                return Err(StoreError::Disconnected("simulated connection reset".into()));
            }
        }
        let documents = match spec {
            QuerySpec::DevicePowerSummary { limit, .. }
            | QuerySpec::RecentReadings { limit, .. }
            | QuerySpec::DeviceAnomalyPercentiles { limit, .. }
            | QuerySpec::NameRegexAnomaly { limit, .. } => u64::from(*limit),
            QuerySpec::CategoryCounts { .. } => 4,
            QuerySpec::PowerPercentiles { .. } => 1,
        };
        Ok(QueryOutcome { documents })
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hang_worker_must_fit_a_worker_id() {
        let opts = ConnectOptions::default().with("hang_worker", "4294967298");
        assert!(matches!(open(&opts), Err(StoreError::Connect(_))));
        assert!(open(&ConnectOptions::default().with("hang_worker", "2")).is_ok());
    }

    #[test]
    fn descriptor_keys_are_validated() {
        assert!(open(&ConnectOptions::default().with("latency_ms", "fast")).is_err());
        assert!(open(&ConnectOptions::default().with("fail", "sometimes")).is_err());
    }

    #[tokio::test]
    async fn heavy_shapes_return_up_to_limit() {
        let store = MockStore::new();
        let mut conn = store.connect(0).await.unwrap();
        let spec = QuerySpec::NameRegexAnomaly {
            pattern: crate::query::NAME_PATTERNS[0],
            limit: 10,
        };
        assert_eq!(conn.execute(&spec).await.unwrap().documents, 10);
        conn.close().await.unwrap();
        assert_eq!(store.closes(), 1);
    }
}
