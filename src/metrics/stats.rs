use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Run-wide aggregate updated by every worker.
///
/// A single coarse lock guards all fields. Totals here are for live progress
/// output only; the final report is built from per-worker snapshots.
pub struct SharedStats {
    inner: Mutex<Totals>,
    start_time: Instant,
}

struct Totals {
    queries: u64,
    errors: u64,
    reconnects: u64,
    // Latency histogram (nanosecond precision)
    latency_hist: Option<Histogram<u64>>,
    last_snapshot: Instant,
    queries_at_last_snapshot: u64,
}

impl SharedStats {
    pub fn new() -> Self {
        let now = Instant::now();
        // 1ns to 60s range, 3 significant digits
        let latency_hist = Histogram::new_with_bounds(1, 60_000_000_000, 3).ok();
        Self {
            inner: Mutex::new(Totals {
                queries: 0,
                errors: 0,
                reconnects: 0,
                latency_hist,
                last_snapshot: now,
                queries_at_last_snapshot: 0,
            }),
            start_time: now,
        }
    }

    /// Record a completed query with its latency
    pub async fn record_query(&self, latency: Duration) {
        let mut totals = self.inner.lock().await;
        totals.queries += 1;
        if let Some(hist) = totals.latency_hist.as_mut() {
            // Values above the top bound are clamped
            hist.saturating_record(latency.as_nanos().min(u128::from(u64::MAX)) as u64);
        }
    }

    /// Record a failed query
    pub async fn record_error(&self) {
        self.inner.lock().await.errors += 1;
    }

    /// Record a successful connection replacement
    pub async fn record_reconnect(&self) {
        self.inner.lock().await.reconnects += 1;
    }

    /// Get current snapshot of statistics
    pub async fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let mut totals = self.inner.lock().await;
        let latency = totals
            .latency_hist
            .as_ref()
            .map(LatencySummary::from_histogram)
            .unwrap_or_default();
        let interval_duration = now.duration_since(totals.last_snapshot);
        let interval_queries = totals.queries - totals.queries_at_last_snapshot;
        totals.last_snapshot = now;
        totals.queries_at_last_snapshot = totals.queries;

        StatsSnapshot {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            query_count: totals.queries,
            error_count: totals.errors,
            reconnect_count: totals.reconnects,
            interval_query_count: interval_queries,
            total_duration: now.duration_since(self.start_time),
            interval_duration,
            latency,
        }
    }

    /// (queries, errors) without touching the snapshot interval
    pub async fn counts(&self) -> (u64, u64) {
        let totals = self.inner.lock().await;
        (totals.queries, totals.errors)
    }

    /// Latency percentiles over everything recorded so far
    pub async fn latency(&self) -> LatencySummary {
        let totals = self.inner.lock().await;
        totals
            .latency_hist
            .as_ref()
            .map(LatencySummary::from_histogram)
            .unwrap_or_default()
    }
}

impl Default for SharedStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
}

impl LatencySummary {
    fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::default();
        }
        Self {
            samples: hist.len(),
            p50_ns: hist.value_at_quantile(0.5),
            p95_ns: hist.value_at_quantile(0.95),
            p99_ns: hist.value_at_quantile(0.99),
            min_ns: hist.min(),
            max_ns: hist.max(),
            mean_ns: hist.mean(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub timestamp: u64,
    pub query_count: u64,
    pub error_count: u64,
    pub reconnect_count: u64,
    pub interval_query_count: u64,
    pub total_duration: Duration,
    pub interval_duration: Duration,
    pub latency: LatencySummary,
}

impl StatsSnapshot {
    /// Calculate throughput (queries per second) for the interval
    pub fn interval_throughput(&self) -> f64 {
        let interval_secs = self.interval_duration.as_secs_f64();
        if interval_secs > 0.0 {
            self.interval_query_count as f64 / interval_secs
        } else {
            0.0
        }
    }

    /// Calculate overall throughput
    pub fn total_throughput(&self) -> f64 {
        let total_secs = self.total_duration.as_secs_f64();
        if total_secs > 0.0 {
            self.query_count as f64 / total_secs
        } else {
            0.0
        }
    }

    /// CSV header
    pub fn csv_header() -> [&'static str; 11] {
        [
            "timestamp",
            "query_count",
            "error_count",
            "reconnect_count",
            "total_throughput",
            "interval_throughput",
            "latency_ns_p50",
            "latency_ns_p95",
            "latency_ns_p99",
            "latency_ns_max",
            "latency_ns_mean",
        ]
    }

    /// Convert to CSV record fields
    pub fn csv_record(&self) -> [String; 11] {
        [
            self.timestamp.to_string(),
            self.query_count.to_string(),
            self.error_count.to_string(),
            self.reconnect_count.to_string(),
            format!("{:.2}", self.total_throughput()),
            format!("{:.2}", self.interval_throughput()),
            self.latency.p50_ns.to_string(),
            self.latency.p95_ns.to_string(),
            self.latency.p99_ns.to_string(),
            self.latency.max_ns.to_string(),
            format!("{:.2}", self.latency.mean_ns),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(SharedStats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    stats.record_query(Duration::from_micros(50)).await;
                    stats.record_error().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = stats.snapshot().await;
        assert_eq!(snap.query_count, 2_000);
        assert_eq!(snap.error_count, 2_000);
        assert_eq!(snap.latency.samples, 2_000);
    }

    #[tokio::test]
    async fn interval_counts_reset_between_snapshots() {
        let stats = SharedStats::new();
        stats.record_query(Duration::from_millis(2)).await;
        stats.record_query(Duration::from_millis(4)).await;
        let first = stats.snapshot().await;
        assert_eq!(first.interval_query_count, 2);
        stats.record_query(Duration::from_millis(3)).await;
        let second = stats.snapshot().await;
        assert_eq!(second.interval_query_count, 1);
        assert_eq!(second.query_count, 3);
        assert!(second.latency.max_ns >= 4_000_000);
    }

    #[test]
    fn empty_latency_is_zeroed() {
        let hist = Histogram::<u64>::new_with_bounds(1, 1_000, 3).unwrap();
        assert_eq!(LatencySummary::from_histogram(&hist), LatencySummary::default());
    }
}
