//! Reduction of per-worker reports into the run-level result. No I/O.

use crate::metrics::stats::LatencySummary;
use crate::store::WorkerId;
use crate::worker::WorkerReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// Serialize a `Duration` as fractional seconds.
pub mod serde_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Run-level facts not derived from worker counters.
#[derive(Clone, Debug)]
pub struct RunMeta {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Stop was requested from outside before the duration elapsed.
    pub interrupted: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_secs", with = "serde_secs")]
    pub duration: Duration,
    pub interrupted: bool,
    pub workers: Vec<WorkerReport>,
    /// Successful queries.
    pub total_queries: u64,
    /// Failed queries.
    pub total_errors: u64,
    pub total_reconnects: u64,
    pub total_reconnect_failures: u64,
    /// Workers that did not terminate within the join timeout.
    pub non_graceful: BTreeSet<WorkerId>,
    pub latency: LatencySummary,
}

impl RunResult {
    /// Successful plus failed queries.
    pub fn attempted(&self) -> u64 {
        self.total_queries + self.total_errors
    }

    pub fn is_graceful(&self) -> bool {
        self.non_graceful.is_empty()
    }

    pub fn queries_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_queries as f64 / secs
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        let attempted = self.attempted();
        if attempted > 0 {
            self.total_errors as f64 / attempted as f64
        } else {
            0.0
        }
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.id == id)
    }
}

pub struct Reporter;

impl Reporter {
    /// Sum worker counters into totals. Incomplete reports mark their worker
    /// as non-graceful but still contribute their last-known counts.
    pub fn reduce(meta: RunMeta, mut workers: Vec<WorkerReport>, latency: LatencySummary) -> RunResult {
        workers.sort_by_key(|w| w.id);
        let non_graceful = workers
            .iter()
            .filter(|w| !w.complete)
            .map(|w| w.id)
            .collect();

        RunResult {
            run_id: meta.run_id,
            started_at: meta.started_at,
            duration: meta.duration,
            interrupted: meta.interrupted,
            total_queries: workers.iter().map(|w| w.query_count).sum(),
            total_errors: workers.iter().map(|w| w.error_count).sum(),
            total_reconnects: workers.iter().map(|w| w.reconnects).sum(),
            total_reconnect_failures: workers.iter().map(|w| w.reconnect_failures).sum(),
            non_graceful,
            latency,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPhase;

    fn report(id: WorkerId, queries: u64, errors: u64, complete: bool) -> WorkerReport {
        WorkerReport {
            id,
            query_count: queries,
            error_count: errors,
            reconnects: errors / 2,
            reconnect_failures: 0,
            connect_failures: 0,
            elapsed: Duration::from_secs(2),
            phase: if complete { WorkerPhase::Terminated } else { WorkerPhase::Running },
            complete,
        }
    }

    fn meta() -> RunMeta {
        RunMeta {
            run_id: "t".into(),
            started_at: Utc::now(),
            duration: Duration::from_secs(4),
            interrupted: false,
        }
    }

    #[test]
    fn totals_equal_worker_sums() {
        let result = Reporter::reduce(
            meta(),
            vec![report(2, 10, 1, true), report(0, 5, 4, true), report(1, 7, 0, false)],
            LatencySummary::default(),
        );
        assert_eq!(result.total_queries, 22);
        assert_eq!(result.total_errors, 5);
        assert_eq!(result.total_reconnects, 2);
        assert_eq!(result.attempted(), 27);
        assert_eq!(result.workers.iter().map(|w| w.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(result.non_graceful, BTreeSet::from([1]));
        assert!(!result.is_graceful());
        assert!((result.queries_per_second() - 5.5).abs() < 1e-9);
    }

    #[test]
    fn empty_run_is_all_zero() {
        let result = Reporter::reduce(meta(), Vec::new(), LatencySummary::default());
        assert_eq!(result.attempted(), 0);
        assert_eq!(result.error_rate(), 0.0);
        assert!(result.is_graceful());
    }

    #[test]
    fn json_uses_seconds() {
        let result = Reporter::reduce(meta(), vec![report(0, 1, 0, true)], LatencySummary::default());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["duration_secs"], 4.0);
        assert_eq!(value["workers"][0]["elapsed_secs"], 2.0);
        assert_eq!(value["workers"][0]["phase"], "terminated");
    }
}
