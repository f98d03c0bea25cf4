use crate::metrics::stats::StatsSnapshot;
use crate::report::RunResult;
use anyhow::Result;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Sink for periodic stats snapshots.
pub enum OutputWriter {
    Csv(BufWriter<tokio::fs::File>),
    Stdout,
}

impl OutputWriter {
    pub async fn new_csv(path: String) -> Result<Self> {
        ensure_parent(&path).await;
        let file = File::create(&path).await?;
        let mut writer = BufWriter::new(file);

        // Write CSV header
        writer.write_all(&csv_line(&StatsSnapshot::csv_header())?).await?;

        println!("Writing CSV output to: {}", path);
        Ok(Self::Csv(writer))
    }

    pub fn new_stdout() -> Self {
        println!("Writing output to stdout");
        Self::Stdout
    }

    pub async fn write_snapshot(&mut self, snapshot: &StatsSnapshot) -> Result<()> {
        let line = csv_line(&snapshot.csv_record())?;
        match self {
            Self::Csv(writer) => {
                writer.write_all(&line).await?;
                // Flush so external tail/readers see progress promptly
                writer.flush().await?;
            }
            Self::Stdout => {
                print!("{}", String::from_utf8_lossy(&line));
            }
        }
        Ok(())
    }
}

/// Encode one CSV record, newline included.
fn csv_line<I, T>(fields: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(fields)?;
    Ok(writer.into_inner().map_err(|e| e.into_error())?)
}

async fn ensure_parent(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.ok();
        }
    }
}

/// Write the full result as pretty JSON.
pub async fn write_report_json(path: &str, result: &RunResult) -> Result<()> {
    ensure_parent(path).await;
    fs::write(path, serde_json::to_vec_pretty(result)?).await?;
    println!("Wrote JSON report to: {}", path);
    Ok(())
}

/// Write one CSV row per worker.
pub async fn write_workers_csv(path: &str, result: &RunResult) -> Result<()> {
    ensure_parent(path).await;
    let mut writer = csv::Writer::from_writer(Vec::new());
    for worker in &result.workers {
        writer.serialize(worker)?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    fs::write(path, bytes).await?;
    println!("Wrote per-worker table to: {}", path);
    Ok(())
}

/// Human-readable final summary on stdout.
pub fn print_summary(result: &RunResult) {
    println!("\nFinal Load Test Statistics:");
    println!("  Run ID: {}", result.run_id);
    println!(
        "  Total duration: {:.2}s ({:.2} min)",
        result.duration.as_secs_f64(),
        result.duration.as_secs_f64() / 60.0
    );
    if result.interrupted {
        println!("  Stopped early on request");
    }
    println!("  Queries attempted: {}", result.attempted());
    println!("  Queries succeeded: {}", result.total_queries);
    println!(
        "  Queries failed: {} ({:.2}%)",
        result.total_errors,
        result.error_rate() * 100.0
    );
    println!(
        "  Reconnects: {} ok, {} failed",
        result.total_reconnects, result.total_reconnect_failures
    );
    println!("  Throughput: {:.2} queries/s", result.queries_per_second());
    if result.latency.samples > 0 {
        println!(
            "  Latency p50/p95/p99: {:.2}/{:.2}/{:.2} ms (max {:.2} ms)",
            result.latency.p50_ns as f64 / 1e6,
            result.latency.p95_ns as f64 / 1e6,
            result.latency.p99_ns as f64 / 1e6,
            result.latency.max_ns as f64 / 1e6
        );
    }
    for worker in &result.workers {
        println!(
            "  Worker {:>3}: {} queries, {} errors, {:.2}s{}",
            worker.id,
            worker.query_count,
            worker.error_count,
            worker.elapsed.as_secs_f64(),
            if worker.complete { "" } else { " (incomplete)" }
        );
    }
    if result.is_graceful() {
        println!("  All workers shut down gracefully");
    } else {
        println!(
            "  {} workers did not shut down gracefully: {:?}",
            result.non_graceful.len(),
            result.non_graceful
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_line_quotes_when_needed() {
        let line = csv_line(["a", "b,c", "d"]).unwrap();
        assert_eq!(String::from_utf8(line).unwrap(), "a,\"b,c\",d\n");
    }
}
