use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use store_bench::config::{ConfigLayer, Preset};
use store_bench::logging;
use store_bench::orchestrator::Orchestrator;
use store_bench::output::{self, OutputWriter};
use store_bench::query::{QueryShape, ShapeSelection};
use store_bench::store::config::parse_connect_kv;

#[derive(Parser)]
#[command(name = "store-bench")]
#[command(about = "Concurrent query load generator for backend data stores")]
struct Cli {
    /// Run ID for tagging outputs
    #[arg(long, default_value = "")]
    run_id: String,

    /// Output directory for artifacts
    #[arg(long, default_value = "./artifacts")]
    out_dir: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Snapshot interval in seconds for periodic stats output
    #[arg(long, default_value = "1")]
    snapshot_interval: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test
    Run {
        /// YAML config file; flags and environment override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Worker-count preset (light/moderate/heavy)
        #[arg(long)]
        preset: Option<Preset>,

        /// Number of concurrent workers (overrides the preset)
        #[arg(long, env = "STORE_BENCH_WORKERS")]
        workers: Option<u32>,

        /// Duration in seconds
        #[arg(long, env = "STORE_BENCH_DURATION")]
        duration: Option<u64>,

        /// Seconds to wait for workers after signaling stop
        #[arg(long)]
        join_timeout: Option<u64>,

        /// Seconds between status log lines
        #[arg(long)]
        status_interval: Option<u64>,

        /// Store engine (mongodb/mock)
        #[arg(long, env = "STORE_BENCH_ENGINE")]
        engine: Option<String>,

        /// Store connection string
        #[arg(long, env = "STORE_BENCH_URI", hide_env_values = true)]
        uri: Option<String>,

        /// Extra connect params as key=value (repeatable)
        #[arg(long)]
        connect: Vec<String>,

        /// Comma-separated query shapes to draw from
        #[arg(long, value_delimiter = ',')]
        shapes: Vec<QueryShape>,

        /// Shape selection (random/round-robin)
        #[arg(long)]
        selection: Option<ShapeSelection>,

        /// Seed for reproducible query parameters
        #[arg(long)]
        seed: Option<u64>,

        /// First day of the data window (YYYY-MM-DD)
        #[arg(long)]
        window_start: Option<NaiveDate>,

        /// Optional CSV output file path for snapshots (stdout if omitted)
        #[arg(long)]
        csv: Option<String>,

        /// Write the JSON report and per-worker CSV under --out-dir
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    logging::init(&cli.log_level)?;

    let run_id = if cli.run_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        cli.run_id.clone()
    };
    println!("store-bench starting with run_id: {}", run_id);

    let snapshot_interval_secs = cli.snapshot_interval.max(1);

    match cli.command {
        Commands::Run {
            config,
            preset,
            workers,
            duration,
            join_timeout,
            status_interval,
            engine,
            uri,
            connect,
            shapes,
            selection,
            seed,
            window_start,
            csv,
            save,
        } => {
            let file_layer = match config {
                Some(path) => ConfigLayer::from_yaml_file(&path)?,
                None => ConfigLayer::default(),
            };
            let mut connect_params = std::collections::BTreeMap::new();
            if let Some(uri) = uri {
                connect_params.insert("uri".to_string(), uri);
            }
            connect_params.extend(parse_connect_kv(&connect).params);
            let cli_layer = ConfigLayer {
                preset,
                workers,
                duration_secs: duration,
                join_timeout_secs: join_timeout,
                status_interval_secs: status_interval,
                engine,
                connect: connect_params,
                shapes: (!shapes.is_empty()).then_some(shapes),
                selection,
                seed,
                window_start,
            };
            let run_config = file_layer.merge(cli_layer).resolve()?;

            println!("Starting load test:");
            println!("  Engine: {}", run_config.store.engine);
            println!("  Workers: {}", run_config.workers);
            println!("  Duration: {} s", run_config.duration.as_secs());
            println!("  Join timeout: {} s", run_config.join_timeout.as_secs());
            println!(
                "  Shapes: {}",
                run_config
                    .shapes
                    .iter()
                    .map(|s| s.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!("  Pacing: unlimited (no delay)");

            let orchestrator = Orchestrator::from_config(run_config)?.with_run_id(run_id.clone());

            // Externalize snapshotting; the writer task ends with the run
            let mut snapshot_output = match csv {
                Some(path) => OutputWriter::new_csv(path).await?,
                None => OutputWriter::new_stdout(),
            };
            let stats = orchestrator.stats();
            let stop = orchestrator.stop_signal();
            let snapshot_handle = tokio::spawn(async move {
                let mut t = tokio::time::interval(Duration::from_secs(snapshot_interval_secs));
                loop {
                    tokio::select! {
                        _ = t.tick() => {
                            let snap = stats.snapshot().await;
                            if let Err(e) = snapshot_output.write_snapshot(&snap).await {
                                tracing::warn!(error = %e, "Snapshot write failed");
                            }
                        }
                        _ = stop.wait() => break,
                    }
                }
                (snapshot_output, stats)
            });

            let result = orchestrator.run_with_signal_handling().await?;

            // Write final snapshot once more
            if let Ok((mut out, stats)) = snapshot_handle.await {
                let snap = stats.snapshot().await;
                out.write_snapshot(&snap).await?;
            }

            output::print_summary(&result);
            if save {
                let base = PathBuf::from(&cli.out_dir);
                let json_path = base.join(format!("{}.json", run_id));
                let workers_path = base.join(format!("{}_workers.csv", run_id));
                output::write_report_json(&json_path.to_string_lossy(), &result).await?;
                output::write_workers_csv(&workers_path.to_string_lossy(), &result).await?;
            }
            Ok(())
        }
    }
}
