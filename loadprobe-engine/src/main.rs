use clap::Parser;
use loadprobe_client::{ExecutorConfig, RequestExecutor, RetryPolicy};
use loadprobe_common::{ScenarioStatus, Sla};
use loadprobe_engine::driver::{DriverConfig, ThinkTime};
use loadprobe_engine::presets::{CustomOptions, ScenarioKind};
use loadprobe_engine::report;
use loadprobe_engine::scenario::{ScenarioConfig, ScenarioRunner};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loadprobe", about = "HTTP load tester with latency SLAs and drift detection")]
struct Args {
    /// Scenario to run: quick | full | stress | custom
    #[arg(long, default_value = "quick")]
    scenario: String,

    /// Base URL of the system under test
    #[arg(long, env = "LOADPROBE_TARGET", default_value = "http://localhost:5000")]
    target: String,

    /// Virtual users (custom scenario)
    #[arg(long, default_value_t = 10)]
    users: usize,

    /// Requests per user (custom scenario)
    #[arg(long, default_value_t = 10)]
    requests: usize,

    /// Run for this many seconds instead of a fixed request count (custom scenario)
    #[arg(long)]
    duration: Option<u64>,

    /// Path to call (custom scenario)
    #[arg(long, default_value = "/")]
    path: String,

    /// Minimum pause between calls of one user, in ms (custom scenario)
    #[arg(long, default_value_t = 0)]
    think_min_ms: u64,

    /// Maximum pause between calls of one user, in ms (custom scenario)
    #[arg(long, default_value_t = 0)]
    think_max_ms: u64,

    /// Users started per second; all users start at once when omitted (custom scenario)
    #[arg(long)]
    spawn_rate: Option<f64>,

    /// Fail if the mean latency exceeds this many ms (custom scenario)
    #[arg(long)]
    max_mean_ms: Option<u64>,

    /// Fail if the p95 latency exceeds this many ms (custom scenario)
    #[arg(long)]
    max_p95_ms: Option<u64>,

    /// Fail if fewer than this percentage of calls succeed (custom scenario)
    #[arg(long)]
    min_success_rate: Option<f64>,

    /// Per-attempt timeout in ms
    #[arg(long, env = "LOADPROBE_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Retries for transient failures (429, 502-504, refused or reset connections)
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Upper bound on virtual users running at once
    #[arg(long, default_value_t = 256)]
    max_concurrency: usize,

    /// Load the scenario from a JSON file instead of --scenario
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the full result as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let scenario = load_scenario(&args).unwrap_or_else(|msg| {
        eprintln!("{msg}");
        process::exit(3);
    });

    let executor_config = ExecutorConfig {
        timeout: Duration::from_millis(args.timeout_ms),
        retry: RetryPolicy { max_retries: args.max_retries, ..RetryPolicy::default() },
    };
    let executor = RequestExecutor::http(&args.target, executor_config).unwrap_or_else(|e| {
        eprintln!("{e}");
        process::exit(3);
    });

    let driver_config = DriverConfig { max_concurrency: args.max_concurrency, ..DriverConfig::default() };
    let mut runner = ScenarioRunner::new(scenario, Arc::new(executor), driver_config)
        .unwrap_or_else(|e| {
            eprintln!("{e}");
            process::exit(3);
        });

    println!("Target: {}", args.target);
    println!();

    let result = runner.run().await.unwrap_or_else(|e| {
        eprintln!("{e}");
        process::exit(3);
    });

    report::print_report(&result);

    if let Some(path) = &args.report {
        if let Err(e) = report::write_json(path, &result) {
            eprintln!("Failed to write report to {}: {e}", path.display());
            process::exit(3);
        }
        println!("Report written to {}", path.display());
    }

    let exit_code = if result.status == ScenarioStatus::TargetUnreachable {
        2
    } else if result.passed {
        0
    } else {
        1
    };

    process::exit(exit_code);
}

fn load_scenario(args: &Args) -> Result<ScenarioConfig, String> {
    if let Some(path) = &args.config {
        return ScenarioConfig::from_json_file(path).map_err(|e| e.to_string());
    }

    let kind = ScenarioKind::from_name(&args.scenario).ok_or_else(|| {
        format!(
            "Unknown scenario {:?}. Valid values: quick, full, stress, custom",
            args.scenario
        )
    })?;

    let custom = CustomOptions {
        path: args.path.clone(),
        users: args.users,
        requests: args.requests,
        duration: args.duration.map(Duration::from_secs),
        think_time: ThinkTime::between(
            Duration::from_millis(args.think_min_ms),
            Duration::from_millis(args.think_max_ms),
        ),
        spawn_rate: args.spawn_rate,
        sla: Sla {
            max_mean_latency: args.max_mean_ms.map(Duration::from_millis),
            max_p95_latency: args.max_p95_ms.map(Duration::from_millis),
            min_success_rate: args.min_success_rate,
        },
    };
    kind.build(&custom).map_err(|e| e.to_string())
}
