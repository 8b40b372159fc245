use async_trait::async_trait;
use loadprobe_client::{ExecutorConfig, RequestExecutor, RetryPolicy, Transport};
use loadprobe_common::{DriftVerdict, Endpoint, LoadProbeError, Sample, ScenarioStatus, Sla, TransportError};
use loadprobe_engine::drift::DriftConfig;
use loadprobe_engine::driver::{DriverConfig, LoadPlan};
use loadprobe_engine::scenario::{
    evaluate_phase, phase_groups, PhaseConfig, RunnerState, ScenarioConfig, ScenarioRunner,
};
use loadprobe_engine::workload::WorkloadMix;
use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Every path answers 200 after the same delay.
struct SteadyTransport {
    latency: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for SteadyTransport {
    async fn call(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<u16, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(200)
    }
}

/// Nothing is listening.
struct DownTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for DownTransport {
    async fn call(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<u16, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Connect("connection refused".to_string()))
    }
}

/// Each call is 10 ms slower than the one before.
struct DegradingTransport {
    calls: AtomicU64,
}

#[async_trait]
impl Transport for DegradingTransport {
    async fn call(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<u16, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(ms(10 * n)).await;
        Ok(200)
    }
}

fn executor(transport: Arc<dyn Transport>) -> Arc<RequestExecutor> {
    let config = ExecutorConfig { timeout: Duration::from_secs(5), retry: RetryPolicy::none() };
    Arc::new(RequestExecutor::new(transport, config).unwrap())
}

fn steady(latency: Duration) -> Arc<SteadyTransport> {
    Arc::new(SteadyTransport { latency, calls: AtomicUsize::new(0) })
}

fn phase(name: &str, path: &str, users: usize, requests: usize) -> PhaseConfig {
    PhaseConfig::new(name, LoadPlan::new(WorkloadMix::single(Endpoint::get(path).unwrap()), users, requests))
}

fn mean_under(limit: Duration) -> Sla {
    Sla { max_mean_latency: Some(limit), ..Sla::default() }
}

// --- Precheck ---

#[tokio::test(start_paused = true)]
async fn test_unreachable_target_runs_no_phase() {
    let transport = Arc::new(DownTransport { calls: AtomicUsize::new(0) });
    let config = ScenarioConfig::new("down", vec![phase("home", "/", 5, 5), phase("products", "/products", 5, 5)]);
    let mut runner = ScenarioRunner::new(config, executor(transport.clone()), DriverConfig::default()).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ScenarioStatus::TargetUnreachable);
    assert!(result.phases.is_empty());
    assert!(!result.passed);
    assert_eq!(result.violations.len(), 1);
    assert!(result.violations[0].contains("connection refused"), "{:?}", result.violations);
    assert_eq!(runner.state(), RunnerState::Failed);
    // Only the precheck went out, with no retries.
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_precheck_reports_status() {
    let config = ScenarioConfig::new("up", vec![phase("home", "/", 1, 1)]);
    let runner = ScenarioRunner::new(config, executor(steady(ms(5))), DriverConfig::default()).unwrap();
    assert_eq!(runner.precheck().await.unwrap(), 200);
    assert_eq!(runner.state(), RunnerState::Pending);
}

// --- Phases and SLAs ---

#[tokio::test(start_paused = true)]
async fn test_passing_scenario() {
    let config = ScenarioConfig::new(
        "smoke",
        vec![
            phase("home", "/", 2, 5).with_sla(mean_under(ms(200))),
            phase("products", "/products", 1, 5).with_sla(mean_under(ms(200))),
        ],
    );
    let mut runner = ScenarioRunner::new(config, executor(steady(ms(100))), DriverConfig::default()).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ScenarioStatus::Completed);
    assert!(result.passed);
    assert_eq!(runner.state(), RunnerState::Completed);
    assert_eq!(result.phases.len(), 2);
    assert_eq!(result.phases[0].phase_name, "home");
    assert_eq!(result.phases[0].stats.count, 10);
    assert_eq!(result.phases[1].stats.count, 5);
    assert_eq!(result.overall.count, 15);
    assert_eq!(runner.collector().len(), 15);
    // Precheck, then two 500 ms phases back to back.
    assert_eq!(result.elapsed, ms(1100));
    assert!(result.phases[0].throughput > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_sla_violation_fails_but_continues() {
    let config = ScenarioConfig::new(
        "slow",
        vec![
            phase("home", "/", 1, 3).with_sla(mean_under(ms(50))),
            phase("products", "/products", 1, 3),
        ],
    );
    let mut runner = ScenarioRunner::new(config, executor(steady(ms(100))), DriverConfig::default()).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ScenarioStatus::Completed);
    assert!(!result.passed);
    assert_eq!(result.phases.len(), 2);
    assert!(!result.phases[0].sla_passed);
    assert_eq!(
        result.phases[0].violations,
        vec!["mean latency 100.0ms exceeds limit 50.0ms".to_string()]
    );
    assert!(result.phases[1].sla_passed);
}

#[tokio::test(start_paused = true)]
async fn test_abort_on_violation_skips_remaining_phases() {
    let config = ScenarioConfig::new(
        "fatal",
        vec![
            phase("gate", "/", 1, 2).with_sla(mean_under(ms(50))).abort_on_violation(),
            phase("never", "/products", 1, 2),
        ],
    );
    let transport = steady(ms(100));
    let mut runner = ScenarioRunner::new(config, executor(transport.clone()), DriverConfig::default()).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ScenarioStatus::Aborted { phase: "gate".to_string() });
    assert!(!result.passed);
    assert_eq!(result.phases.len(), 1);
    assert_eq!(runner.state(), RunnerState::Failed);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_reports_only_its_own_samples() {
    let config = ScenarioConfig::new("twice", vec![phase("home", "/", 2, 3)]);
    let mut runner = ScenarioRunner::new(config, executor(steady(ms(10))), DriverConfig::default()).unwrap();

    let first = runner.run().await.unwrap();
    let second = runner.run().await.unwrap();

    assert_eq!(first.overall.count, 6);
    assert_eq!(second.overall.count, 6);
    assert_eq!(runner.collector().len(), 6);
    assert_eq!(runner.state(), RunnerState::Completed);
}

// --- Overlap and deadlines ---

#[tokio::test(start_paused = true)]
async fn test_overlapping_phases_run_together() {
    let config = ScenarioConfig::new(
        "overlap",
        vec![
            phase("a", "/a", 1, 5),
            phase("b", "/b", 1, 3).overlapping(ms(200)),
        ],
    );
    let mut runner = ScenarioRunner::new(config, executor(steady(ms(100))), DriverConfig::default()).unwrap();

    let result = runner.run().await.unwrap();

    assert!(result.passed);
    assert_eq!(result.phases.len(), 2);
    assert_eq!(result.phases[0].phase_name, "a");
    assert_eq!(result.phases[1].phase_name, "b");
    assert_eq!(result.overall.count, 8);
    // 100 ms precheck, then "a" (500 ms) alongside "b" (starts at 200 ms, runs 300 ms).
    assert_eq!(result.elapsed, ms(600));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_deadline_cuts_phase_and_aborts() {
    let config = ScenarioConfig::new(
        "bounded",
        vec![phase("first", "/", 1, 100), phase("second", "/products", 1, 1)],
    )
    .with_deadline(ms(250));
    let mut runner = ScenarioRunner::new(config, executor(steady(ms(100))), DriverConfig::default()).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ScenarioStatus::Aborted { phase: "second".to_string() });
    assert!(!result.passed);
    assert_eq!(result.phases.len(), 1);
    assert!(result.phases[0].cancelled);
    // Calls at 100–200 ms and 200–300 ms; the second was in flight at the deadline.
    assert_eq!(result.phases[0].stats.count, 2);
    assert_eq!(result.violations.len(), 1);
}

#[test]
fn test_phase_groups() {
    let phases = vec![
        phase("a", "/", 1, 1),
        phase("b", "/", 1, 1).overlapping(ms(10)),
        phase("c", "/", 1, 1),
        phase("d", "/", 1, 1).overlapping(ms(10)),
        phase("e", "/", 1, 1).overlapping(ms(10)),
    ];
    assert_eq!(phase_groups(&phases), vec![vec![0, 1], vec![2, 3, 4]]);

    // A leading overlap has nothing to overlap with and starts its own group.
    let leading = vec![phase("a", "/", 1, 1).overlapping(ms(10)), phase("b", "/", 1, 1)];
    assert_eq!(phase_groups(&leading), vec![vec![0], vec![1]]);
}

// --- Drift ---

#[tokio::test(start_paused = true)]
async fn test_drift_becomes_violation_when_configured() {
    let transport = Arc::new(DegradingTransport { calls: AtomicU64::new(0) });
    let soak = phase("soak", "/", 1, 20)
        .long_running(DriftConfig { fail_on_drift: true, ..DriftConfig::default() });
    let mut runner =
        ScenarioRunner::new(ScenarioConfig::new("soak", vec![soak]), executor(transport), DriverConfig::default())
            .unwrap();

    let result = runner.run().await.unwrap();

    let phase = &result.phases[0];
    assert_eq!(phase.drift["GET /"].verdict, DriftVerdict::Degraded);
    assert!(!phase.sla_passed);
    assert!(phase.violations[0].starts_with("GET /: latency drift detected"));
    assert!(!result.passed);
}

#[tokio::test(start_paused = true)]
async fn test_drift_is_reported_only_by_default() {
    let transport = Arc::new(DegradingTransport { calls: AtomicU64::new(0) });
    let soak = phase("soak", "/", 1, 20).long_running(DriftConfig::default());
    let mut runner =
        ScenarioRunner::new(ScenarioConfig::new("soak", vec![soak]), executor(transport), DriverConfig::default())
            .unwrap();

    let result = runner.run().await.unwrap();

    assert!(result.phases[0].drift["GET /"].drift_detected());
    assert!(result.phases[0].sla_passed);
    assert!(result.passed);
}

// --- evaluate_phase ---

fn sample(endpoint: &str, seq: u64, latency_ms: u64) -> Sample {
    Sample {
        endpoint: endpoint.to_string(),
        latency: ms(latency_ms),
        status_code: 200,
        success: true,
        sequence_number: seq,
        timestamp: SystemTime::now(),
        attempts: 1,
        error: None,
    }
}

#[test]
fn test_endpoint_slas_are_checked_per_endpoint() {
    let fast = Endpoint::get("/fast").unwrap();
    let slow = Endpoint::get("/slow").unwrap();
    let missing = Endpoint::get("/missing").unwrap();
    let mix = WorkloadMix::weighted(vec![(fast.clone(), 1), (slow.clone(), 1)]).unwrap();
    let config = PhaseConfig::new("mix", LoadPlan::new(mix, 1, 4))
        .with_endpoint_sla(&fast, mean_under(ms(50)))
        .with_endpoint_sla(&slow, mean_under(ms(50)))
        .with_endpoint_sla(&missing, Sla { min_success_rate: Some(50.0), ..Sla::default() });

    let samples = vec![
        sample("GET /fast", 0, 10),
        sample("GET /slow", 0, 300),
        sample("GET /fast", 1, 20),
        sample("GET /slow", 1, 100),
    ];
    let result = evaluate_phase(&config, &samples, Duration::from_secs(2), false);

    assert_eq!(result.stats.count, 4);
    assert_eq!(result.endpoints.len(), 2);
    assert_eq!(result.endpoints["GET /fast"].mean, ms(15));
    assert_eq!(result.throughput, 2.0);
    assert!(!result.sla_passed);
    assert_eq!(result.violations.len(), 2);
    assert!(result.violations[0].starts_with("GET /missing: success rate 0.00%"));
    assert_eq!(result.violations[1], "GET /slow: mean latency 200.0ms exceeds limit 50.0ms");
}

#[test]
fn test_zero_elapsed_has_zero_throughput() {
    let result = evaluate_phase(&phase("p", "/", 1, 1), &[], Duration::ZERO, false);
    assert_eq!(result.throughput, 0.0);
    assert!(result.sla_passed);
}

// --- Configuration ---

#[test]
fn test_config_validation() {
    assert!(ScenarioConfig::new("empty", vec![]).validate().is_err());

    let duplicate = ScenarioConfig::new("dup", vec![phase("p", "/", 1, 1), phase("p", "/x", 1, 1)]);
    assert!(duplicate.validate().is_err());

    let bad_rate = phase("p", "/", 1, 1).with_sla(Sla { min_success_rate: Some(150.0), ..Sla::default() });
    let err = ScenarioConfig::new("rate", vec![bad_rate]).validate().unwrap_err();
    match err {
        LoadProbeError::InvalidConfig(msg) => assert!(msg.starts_with("phase \"p\": "), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }

    let bad_drift = phase("p", "/", 1, 1)
        .long_running(DriftConfig { degradation_ratio: -2.0, ..DriftConfig::default() });
    assert!(ScenarioConfig::new("drift", vec![bad_drift]).validate().is_err());
}

#[test]
fn test_runner_rejects_invalid_config() {
    let result = ScenarioRunner::new(
        ScenarioConfig::new("empty", vec![]),
        executor(steady(ms(1))),
        DriverConfig::default(),
    );
    assert!(result.is_err());
}

#[test]
fn test_load_scenario_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "name": "from-file",
            "phases": [{{
                "name": "home",
                "plan": {{
                    "workload": {{ "entries": [{{ "endpoint": {{ "method": "GET", "path": "/" }}, "weight": 1 }}] }},
                    "virtual_users": 2,
                    "requests_per_user": 3,
                    "think_time": {{ "min": 100, "max": 250.5 }}
                }},
                "sla": {{ "max_mean_latency": 500, "min_success_rate": 99.5 }},
                "start": {{ "kind": "overlap", "offset": 1000 }}
            }}],
            "deadline": 60000
        }}"#
    )
    .unwrap();

    let config = ScenarioConfig::from_json_file(file.path()).unwrap();

    assert_eq!(config.name, "from-file");
    assert_eq!(config.deadline, Some(Duration::from_secs(60)));
    assert_eq!(config.precheck, Endpoint::get("/").unwrap());
    let home = &config.phases[0];
    assert_eq!(home.plan.virtual_users, 2);
    assert_eq!(home.plan.requests_per_user, Some(3));
    assert_eq!(home.plan.think_time.max, Duration::from_micros(250_500));
    assert_eq!(home.sla.max_mean_latency, Some(ms(500)));
    assert_eq!(home.sla.min_success_rate, Some(99.5));
    assert!(!home.abort_on_violation);
}

#[test]
fn test_invalid_json_file_is_a_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "name": "x", "phases": [] }}"#).unwrap();
    assert!(matches!(
        ScenarioConfig::from_json_file(file.path()),
        Err(LoadProbeError::InvalidConfig(_))
    ));

    let mut garbage = tempfile::NamedTempFile::new().unwrap();
    write!(garbage, "not json").unwrap();
    assert!(matches!(
        ScenarioConfig::from_json_file(garbage.path()),
        Err(LoadProbeError::InvalidConfig(_))
    ));
}

#[test]
fn test_extreme_json_values_load_without_panicking() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "name": "extreme",
            "phases": [{{
                "name": "mix",
                "plan": {{
                    "workload": {{ "entries": [
                        {{ "endpoint": {{ "method": "GET", "path": "/" }}, "weight": 4294967295 }},
                        {{ "endpoint": {{ "method": "GET", "path": "/a" }}, "weight": 1 }}
                    ] }},
                    "virtual_users": 1,
                    "requests_per_user": 1
                }},
                "drift": {{ "window_size": 18446744073709551615, "degradation_ratio": 1.5 }}
            }}]
        }}"#
    )
    .unwrap();

    let config = ScenarioConfig::from_json_file(file.path()).unwrap();
    let phase = &config.phases[0];
    assert_eq!(phase.plan.workload.total_weight(), 4_294_967_296);

    let samples: Vec<Sample> = (0..20).map(|i| sample("GET /", i, 100)).collect();
    let result = evaluate_phase(phase, &samples, Duration::from_secs(1), false);
    assert_eq!(result.drift["GET /"].verdict, DriftVerdict::Stable);
}

#[tokio::test(start_paused = true)]
async fn test_zero_user_phase_completes_empty() {
    let transport = steady(ms(10));
    let config = ScenarioConfig::new("idle", vec![phase("nobody", "/", 0, 5)]);
    let mut runner = ScenarioRunner::new(config, executor(transport.clone()), DriverConfig::default()).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ScenarioStatus::Completed);
    assert!(result.passed);
    assert!(result.phases[0].stats.is_empty());
    // Only the precheck reached the target.
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}
