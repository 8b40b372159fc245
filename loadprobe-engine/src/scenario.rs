use loadprobe_client::RequestExecutor;
use loadprobe_common::{
    duration_ms, AggregateStats, DriftReport, Endpoint, HttpMethod, LoadPhaseResult, LoadProbeError,
    Result, Sample, ScenarioResult, ScenarioStatus, Sla,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::drift::DriftConfig;
use crate::driver::{DriverConfig, LoadDriver, LoadPlan};
use crate::metrics::{aggregate_samples, ordered_latencies, MetricsCollector};
use crate::threshold::{evaluate, evaluate_endpoint};

/// When a phase starts relative to the phase before it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseStart {
    /// After the previous phase has finished.
    #[default]
    Sequential,
    /// `offset` after the previous phase started, running alongside it.
    Overlap {
        #[serde(with = "duration_ms")]
        offset: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub plan: LoadPlan,
    /// Checked against the phase-wide aggregate.
    #[serde(default)]
    pub sla: Sla,
    /// Checked against each endpoint's own aggregate, keyed by endpoint id.
    #[serde(default)]
    pub endpoint_slas: BTreeMap<String, Sla>,
    /// Present for long-running phases; enables drift detection.
    #[serde(default)]
    pub drift: Option<DriftConfig>,
    /// A failed SLA aborts the scenario instead of only being recorded.
    #[serde(default)]
    pub abort_on_violation: bool,
    #[serde(default)]
    pub start: PhaseStart,
}

impl PhaseConfig {
    pub fn new(name: impl Into<String>, plan: LoadPlan) -> Self {
        Self {
            name: name.into(),
            plan,
            sla: Sla::default(),
            endpoint_slas: BTreeMap::new(),
            drift: None,
            abort_on_violation: false,
            start: PhaseStart::Sequential,
        }
    }

    pub fn with_sla(mut self, sla: Sla) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_endpoint_sla(mut self, endpoint: &Endpoint, sla: Sla) -> Self {
        self.endpoint_slas.insert(endpoint.id(), sla);
        self
    }

    pub fn long_running(mut self, drift: DriftConfig) -> Self {
        self.drift = Some(drift);
        self
    }

    pub fn abort_on_violation(mut self) -> Self {
        self.abort_on_violation = true;
        self
    }

    pub fn overlapping(mut self, offset: Duration) -> Self {
        self.start = PhaseStart::Overlap { offset };
        self
    }

    pub fn validate(&self) -> Result<()> {
        let scoped = |e: LoadProbeError| match e {
            LoadProbeError::InvalidConfig(msg) => {
                LoadProbeError::InvalidConfig(format!("phase {:?}: {msg}", self.name))
            }
            other => other,
        };
        if self.name.trim().is_empty() {
            return Err(LoadProbeError::InvalidConfig("phase name must not be empty".to_string()));
        }
        self.plan.validate().map_err(scoped)?;
        self.sla.validate().map_err(scoped)?;
        for sla in self.endpoint_slas.values() {
            sla.validate().map_err(scoped)?;
        }
        if let Some(drift) = &self.drift {
            drift.validate().map_err(scoped)?;
        }
        Ok(())
    }
}

fn default_precheck() -> Endpoint {
    Endpoint { method: HttpMethod::Get, path: "/".to_string(), accept: Vec::new() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub phases: Vec<PhaseConfig>,
    /// Called once before any phase to confirm the target is up.
    #[serde(default = "default_precheck")]
    pub precheck: Endpoint,
    /// Bounds the whole scenario; each phase's deadline is clipped to what is left.
    #[serde(default, with = "duration_ms::option")]
    pub deadline: Option<Duration>,
}

impl ScenarioConfig {
    pub fn new(name: impl Into<String>, phases: Vec<PhaseConfig>) -> Self {
        Self { name: name.into(), phases, precheck: default_precheck(), deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Load and validate a scenario from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            LoadProbeError::InvalidConfig(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(LoadProbeError::InvalidConfig(format!(
                "scenario {:?} has no phases",
                self.name
            )));
        }
        self.precheck.validate()?;
        let mut seen = HashSet::new();
        for phase in &self.phases {
            phase.validate()?;
            if !seen.insert(phase.name.as_str()) {
                return Err(LoadProbeError::InvalidConfig(format!(
                    "duplicate phase name {:?}",
                    phase.name
                )));
            }
        }
        Ok(())
    }
}

/// Where a [`ScenarioRunner`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Pending,
    /// Index of the most recently started phase.
    Running { phase: usize },
    Failed,
    Completed,
}

/// Everything a phase needs, cheap to clone into a spawned task.
#[derive(Clone)]
struct PhaseContext {
    executor: Arc<RequestExecutor>,
    collector: MetricsCollector,
    driver_config: DriverConfig,
}

/// Runs the phases of one scenario against one target and assembles the verdict.
pub struct ScenarioRunner {
    config: ScenarioConfig,
    ctx: PhaseContext,
    state: RunnerState,
}

impl ScenarioRunner {
    pub fn new(
        config: ScenarioConfig,
        executor: Arc<RequestExecutor>,
        driver_config: DriverConfig,
    ) -> Result<Self> {
        config.validate()?;
        driver_config.validate()?;
        Ok(Self {
            config,
            ctx: PhaseContext { executor, collector: MetricsCollector::new(), driver_config },
            state: RunnerState::Pending,
        })
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Every sample recorded so far in this run.
    pub fn collector(&self) -> &MetricsCollector {
        &self.ctx.collector
    }

    /// One call without retries. Any HTTP status proves the target is reachable.
    pub async fn precheck(&self) -> Result<u16> {
        let endpoint = &self.config.precheck;
        match self.ctx.executor.probe(endpoint).await {
            Ok(status) => {
                if endpoint.is_success_status(status) {
                    info!(endpoint = %endpoint, status, "target is up");
                } else {
                    warn!(endpoint = %endpoint, status, "target answered precheck with an error status");
                }
                Ok(status)
            }
            Err(e) => Err(LoadProbeError::TargetUnreachable(format!("{endpoint}: {e}"))),
        }
    }

    /// Run the scenario. Only configuration errors are returned as `Err`;
    /// an unreachable target or failed SLA is reported in the result.
    ///
    /// Each call starts from an empty collector, so a result never includes
    /// samples from an earlier run.
    pub async fn run(&mut self) -> Result<ScenarioResult> {
        self.ctx.collector.clear();
        self.transition(RunnerState::Pending);
        let started = Instant::now();
        let deadline = self.config.deadline.map(|d| started + d);
        info!(scenario = %self.config.name, phases = self.config.phases.len(), "scenario started");

        if let Err(e) = self.precheck().await {
            warn!(scenario = %self.config.name, error = %e, "precheck failed, no phase will run");
            self.transition(RunnerState::Failed);
            return Ok(self.finish(ScenarioStatus::TargetUnreachable, Vec::new(), vec![e.to_string()], started));
        }

        let mut results: Vec<LoadPhaseResult> = Vec::new();
        let mut violations = Vec::new();

        for group in phase_groups(&self.config.phases) {
            if deadline.is_some_and(|at| Instant::now() >= at) {
                let phase = self.config.phases[group[0]].name.clone();
                violations.push(format!("scenario deadline elapsed before phase {phase:?} started"));
                self.transition(RunnerState::Failed);
                return Ok(self.finish(ScenarioStatus::Aborted { phase }, results, violations, started));
            }

            let last = group[group.len() - 1];
            self.transition(RunnerState::Running { phase: last });
            let group_results = self.run_group(&group, deadline).await?;

            let mut fatal: Option<String> = None;
            for (index, result) in group.iter().zip(group_results) {
                let phase = &self.config.phases[*index];
                if phase.abort_on_violation && !result.sla_passed && fatal.is_none() {
                    fatal = Some(phase.name.clone());
                }
                results.push(result);
            }

            if let Some(phase) = fatal {
                warn!(scenario = %self.config.name, phase = %phase, "phase failed its SLA, aborting scenario");
                violations.push(format!("phase {phase:?} failed its SLA and is configured to abort the scenario"));
                self.transition(RunnerState::Failed);
                return Ok(self.finish(ScenarioStatus::Aborted { phase }, results, violations, started));
            }
        }

        self.transition(RunnerState::Completed);
        Ok(self.finish(ScenarioStatus::Completed, results, violations, started))
    }

    /// Run one group of phases: a lone sequential phase, or a phase plus the
    /// phases overlapping it. Results come back in configuration order.
    async fn run_group(&self, group: &[usize], deadline: Option<Instant>) -> Result<Vec<LoadPhaseResult>> {
        if let [index] = group {
            let result = run_phase(self.ctx.clone(), self.config.phases[*index].clone(), deadline).await?;
            return Ok(vec![result]);
        }

        let mut tasks = JoinSet::new();
        let mut offset = Duration::ZERO;
        for (slot, index) in group.iter().enumerate() {
            let phase = self.config.phases[*index].clone();
            if let PhaseStart::Overlap { offset: delta } = phase.start {
                if slot > 0 {
                    offset += delta;
                }
            }
            let ctx = self.ctx.clone();
            let delay = offset;
            tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                (slot, run_phase(ctx, phase, deadline).await)
            });
        }

        let mut slots: Vec<Option<LoadPhaseResult>> = vec![None; group.len()];
        while let Some(joined) = tasks.join_next().await {
            let (slot, result) = joined
                .map_err(|e| LoadProbeError::Io(format!("phase task failed: {e}")))?;
            slots[slot] = Some(result?);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    fn transition(&mut self, next: RunnerState) {
        debug!(scenario = %self.config.name, from = ?self.state, to = ?next, "runner state change");
        self.state = next;
    }

    fn finish(
        &self,
        status: ScenarioStatus,
        phases: Vec<LoadPhaseResult>,
        violations: Vec<String>,
        started: Instant,
    ) -> ScenarioResult {
        let passed = status == ScenarioStatus::Completed && phases.iter().all(|p| p.sla_passed);
        let elapsed = started.elapsed();
        info!(
            scenario = %self.config.name,
            passed,
            phases = phases.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "scenario finished"
        );
        ScenarioResult {
            name: self.config.name.clone(),
            status,
            phases,
            passed,
            violations,
            overall: self.ctx.collector.aggregate(None),
            elapsed,
        }
    }
}

/// Split phases into groups that run together: each group starts with a
/// sequential phase followed by every phase overlapping it.
pub fn phase_groups(phases: &[PhaseConfig]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (index, phase) in phases.iter().enumerate() {
        match (&phase.start, groups.last_mut()) {
            (PhaseStart::Overlap { .. }, Some(group)) => group.push(index),
            _ => groups.push(vec![index]),
        }
    }
    groups
}

async fn run_phase(
    ctx: PhaseContext,
    phase: PhaseConfig,
    scenario_deadline: Option<Instant>,
) -> Result<LoadPhaseResult> {
    let mut plan = phase.plan.clone();
    if let Some(at) = scenario_deadline {
        let remaining = at.saturating_duration_since(Instant::now());
        plan.deadline = Some(plan.deadline.map_or(remaining, |d| d.min(remaining)));
    }

    info!(phase = %phase.name, users = plan.virtual_users, "phase started");
    let driver = LoadDriver::new(ctx.executor, ctx.collector, ctx.driver_config)?;
    let run = driver.run(&plan).await?;

    let result = evaluate_phase(&phase, &run.samples, run.elapsed, run.cancelled);
    info!(
        phase = %phase.name,
        count = result.stats.count,
        success_rate = result.stats.success_rate,
        mean_ms = result.stats.mean.as_secs_f64() * 1000.0,
        p95_ms = result.stats.p95.as_secs_f64() * 1000.0,
        sla_passed = result.sla_passed,
        "phase finished"
    );
    Ok(result)
}

/// Aggregate, check SLAs and (for long-running phases) drift over one phase's samples.
pub fn evaluate_phase(
    phase: &PhaseConfig,
    samples: &[Sample],
    elapsed: Duration,
    cancelled: bool,
) -> LoadPhaseResult {
    let stats = aggregate_samples(samples);

    let mut by_endpoint: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        by_endpoint.entry(sample.endpoint.clone()).or_default().push(sample.clone());
    }
    let endpoints: BTreeMap<String, AggregateStats> = by_endpoint
        .iter()
        .map(|(id, samples)| (id.clone(), aggregate_samples(samples)))
        .collect();

    let mut violations = evaluate(&stats, &phase.sla).violations;
    for (id, sla) in &phase.endpoint_slas {
        // An endpoint that was never called is judged on empty stats.
        let endpoint_stats = endpoints.get(id).cloned().unwrap_or_default();
        violations.extend(evaluate_endpoint(id, &endpoint_stats, sla).violations);
    }

    let mut drift: BTreeMap<String, DriftReport> = BTreeMap::new();
    if let Some(config) = &phase.drift {
        for (id, samples) in &by_endpoint {
            let report = config.detect(&ordered_latencies(samples));
            if report.drift_detected() {
                warn!(phase = %phase.name, endpoint = %id, detail = %report.detail, "latency drift detected");
                if config.fail_on_drift {
                    violations.push(format!("{id}: latency drift detected: {}", report.detail));
                }
            }
            drift.insert(id.clone(), report);
        }
    }

    let secs = elapsed.as_secs_f64();
    let throughput = if secs > 0.0 { stats.count as f64 / secs } else { 0.0 };

    LoadPhaseResult {
        phase_name: phase.name.clone(),
        sla_passed: violations.is_empty(),
        stats,
        endpoints,
        violations,
        duration_elapsed: elapsed,
        throughput,
        drift,
        cancelled,
    }
}
