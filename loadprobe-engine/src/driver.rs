use loadprobe_client::RequestExecutor;
use loadprobe_common::{duration_ms, LoadProbeError, Result, Sample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;
use crate::workload::WorkloadMix;

/// What happens to calls still in flight when a deadline elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Let every in-flight call complete and record it.
    FinishInFlight,
    /// Wait up to the grace period, then drop whatever is still running.
    Abandon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Upper bound on virtual users running at once.
    pub max_concurrency: usize,
    pub cancellation: CancellationPolicy,
    /// How long [`CancellationPolicy::Abandon`] waits before aborting workers.
    #[serde(with = "duration_ms")]
    pub abandon_grace: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 256,
            cancellation: CancellationPolicy::FinishInFlight,
            abandon_grace: Duration::from_secs(1),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(LoadProbeError::InvalidConfig(
                "max_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pause between two calls of the same virtual user, drawn uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkTime {
    #[serde(with = "duration_ms")]
    pub min: Duration,
    #[serde(with = "duration_ms")]
    pub max: Duration,
}

impl ThinkTime {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fixed(pause: Duration) -> Self {
        Self { min: pause, max: pause }
    }

    pub fn between(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(LoadProbeError::InvalidConfig(format!(
                "think time range is inverted: min {:?} > max {:?}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn pick(&self, rng: &mut impl Rng) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }
}

/// One burst of load: who calls what, how often, and for how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPlan {
    pub workload: WorkloadMix,
    pub virtual_users: usize,
    /// Calls per virtual user; `None` keeps calling until `run_for` elapses.
    #[serde(default)]
    pub requests_per_user: Option<usize>,
    #[serde(default)]
    pub think_time: ThinkTime,
    /// Stop issuing new calls after this long. Checked between calls.
    #[serde(default, with = "duration_ms::option")]
    pub run_for: Option<Duration>,
    /// Hard limit; outstanding workers are cancelled when it elapses.
    #[serde(default, with = "duration_ms::option")]
    pub deadline: Option<Duration>,
    /// Seed for think times and endpoint selection; random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Users started per second; all users start at once when unset.
    #[serde(default)]
    pub spawn_rate: Option<f64>,
}

impl LoadPlan {
    pub fn new(workload: WorkloadMix, virtual_users: usize, requests_per_user: usize) -> Self {
        Self {
            workload,
            virtual_users,
            requests_per_user: Some(requests_per_user),
            think_time: ThinkTime::none(),
            run_for: None,
            deadline: None,
            seed: None,
            spawn_rate: None,
        }
    }

    /// A plan whose users keep calling until `run_for` elapses.
    pub fn timed(workload: WorkloadMix, virtual_users: usize, run_for: Duration) -> Self {
        Self { requests_per_user: None, run_for: Some(run_for), ..Self::new(workload, virtual_users, 0) }
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Ramp up: user `i` starts `i / users_per_sec` seconds after the run begins.
    pub fn with_spawn_rate(mut self, users_per_sec: f64) -> Self {
        self.spawn_rate = Some(users_per_sec);
        self
    }

    /// Delay before user `id` starts.
    pub fn start_delay(&self, id: usize) -> Duration {
        match self.spawn_rate {
            Some(rate) if rate > 0.0 => {
                let interval = Duration::from_nanos((1e9 / rate).round() as u64);
                interval.saturating_mul(u32::try_from(id).unwrap_or(u32::MAX))
            }
            _ => Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.workload.validate()?;
        self.think_time.validate()?;
        if let Some(rate) = self.spawn_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(LoadProbeError::InvalidConfig(format!(
                    "spawn_rate must be a positive number of users per second, got {rate}"
                )));
            }
        }
        if self.requests_per_user.is_none() && self.run_for.is_none() {
            return Err(LoadProbeError::InvalidConfig(
                "load plan needs requests_per_user, run_for, or both".to_string(),
            ));
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.virtual_users == 0 || self.requests_per_user == Some(0)
    }
}

/// Everything one [`LoadDriver::run`] produced.
#[derive(Debug, Clone)]
pub struct DriverRun {
    /// Samples in arrival order; no ordering across workers.
    pub samples: Vec<Sample>,
    /// The deadline elapsed before every worker finished.
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Runs virtual users concurrently and forwards their samples to a [`MetricsCollector`].
pub struct LoadDriver {
    executor: Arc<RequestExecutor>,
    collector: MetricsCollector,
    config: DriverConfig,
}

impl LoadDriver {
    pub fn new(
        executor: Arc<RequestExecutor>,
        collector: MetricsCollector,
        config: DriverConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { executor, collector, config })
    }

    /// Drive `plan` to completion or to its deadline.
    ///
    /// Samples are recorded in the collector as they arrive. A deadline never
    /// discards work: everything that completed is returned.
    pub async fn run(&self, plan: &LoadPlan) -> Result<DriverRun> {
        plan.validate()?;
        let started = Instant::now();

        if plan.is_empty() {
            return Ok(DriverRun { samples: Vec::new(), cancelled: false, elapsed: Duration::ZERO });
        }

        let permits = plan.virtual_users.min(self.config.max_concurrency);
        info!(
            users = plan.virtual_users,
            concurrency = permits,
            requests_per_user = ?plan.requests_per_user,
            run_for = ?plan.run_for,
            spawn_rate = ?plan.spawn_rate,
            "starting load"
        );

        let semaphore = Arc::new(Semaphore::new(permits));
        let cancel = CancellationToken::new();
        let workload = Arc::new(plan.workload.clone());
        let stop_at = plan.run_for.map(|d| started + d);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut workers = JoinSet::new();
        for id in 0..plan.virtual_users {
            let user = VirtualUser {
                id,
                executor: Arc::clone(&self.executor),
                workload: Arc::clone(&workload),
                requests: plan.requests_per_user,
                think_time: plan.think_time,
                start_after: plan.start_delay(id),
                stop_at,
                rng: match plan.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
                    None => StdRng::from_entropy(),
                },
            };
            workers.spawn(user.run(Arc::clone(&semaphore), cancel.clone(), tx.clone()));
        }
        // Only workers hold senders now, so the channel closes when the last one exits.
        drop(tx);

        let deadline = plan.deadline.map(|d| started + d);
        let mut abort_at: Option<Instant> = None;
        let mut cancelled = false;
        let mut samples = Vec::new();

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(sample) => {
                        self.collector.record(sample.clone());
                        samples.push(sample);
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if !cancelled => {
                    cancelled = true;
                    cancel.cancel();
                    warn!(
                        completed = samples.len(),
                        policy = ?self.config.cancellation,
                        "deadline elapsed, cancelling virtual users"
                    );
                    if self.config.cancellation == CancellationPolicy::Abandon {
                        abort_at = Some(Instant::now() + self.config.abandon_grace);
                    }
                }
                _ = sleep_until(abort_at), if abort_at.is_some() => {
                    debug!("grace period over, abandoning in-flight calls");
                    workers.abort_all();
                    abort_at = None;
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "virtual user panicked");
                }
            }
        }

        let elapsed = started.elapsed();
        info!(samples = samples.len(), elapsed_ms = elapsed.as_millis() as u64, cancelled, "load finished");
        Ok(DriverRun { samples, cancelled, elapsed })
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct VirtualUser {
    id: usize,
    executor: Arc<RequestExecutor>,
    workload: Arc<WorkloadMix>,
    requests: Option<usize>,
    think_time: ThinkTime,
    start_after: Duration,
    stop_at: Option<Instant>,
    rng: StdRng,
}

impl VirtualUser {
    /// Issue calls until the request budget, `stop_at` or cancellation ends the
    /// session. Cancellation is only observed between calls.
    async fn run(
        mut self,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<Sample>,
    ) -> usize {
        if !self.start_after.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.start_after) => {}
                _ = cancel.cancelled() => return 0,
            }
        }

        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return 0,
            },
            _ = cancel.cancelled() => return 0,
        };

        let mut issued = 0;
        loop {
            if cancel.is_cancelled() || self.budget_spent(issued) {
                break;
            }

            let endpoint = self.workload.sample(&mut self.rng);
            let sample = self.executor.execute(endpoint).await;
            issued += 1;
            if tx.send(sample).is_err() {
                break;
            }

            if self.budget_spent(issued) {
                break;
            }
            let pause = self.think_time.pick(&mut self.rng);
            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }

        debug!(user = self.id, issued, "virtual user done");
        issued
    }

    fn budget_spent(&self, issued: usize) -> bool {
        self.requests.is_some_and(|limit| issued >= limit)
            || self.stop_at.is_some_and(|at| Instant::now() >= at)
    }
}
