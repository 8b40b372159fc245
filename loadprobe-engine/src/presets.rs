use loadprobe_common::{Endpoint, Result, Sla};
use std::time::Duration;

use crate::drift::DriftConfig;
use crate::driver::{LoadPlan, ThinkTime};
use crate::scenario::{PhaseConfig, ScenarioConfig};
use crate::workload::WorkloadMix;

/// Built-in scenarios the `loadprobe` binary can run.
///
/// | Scenario | Phases                                                    |
/// |----------|-----------------------------------------------------------|
/// | Quick    | homepage, product listing                                 |
/// | Full     | five page checks, two concurrent phases, soak             |
/// | Stress   | 20-user homepage burst overlapped by a weighted browse mix |
/// | Custom   | one phase built from command-line flags                   |
///
/// Concurrent phases ramp up: 2 users/s in `Full`, 5 users/s in `Stress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    Quick,
    Full,
    Stress,
    Custom,
}

impl ScenarioKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "quick" => Some(ScenarioKind::Quick),
            "full" => Some(ScenarioKind::Full),
            "stress" => Some(ScenarioKind::Stress),
            "custom" => Some(ScenarioKind::Custom),
            _ => None,
        }
    }

    pub fn as_name(&self) -> &'static str {
        match self {
            ScenarioKind::Quick => "quick",
            ScenarioKind::Full => "full",
            ScenarioKind::Stress => "stress",
            ScenarioKind::Custom => "custom",
        }
    }

    pub fn build(&self, custom: &CustomOptions) -> Result<ScenarioConfig> {
        let config = match self {
            ScenarioKind::Quick => quick()?,
            ScenarioKind::Full => full()?,
            ScenarioKind::Stress => stress()?,
            ScenarioKind::Custom => custom.build()?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Knobs for [`ScenarioKind::Custom`].
#[derive(Debug, Clone, PartialEq)]
pub struct CustomOptions {
    pub path: String,
    pub users: usize,
    /// Calls per user; ignored when `duration` is set.
    pub requests: usize,
    /// Run for this long instead of a fixed number of calls.
    pub duration: Option<Duration>,
    pub think_time: ThinkTime,
    /// Users started per second; all at once when unset.
    pub spawn_rate: Option<f64>,
    pub sla: Sla,
}

impl Default for CustomOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            users: 10,
            requests: 10,
            duration: None,
            think_time: ThinkTime::none(),
            spawn_rate: None,
            sla: Sla::default(),
        }
    }
}

impl CustomOptions {
    pub fn build(&self) -> Result<ScenarioConfig> {
        let workload = WorkloadMix::single(Endpoint::get(self.path.as_str())?);
        let mut plan = match self.duration {
            Some(run_for) => LoadPlan::timed(workload, self.users, run_for),
            None => LoadPlan::new(workload, self.users, self.requests),
        }
        .with_think_time(self.think_time);
        plan.spawn_rate = self.spawn_rate;
        Ok(ScenarioConfig::new(
            "custom",
            vec![PhaseConfig::new("custom", plan).with_sla(self.sla.clone())],
        ))
    }
}

fn mean_under(limit: Duration) -> Sla {
    Sla { max_mean_latency: Some(limit), ..Sla::default() }
}

fn page_check(name: &str, endpoint: Endpoint, limit: Duration) -> PhaseConfig {
    PhaseConfig::new(name, LoadPlan::new(WorkloadMix::single(endpoint), 1, 5))
        .with_sla(mean_under(limit))
}

/// Smoke test: the homepage and the product listing, one user each.
pub fn quick() -> Result<ScenarioConfig> {
    Ok(ScenarioConfig::new(
        "quick",
        vec![
            page_check("homepage", Endpoint::get("/")?, Duration::from_secs(1)),
            page_check("products", Endpoint::get("/products")?, Duration::from_secs(2)),
        ],
    ))
}

/// Page checks, then concurrent load, then a soak phase watched for drift.
pub fn full() -> Result<ScenarioConfig> {
    let home = Endpoint::get("/")?;
    let products = Endpoint::get("/products")?;

    let concurrent_homepage = PhaseConfig::new(
        "concurrent_homepage",
        LoadPlan::new(WorkloadMix::single(home.clone()), 10, 5).with_spawn_rate(2.0),
    )
    .with_sla(Sla {
        max_mean_latency: Some(Duration::from_secs(3)),
        max_p95_latency: Some(Duration::from_secs(5)),
        min_success_rate: Some(95.0),
    });
    let concurrent_products = PhaseConfig::new(
        "concurrent_products",
        LoadPlan::new(WorkloadMix::single(products.clone()), 10, 5).with_spawn_rate(2.0),
    )
    .with_sla(Sla {
        max_mean_latency: Some(Duration::from_secs(4)),
        min_success_rate: Some(90.0),
        ..Sla::default()
    });
    let soak = PhaseConfig::new(
        "soak",
        LoadPlan::new(WorkloadMix::single(home.clone()), 1, 50)
            .with_think_time(ThinkTime::fixed(Duration::from_millis(100))),
    )
    .with_sla(Sla { min_success_rate: Some(100.0), ..Sla::default() })
    .long_running(DriftConfig { fail_on_drift: true, ..DriftConfig::default() });

    Ok(ScenarioConfig::new(
        "full",
        vec![
            page_check("homepage", home, Duration::from_secs(1)),
            page_check("products", products, Duration::from_secs(2)),
            page_check(
                "product_detail",
                Endpoint::get("/products/1")?.accepting(&[404]),
                Duration::from_millis(1500),
            ),
            page_check("login", Endpoint::get("/login")?, Duration::from_secs(2)),
            page_check("search", Endpoint::get("/products?search=test")?, Duration::from_secs(3)),
            concurrent_homepage,
            concurrent_products,
            soak,
        ],
    ))
}

/// A homepage burst with a browsing crowd arriving one second in.
pub fn stress() -> Result<ScenarioConfig> {
    let home = Endpoint::get("/")?;

    let burst = PhaseConfig::new(
        "stress_homepage",
        LoadPlan::new(WorkloadMix::single(home.clone()), 20, 10)
            .with_think_time(ThinkTime::fixed(Duration::from_millis(100)))
            .with_spawn_rate(5.0),
    )
    .with_sla(Sla {
        max_mean_latency: Some(Duration::from_secs(10)),
        min_success_rate: Some(80.0),
        ..Sla::default()
    });

    let mix = WorkloadMix::weighted(vec![
        (home, 10),
        (Endpoint::get("/products")?, 8),
        (Endpoint::get("/products/1")?.accepting(&[404]), 6),
        (Endpoint::get("/products?search=test")?, 4),
    ])?;
    let browse = PhaseConfig::new(
        "browse_mix",
        LoadPlan::new(mix, 20, 10)
            .with_think_time(ThinkTime::between(Duration::from_millis(100), Duration::from_millis(500)))
            .with_spawn_rate(5.0),
    )
    .with_sla(Sla {
        max_p95_latency: Some(Duration::from_secs(3)),
        min_success_rate: Some(80.0),
        ..Sla::default()
    })
    .overlapping(Duration::from_secs(1));

    Ok(ScenarioConfig::new("stress", vec![burst, browse]))
}
