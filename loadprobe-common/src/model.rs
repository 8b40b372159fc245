use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::{duration_ms, LoadProbeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

/// One call target: a method and a path relative to the base address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path: String,
    /// Extra status codes that count as success (e.g. 404 for an optional page).
    #[serde(default)]
    pub accept: Vec<u16>,
}

impl Endpoint {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Result<Self> {
        let endpoint = Endpoint { method, path: path.into(), accept: Vec::new() };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Shorthand for `Endpoint::new(HttpMethod::Get, path)`.
    pub fn get(path: impl Into<String>) -> Result<Self> {
        Self::new(HttpMethod::Get, path)
    }

    pub fn accepting(mut self, statuses: &[u16]) -> Self {
        self.accept.extend_from_slice(statuses);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(LoadProbeError::InvalidConfig(format!(
                "endpoint path must start with '/', got {:?}",
                self.path
            )));
        }
        if self.path.chars().any(char::is_whitespace) {
            return Err(LoadProbeError::InvalidConfig(format!(
                "endpoint path must not contain whitespace, got {:?}",
                self.path
            )));
        }
        Ok(())
    }

    /// Identifier used to key samples and stats, e.g. `GET /products`.
    pub fn id(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }

    /// 2xx and 3xx are successes, plus anything listed in `accept`.
    pub fn is_success_status(&self, status: u16) -> bool {
        (200..400).contains(&status) || self.accept.contains(&status)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.as_str(), self.path)
    }
}

/// One observed logical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub endpoint: String,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    /// 0 when no HTTP status was received.
    pub status_code: u16,
    pub success: bool,
    /// Strictly increasing per endpoint; the canonical order for drift analysis.
    pub sequence_number: u64,
    pub timestamp: SystemTime,
    /// Attempts spent on this call, retries included.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub count: u64,
    pub success_count: u64,
    /// Percentage in `[0, 100]`; 0 for an empty set.
    pub success_rate: f64,
    #[serde(with = "duration_ms")]
    pub mean: Duration,
    #[serde(with = "duration_ms")]
    pub min: Duration,
    #[serde(with = "duration_ms")]
    pub max: Duration,
    #[serde(with = "duration_ms")]
    pub median: Duration,
    #[serde(with = "duration_ms")]
    pub p95: Duration,
    #[serde(with = "duration_ms")]
    pub p99: Duration,
}

impl AggregateStats {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Service-level limits. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sla {
    #[serde(default, with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub max_mean_latency: Option<Duration>,
    #[serde(default, with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub max_p95_latency: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_success_rate: Option<f64>,
}

impl Sla {
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.min_success_rate {
            if !(0.0..=100.0).contains(&rate) {
                return Err(LoadProbeError::InvalidConfig(format!(
                    "min_success_rate must be within [0, 100], got {rate}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_unset(&self) -> bool {
        self.max_mean_latency.is_none()
            && self.max_p95_latency.is_none()
            && self.min_success_rate.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftVerdict {
    InsufficientData,
    Stable,
    Degraded,
}

/// Early-window vs late-window latency comparison for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub verdict: DriftVerdict,
    pub samples: usize,
    #[serde(with = "duration_ms")]
    pub early_mean: Duration,
    #[serde(with = "duration_ms")]
    pub late_mean: Duration,
    pub detail: String,
}

impl DriftReport {
    pub fn drift_detected(&self) -> bool {
        self.verdict == DriftVerdict::Degraded
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPhaseResult {
    pub phase_name: String,
    pub stats: AggregateStats,
    /// Per-endpoint breakdown, keyed by [`Endpoint::id`].
    pub endpoints: BTreeMap<String, AggregateStats>,
    pub sla_passed: bool,
    pub violations: Vec<String>,
    #[serde(with = "duration_ms")]
    pub duration_elapsed: Duration,
    /// Completed calls per second.
    pub throughput: f64,
    /// Drift findings per endpoint; empty unless the phase is long-running.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub drift: BTreeMap<String, DriftReport>,
    /// The phase deadline elapsed before every worker finished.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioStatus {
    /// Every phase ran.
    Completed,
    /// A phase configured as scenario-fatal failed; later phases were skipped.
    Aborted { phase: String },
    /// The liveness precheck failed; no phase ran.
    TargetUnreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub status: ScenarioStatus,
    pub phases: Vec<LoadPhaseResult>,
    pub passed: bool,
    /// Scenario-level findings that belong to no phase (connectivity, aborts).
    pub violations: Vec<String>,
    /// Statistics over every sample recorded during the run.
    pub overall: AggregateStats,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}
