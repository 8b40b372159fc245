use loadprobe_common::{duration_ms, DriftReport, DriftVerdict, LoadProbeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Below this many samples a verdict would be noise.
pub const MIN_DRIFT_SAMPLES: usize = 10;

/// Settings for a long-running phase's degradation check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    /// Samples per window; `None` compares the first and last quarters.
    #[serde(default)]
    pub window_size: Option<usize>,
    /// Drift when `late_mean > early_mean * degradation_ratio`.
    pub degradation_ratio: f64,
    /// Turn a drift finding into a phase violation.
    #[serde(default)]
    pub fail_on_drift: bool,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self { window_size: None, degradation_ratio: 1.5, fail_on_drift: false }
    }
}

impl DriftConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.degradation_ratio.is_finite() || self.degradation_ratio <= 0.0 {
            return Err(LoadProbeError::InvalidConfig(format!(
                "degradation_ratio must be a positive number, got {}",
                self.degradation_ratio
            )));
        }
        if self.window_size == Some(0) {
            return Err(LoadProbeError::InvalidConfig(
                "drift window_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn detect(&self, ordered: &[Duration]) -> DriftReport {
        detect(ordered, self.window_size, self.degradation_ratio)
    }
}

/// Compare the mean of the early window of `ordered` against the late window.
///
/// `ordered` must be in sequence order. When it is shorter than two full windows
/// the halves are compared instead.
pub fn detect(ordered: &[Duration], window_size: Option<usize>, degradation_ratio: f64) -> DriftReport {
    let n = ordered.len();
    if n < MIN_DRIFT_SAMPLES {
        return DriftReport {
            verdict: DriftVerdict::InsufficientData,
            samples: n,
            early_mean: Duration::ZERO,
            late_mean: Duration::ZERO,
            detail: format!("insufficient data: {n} samples, need at least {MIN_DRIFT_SAMPLES}"),
        };
    }

    let requested = window_size.unwrap_or(n / 4);
    let window = if requested == 0 || n < requested.saturating_mul(2) { n / 2 } else { requested };

    let early_mean = mean(&ordered[..window]);
    let late_mean = mean(&ordered[n - window..]);
    let early_ms = early_mean.as_secs_f64() * 1000.0;
    let late_ms = late_mean.as_secs_f64() * 1000.0;

    let degraded = late_ms > early_ms * degradation_ratio;
    let change = if early_ms > 0.0 { (late_ms / early_ms - 1.0) * 100.0 } else { 0.0 };
    let detail = format!(
        "early {window} mean {early_ms:.1}ms, late {window} mean {late_ms:.1}ms ({change:+.1}%, limit x{degradation_ratio})"
    );

    DriftReport {
        verdict: if degraded { DriftVerdict::Degraded } else { DriftVerdict::Stable },
        samples: n,
        early_mean,
        late_mean,
        detail,
    }
}

fn mean(window: &[Duration]) -> Duration {
    let total: u128 = window.iter().map(Duration::as_nanos).sum();
    let nanos = total / window.len().max(1) as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
