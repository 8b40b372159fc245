use loadprobe_common::{AggregateStats, Sla};
use serde::Serialize;
use std::time::Duration;

/// Outcome of checking one [`AggregateStats`] against one [`Sla`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub passed: bool,
    /// One entry per failed check, in check order: mean, p95, success rate.
    pub violations: Vec<String>,
}

/// Check `stats` against every threshold `sla` sets. Unset thresholds are skipped.
pub fn evaluate(stats: &AggregateStats, sla: &Sla) -> Evaluation {
    let mut violations = Vec::new();

    if let Some(limit) = sla.max_mean_latency {
        if stats.mean > limit {
            violations.push(format!(
                "mean latency {} exceeds limit {}",
                fmt_ms(stats.mean),
                fmt_ms(limit)
            ));
        }
    }

    if let Some(limit) = sla.max_p95_latency {
        if stats.p95 > limit {
            violations.push(format!(
                "p95 latency {} exceeds limit {}",
                fmt_ms(stats.p95),
                fmt_ms(limit)
            ));
        }
    }

    if let Some(floor) = sla.min_success_rate {
        if stats.success_rate < floor {
            violations.push(format!(
                "success rate {:.2}% is below minimum {:.2}% ({} of {} calls succeeded)",
                stats.success_rate, floor, stats.success_count, stats.count
            ));
        }
    }

    Evaluation { passed: violations.is_empty(), violations }
}

/// Like [`evaluate`], with each violation prefixed by the endpoint id.
pub fn evaluate_endpoint(endpoint: &str, stats: &AggregateStats, sla: &Sla) -> Evaluation {
    let Evaluation { passed, violations } = evaluate(stats, sla);
    Evaluation {
        passed,
        violations: violations.into_iter().map(|v| format!("{endpoint}: {v}")).collect(),
    }
}

fn fmt_ms(d: Duration) -> String {
    format!("{:.1}ms", d.as_secs_f64() * 1000.0)
}
