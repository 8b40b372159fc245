use loadprobe_common::{AggregateStats, LoadPhaseResult, LoadProbeError, Result, ScenarioResult, ScenarioStatus};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

/// Print the console summary of `result` to stdout.
pub fn print_report(result: &ScenarioResult) {
    print!("{}", render(result));
}

/// The console summary as text.
pub fn render(result: &ScenarioResult) -> String {
    let mut out = String::new();
    let title = format!("LoadProbe Results: {}", result.name);
    // Writing into a String cannot fail.
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{}", "=".repeat(title.chars().count()));
    let _ = writeln!(out, "Status:                {}", status_line(&result.status));
    let _ = writeln!(out, "Elapsed:               {:.1} s", result.elapsed.as_secs_f64());
    let _ = writeln!(out, "Phases run:            {}", result.phases.len());

    for phase in &result.phases {
        let _ = writeln!(out);
        render_phase(&mut out, phase);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Overall");
    let _ = writeln!(out, "-------");
    render_stats(&mut out, &result.overall);

    if !result.violations.is_empty() {
        let _ = writeln!(out);
        for violation in &result.violations {
            let _ = writeln!(out, "VIOLATION {violation}");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Result: {}", if result.passed { "PASS" } else { "FAIL" });
    out
}

fn render_phase(out: &mut String, phase: &LoadPhaseResult) {
    let mark = if phase.sla_passed { "✓" } else { "✗" };
    let _ = writeln!(out, "Phase {}  {}", phase.phase_name, mark);
    let _ = writeln!(out, "{}", "-".repeat(phase.phase_name.chars().count() + 9));
    render_stats(out, &phase.stats);
    let _ = writeln!(out, "Throughput:            {:.1} rps", phase.throughput);
    let _ = writeln!(out, "Duration:              {:.1} s", phase.duration_elapsed.as_secs_f64());
    if phase.cancelled {
        let _ = writeln!(out, "Cancelled:             deadline elapsed before all users finished");
    }

    if phase.endpoints.len() > 1 {
        for (id, stats) in &phase.endpoints {
            let _ = writeln!(
                out,
                "  {:<30} {:>7} calls  {:>6.2}%  mean {:>8.1} ms  p95 {:>8.1} ms",
                id,
                format_thousands(stats.count),
                stats.success_rate,
                ms(stats.mean),
                ms(stats.p95),
            );
        }
    }

    for (id, report) in &phase.drift {
        let _ = writeln!(out, "Drift {id}: {:?}, {}", report.verdict, report.detail);
    }
    for violation in &phase.violations {
        let _ = writeln!(out, "VIOLATION {violation}");
    }
}

fn render_stats(out: &mut String, stats: &AggregateStats) {
    let _ = writeln!(
        out,
        "Requests:              {}  ({} succeeded)",
        format_thousands(stats.count),
        format_thousands(stats.success_count)
    );
    let _ = writeln!(out, "Success rate:          {:.2}%", stats.success_rate);
    let _ = writeln!(
        out,
        "Latency (ms):          mean {:.1}  median {:.1}  p95 {:.1}  p99 {:.1}  max {:.1}",
        ms(stats.mean),
        ms(stats.median),
        ms(stats.p95),
        ms(stats.p99),
        ms(stats.max),
    );
}

fn status_line(status: &ScenarioStatus) -> String {
    match status {
        ScenarioStatus::Completed => "completed".to_string(),
        ScenarioStatus::Aborted { phase } => format!("aborted after phase {phase:?}"),
        ScenarioStatus::TargetUnreachable => "target unreachable".to_string(),
    }
}

/// Write `result` as pretty-printed JSON to `path`.
pub fn write_json(path: &Path, result: &ScenarioResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| LoadProbeError::Serialization(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read a scenario result previously written by [`write_json`].
pub fn read_json(path: &Path) -> Result<ScenarioResult> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| LoadProbeError::Serialization(e.to_string()))
}

pub fn format_thousands(n: u64) -> String {
    if n >= 1_000_000 {
        format!("~{}M", n / 1_000_000)
    } else if n >= 1_000 {
        format!("~{}K", n / 1_000)
    } else {
        n.to_string()
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
