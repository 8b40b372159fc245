use loadprobe_common::{AggregateStats, Sample};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Append-only sample store shared by every worker of a scenario run.
///
/// Cloning is cheap and every clone sees the same samples. Writers append under
/// the write lock; readers copy out under the read lock, so a reader sees a
/// sample entirely or not at all.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    samples: Arc<RwLock<Vec<Sample>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: Sample) {
        self.write().push(sample);
    }

    /// Drop every recorded sample; clones see the cleared store too.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the recorded samples, optionally restricted to one endpoint id.
    pub fn snapshot(&self, endpoint: Option<&str>) -> Vec<Sample> {
        let samples = self.read();
        match endpoint {
            Some(id) => samples.iter().filter(|s| s.endpoint == id).cloned().collect(),
            None => samples.clone(),
        }
    }

    /// Statistics over a snapshot taken atomically at call time.
    pub fn aggregate(&self, endpoint: Option<&str>) -> AggregateStats {
        aggregate_samples(&self.snapshot(endpoint))
    }

    /// Distinct endpoint ids seen so far, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let samples = self.read();
        let ids: BTreeSet<&str> = samples.iter().map(|s| s.endpoint.as_str()).collect();
        ids.into_iter().map(str::to_string).collect()
    }

    /// Latencies for `endpoint` in sequence-number order, ready for drift analysis.
    pub fn ordered_latencies(&self, endpoint: &str) -> Vec<Duration> {
        ordered_latencies(&self.snapshot(Some(endpoint)))
    }

    // Samples are immutable once pushed; a poisoned lock still guards a consistent vector.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Sample>> {
        self.samples.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Sample>> {
        self.samples.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Compute [`AggregateStats`] over `samples`.
///
/// Every sample contributes its latency, failed and timed-out calls included.
pub fn aggregate_samples(samples: &[Sample]) -> AggregateStats {
    if samples.is_empty() {
        return AggregateStats::default();
    }

    let mut latencies: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
    latencies.sort_unstable();

    let count = samples.len() as u64;
    let success_count = samples.iter().filter(|s| s.success).count() as u64;
    let total_nanos: u128 = latencies.iter().map(Duration::as_nanos).sum();
    let mean_nanos = total_nanos / u128::from(count);

    AggregateStats {
        count,
        success_count,
        success_rate: success_count as f64 / count as f64 * 100.0,
        mean: Duration::from_nanos(u64::try_from(mean_nanos).unwrap_or(u64::MAX)),
        min: latencies[0],
        max: latencies[latencies.len() - 1],
        median: percentile(&latencies, 50),
        p95: percentile(&latencies, 95),
        p99: percentile(&latencies, 99),
    }
}

/// Nearest-rank percentile of an ascending slice: the element at
/// `floor(n * pct / 100)`, clamped to the last index. Returns zero for an empty slice.
pub fn percentile(sorted: &[Duration], pct: u32) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = sorted.len() * pct as usize / 100;
    sorted[idx.min(sorted.len() - 1)]
}

/// Latencies of `samples` sorted by sequence number, independent of insertion order.
pub fn ordered_latencies(samples: &[Sample]) -> Vec<Duration> {
    let mut ordered: Vec<(u64, Duration)> =
        samples.iter().map(|s| (s.sequence_number, s.latency)).collect();
    ordered.sort_unstable_by_key(|(seq, _)| *seq);
    ordered.into_iter().map(|(_, latency)| latency).collect()
}
