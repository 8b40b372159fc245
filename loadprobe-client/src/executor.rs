use loadprobe_common::{
    duration_ms, Endpoint, LoadProbeError, Result, Sample, TransportError, RETRYABLE_STATUSES,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::debug;

use crate::{HttpTransport, Transport};

/// Exponential backoff without jitter: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(LoadProbeError::InvalidConfig(format!(
                "retry max_delay ({:?}) is shorter than base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on a single attempt.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), retry: RetryPolicy::default() }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(LoadProbeError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Issues logical calls against the target, one [`Sample`] per call.
///
/// Call failures never surface as errors: they are retried according to the
/// [`RetryPolicy`] and then recorded as a failed sample.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    config: ExecutorConfig,
    /// Next sequence number per endpoint id.
    sequences: Mutex<HashMap<String, u64>>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { transport, config, sequences: Mutex::new(HashMap::new()) })
    }

    /// Executor over [`HttpTransport`] aimed at `base_url`.
    pub fn http(base_url: &str, config: ExecutorConfig) -> Result<Self> {
        Self::new(Arc::new(HttpTransport::new(base_url)?), config)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Perform one logical call, retrying transient failures.
    ///
    /// `latency` spans first dispatch to final outcome, backoff included.
    pub async fn execute(&self, endpoint: &Endpoint) -> Sample {
        let started = Instant::now();
        let retry = &self.config.retry;
        let mut attempt: u32 = 0;

        let outcome = loop {
            let result = self.attempt(endpoint).await;
            let retryable = match &result {
                Ok(status) => {
                    !endpoint.is_success_status(*status) && RETRYABLE_STATUSES.contains(status)
                }
                Err(e) => e.is_retryable(),
            };
            if !retryable || attempt >= retry.max_retries {
                break result;
            }

            let delay = retry.delay_for(attempt);
            debug!(
                endpoint = %endpoint,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                outcome = ?result,
                "retrying transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        let latency = started.elapsed();
        let (status_code, success, error) = match outcome {
            Ok(status) => (status, endpoint.is_success_status(status), None),
            Err(e) => (0, false, Some(e.to_string())),
        };

        let endpoint_id = endpoint.id();
        let sequence_number = self.next_sequence(&endpoint_id);
        Sample {
            endpoint: endpoint_id,
            latency,
            status_code,
            success,
            sequence_number,
            timestamp: SystemTime::now(),
            attempts: attempt + 1,
            error,
        }
    }

    /// One attempt with no retries and no sample, for liveness checks.
    pub async fn probe(&self, endpoint: &Endpoint) -> std::result::Result<u16, TransportError> {
        self.attempt(endpoint).await
    }

    async fn attempt(&self, endpoint: &Endpoint) -> std::result::Result<u16, TransportError> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.transport.call(endpoint, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }

    fn next_sequence(&self, endpoint_id: &str) -> u64 {
        // Counters are never left half-updated, so a poisoned lock is still usable.
        let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
        let next = sequences.entry(endpoint_id.to_string()).or_insert(0);
        let current = *next;
        *next += 1;
        current
    }
}
