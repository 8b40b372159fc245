use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod duration_ms;
pub mod model;

pub use model::{
    AggregateStats, DriftReport, DriftVerdict, Endpoint, HttpMethod, LoadPhaseResult, Sample,
    ScenarioResult, ScenarioStatus, Sla,
};

/// Fatal errors: anything that stops a run before or instead of producing results.
///
/// Per-call failures are never reported through this type; they end up as failed
/// [`Sample`]s.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadProbeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for LoadProbeError {
    fn from(e: std::io::Error) -> Self {
        LoadProbeError::Io(e.to_string())
    }
}

/// Why a single attempt against the target produced no HTTP status.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Refused and reset connections are worth another attempt; a timeout already
    /// spent the whole budget and a malformed response will not fix itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Reset(_))
    }
}

/// Status codes the executor retries: throttling and gateway/availability errors.
pub const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Result type for LoadProbe operations
pub type Result<T> = std::result::Result<T, LoadProbeError>;
