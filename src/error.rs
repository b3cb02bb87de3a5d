use thiserror::Error;

/// Failures surfaced by the engine. None of them are fatal: the scheduler logs
/// them and retries the cycle after a backoff.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("rejected {field} sample {value} for peer {peer_id}")]
    InvalidMetric {
        peer_id: String,
        field: &'static str,
        value: f64,
    },
    #[error("resource sampler returned a non-finite {field}: {value}")]
    MalformedSample { field: &'static str, value: f64 },
    #[error("classifier failed: {0}")]
    Classifier(String),
    #[error("{cycle} cycle panicked: {message}")]
    CyclePanicked { cycle: &'static str, message: String },
}

pub type Result<T, E = GuardError> = std::result::Result<T, E>;
