use std::time;

use pipeline_common::source::SourceError;
use thiserror::Error;

/// Metadata attached to a message when it is routed to an error path.
pub const ERROR_STAGE_KEY: &str = "error_stage";
pub const ERROR_REASON_KEY: &str = "error_reason";
pub const ERROR_KIND_KEY: &str = "error_kind";
pub const ERROR_TIMESTAMP_KEY: &str = "error_timestamp";

/// Why a message could not continue through its pipeline.
///
/// Every variant is routed through the stage's error path: the enclosing
/// TryCatch, the error output, or a rejection at the source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("transform failed: {0}")]
    TransformError(String),
    #[error("field {field} failed validation: {reason}")]
    SchemaValidationError { field: String, reason: String },
    #[error("rate limit exceeded, no capacity after waiting {}ms", .waited.as_millis())]
    RateLimitExceeded { waited: time::Duration },
    #[error("dedupe cache unavailable: {0}")]
    DedupeCacheError(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl ProcessingError {
    /// Stable name used in metadata and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::TransformError(_) => "transform_error",
            ProcessingError::SchemaValidationError { .. } => "schema_validation_error",
            ProcessingError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ProcessingError::DedupeCacheError(_) => "dedupe_cache_error",
            ProcessingError::DeliveryFailed(_) => "delivery_failed",
            ProcessingError::ShutdownInProgress => "shutdown_in_progress",
        }
    }
}

/// A pipeline definition that cannot be compiled. `stage` is the path of the
/// offending stage, e.g. `pipeline/2:try_catch/try/0:broker`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{stage}: {reason}")]
    InvalidParameter { stage: String, reason: String },
    #[error("{stage}: a broker must be the last stage of its pipeline")]
    BrokerNotTerminal { stage: String },
    #[error("{stage}: a broker needs at least one output")]
    NoOutputs { stage: String },
    #[error("{stage}: a quorum of {required} cannot be met by {outputs} outputs")]
    UnsatisfiableQuorum {
        stage: String,
        required: usize,
        outputs: usize,
    },
    #[error("invalid engine setting: {0}")]
    InvalidSetting(String),
}

/// Errors that stop an engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid pipeline: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("source failed: {0}")]
    SourceError(#[from] SourceError),
    #[error("engine stopped after a fatal error: {0}")]
    FatalError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_messages() {
        let error = ProcessingError::SchemaValidationError {
            field: "timestamp".to_owned(),
            reason: "missing".to_owned(),
        };
        assert_eq!(error.kind(), "schema_validation_error");
        assert_eq!(error.to_string(), "field timestamp failed validation: missing");

        let error = ProcessingError::RateLimitExceeded {
            waited: time::Duration::from_millis(250),
        };
        assert_eq!(
            error.to_string(),
            "rate limit exceeded, no capacity after waiting 250ms"
        );
    }
}
