//! Error taxonomy for the pipeline
//!
//! Every fallible operation in the core maps onto one of these kinds, which
//! in turn decides how the caller reacts: validation failures are returned to
//! the HTTP caller, transient I/O is retried with bounded backoff, permanent
//! I/O is fatal to the owning component, integrity failures are skipped, and
//! model failures skip the bucket under scoring.

use thiserror::Error;

use crate::schemas::events::MAX_SERVICE_LEN;

/// Event-scoped rejection, surfaced to the HTTP caller as a 400.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("service name is {0} characters, limit is {MAX_SERVICE_LEN}")]
    ServiceTooLong(usize),

    #[error("unknown level: {0}")]
    UnknownLevel(String),

    #[error("metadata must be a JSON object")]
    MetadataNotObject,

    #[error("batch must contain between 1 and 1000 events, got {0}")]
    BatchSizeOutOfRange(usize),
}

/// Pipeline-wide error kinds (spec'd taxonomy beyond validation).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Log broker unavailable, DB deadlock, pool timeout. Retried with
    /// bounded backoff; surfaced as 503 on the ingestion surface.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Auth failure, schema mismatch, unknown artifact version. Fatal to the
    /// owning component.
    #[error("permanent I/O failure: {0}")]
    PermanentIo(String),

    /// Row rejected by a store constraint. Logged and skipped when the row is
    /// provably bad.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Model inference failure. The bucket under scoring is skipped.
    #[error("model error: {0}")]
    Model(String),
}

impl PipelineError {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientIo(_))
    }
}
