//! Orchestration error taxonomy.
//!
//! Every failure class the orchestration core can observe. Most of these are
//! recovered where they occur: pipeline faults degrade the ensemble, cache
//! corruption becomes a miss, and insufficient data or lock timeouts surface
//! as [`SubmitOutcome`](crate::state::SubmitOutcome) states.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{Fingerprint, PipelineError, PipelineId};

/// High-level error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A pipeline did not settle within its own timeout or the request ceiling.
    PipelineTimeout,
    /// A pipeline reported or raised an internal fault.
    PipelineFailure,
    /// No pipeline survived to contribute an opinion.
    InsufficientData,
    /// A cache entry failed its integrity check.
    CacheCorruption,
    /// Waiting on another caller's in-flight computation exceeded the ceiling.
    LockTimeout,
}

impl ErrorKind {
    /// Whether the request path absorbs this error without surfacing it.
    pub fn is_recovered_locally(self) -> bool {
        matches!(
            self,
            Self::PipelineTimeout | Self::PipelineFailure | Self::CacheCorruption
        )
    }

    /// Suggested action for this error kind.
    pub fn suggested_action(self) -> &'static str {
        match self {
            Self::PipelineTimeout => "check pipeline latency or raise its timeout",
            Self::PipelineFailure => "inspect the pipeline's own logs",
            Self::InsufficientData => "retry later or resubmit with a better capture",
            Self::CacheCorruption => "entry dropped, next submit recomputes",
            Self::LockTimeout => "retry; the in-flight computation may still complete",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PipelineTimeout => write!(f, "pipeline_timeout"),
            Self::PipelineFailure => write!(f, "pipeline_failure"),
            Self::InsufficientData => write!(f, "insufficient_data"),
            Self::CacheCorruption => write!(f, "cache_corruption"),
            Self::LockTimeout => write!(f, "lock_timeout"),
        }
    }
}

/// Error type for orchestration operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestrationError {
    #[error("Pipeline {pipeline} timed out after {timeout_ms}ms")]
    PipelineTimeout { pipeline: PipelineId, timeout_ms: u64 },

    #[error("Pipeline {pipeline} failed: {message}")]
    PipelineFailure { pipeline: PipelineId, message: String },

    #[error("Insufficient data for {0}: no pipeline produced a usable result")]
    InsufficientData(Fingerprint),

    #[error("Corrupted cache entry for {fingerprint}: {reason}")]
    CacheCorruption {
        fingerprint: Fingerprint,
        reason: String,
    },

    #[error("Timed out after {waited_ms}ms waiting on in-flight computation for {fingerprint}")]
    LockTimeout {
        fingerprint: Fingerprint,
        waited_ms: u64,
    },
}

impl OrchestrationError {
    /// Lift a pipeline-level error into the orchestration taxonomy
    pub fn from_pipeline(pipeline: PipelineId, error: &PipelineError) -> Self {
        match error {
            PipelineError::Timeout { timeout_ms } => Self::PipelineTimeout {
                pipeline,
                timeout_ms: *timeout_ms,
            },
            PipelineError::Failure { message } => Self::PipelineFailure {
                pipeline,
                message: message.clone(),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PipelineTimeout { .. } => ErrorKind::PipelineTimeout,
            Self::PipelineFailure { .. } => ErrorKind::PipelineFailure,
            Self::InsufficientData(_) => ErrorKind::InsufficientData,
            Self::CacheCorruption { .. } => ErrorKind::CacheCorruption,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
        }
    }
}

/// Result type for orchestration operations
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
