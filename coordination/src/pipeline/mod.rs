//! Pipeline adapters
//!
//! An analysis pipeline (recognition, authenticity, grading, price
//! prediction, centering) is an opaque collaborator implementing
//! [`AnalysisPipeline`]. [`PipelineAdapter`] wraps one behind a uniform
//! contract: `invoke` always returns a [`PipelineResult`], turning faults,
//! panics and timeouts into a failed result with zeroed score and
//! confidence.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::state::{Payload, PipelineError, PipelineId, PipelineKind, PipelineResult};

pub use http::HttpPipeline;

/// Fault raised inside a pipeline implementation
#[derive(Debug, Error)]
pub enum PipelineFault {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("{0}")]
    Internal(String),
}

/// What a pipeline reports on success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl PipelineOutput {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self {
            score,
            confidence,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Trait for analysis pipelines (the collaborators behind each adapter)
#[async_trait]
pub trait AnalysisPipeline: Send + Sync {
    /// Evaluate the payload. Identical payloads may yield different opinions.
    async fn analyze(&self, payload: &serde_json::Value) -> Result<PipelineOutput, PipelineFault>;
}

/// Supplies a pipeline's historical-accuracy multiplier
pub trait AccuracyFactorProvider: Send + Sync {
    fn accuracy_factor(&self) -> f64;
}

/// Constant accuracy multiplier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedAccuracy(pub f64);

impl AccuracyFactorProvider for FixedAccuracy {
    fn accuracy_factor(&self) -> f64 {
        self.0
    }
}

/// Identity and limits a pipeline is registered with
#[derive(Clone)]
pub struct PipelineRegistration {
    pub id: PipelineId,
    pub kind: PipelineKind,
    pub timeout: Duration,
    /// Absent means a factor of 1.0
    pub accuracy: Option<Arc<dyn AccuracyFactorProvider>>,
}

impl PipelineRegistration {
    pub fn new(id: impl Into<PipelineId>, kind: PipelineKind, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            kind,
            timeout,
            accuracy: None,
        }
    }

    pub fn with_accuracy(mut self, provider: Arc<dyn AccuracyFactorProvider>) -> Self {
        self.accuracy = Some(provider);
        self
    }

    pub fn accuracy_factor(&self) -> f64 {
        self.accuracy
            .as_ref()
            .map(|p| p.accuracy_factor())
            .unwrap_or(1.0)
    }
}

impl std::fmt::Debug for PipelineRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistration")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("accuracy", &self.accuracy_factor())
            .finish()
    }
}

/// Uniform wrapper around one analysis pipeline
pub struct PipelineAdapter {
    registration: PipelineRegistration,
    pipeline: Arc<dyn AnalysisPipeline>,
}

/// Shared reference to a PipelineAdapter
pub type SharedPipelineAdapter = Arc<PipelineAdapter>;

impl PipelineAdapter {
    pub fn new(registration: PipelineRegistration, pipeline: Arc<dyn AnalysisPipeline>) -> Self {
        Self {
            registration,
            pipeline,
        }
    }

    /// Create a shared reference to this adapter
    pub fn shared(self) -> SharedPipelineAdapter {
        Arc::new(self)
    }

    pub fn id(&self) -> &PipelineId {
        &self.registration.id
    }

    pub fn kind(&self) -> PipelineKind {
        self.registration.kind
    }

    pub fn timeout(&self) -> Duration {
        self.registration.timeout
    }

    pub fn registration(&self) -> &PipelineRegistration {
        &self.registration
    }

    /// Run the pipeline under `timeout`. Never fails: every fault becomes a
    /// failed [`PipelineResult`].
    pub async fn invoke(&self, payload: &Payload, timeout: Duration) -> PipelineResult {
        let id = self.registration.id.clone();
        let kind = self.registration.kind;
        let start = Instant::now();

        let call = std::panic::AssertUnwindSafe(self.pipeline.analyze(payload)).catch_unwind();
        let outcome = tokio::time::timeout(timeout, call).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(Ok(output))) => {
                if !output.score.is_finite() || !output.confidence.is_finite() {
                    warn!(pipeline = %id, "Pipeline returned non-finite opinion");
                    PipelineResult::failed(
                        id.clone(),
                        kind,
                        PipelineError::failure("non-finite score or confidence"),
                        latency_ms,
                    )
                } else {
                    PipelineResult::success(
                        id.clone(),
                        kind,
                        output.score,
                        output.confidence,
                        output.detail,
                        latency_ms,
                    )
                }
            }
            Ok(Ok(Err(fault))) => {
                warn!(pipeline = %id, latency_ms, "Pipeline fault: {}", fault);
                PipelineResult::failed(
                    id.clone(),
                    kind,
                    PipelineError::failure(fault.to_string()),
                    latency_ms,
                )
            }
            Ok(Err(_panic)) => {
                warn!(pipeline = %id, latency_ms, "Pipeline panicked");
                PipelineResult::failed(
                    id.clone(),
                    kind,
                    PipelineError::failure("pipeline panicked"),
                    latency_ms,
                )
            }
            Err(_elapsed) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(pipeline = %id, timeout_ms, "Pipeline timed out");
                PipelineResult::failed(
                    id.clone(),
                    kind,
                    PipelineError::Timeout { timeout_ms },
                    latency_ms,
                )
            }
        };

        debug!(
            pipeline = %id,
            latency_ms,
            success = result.is_success(),
            score = result.score,
            confidence = result.confidence,
            "Pipeline invocation settled"
        );

        result.with_accuracy_factor(self.registration.accuracy_factor())
    }
}

impl std::fmt::Debug for PipelineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineAdapter")
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}
