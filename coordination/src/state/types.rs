//! Core types for card evaluation state
//!
//! These types flow between the execution coordinator, the cross-validator,
//! the consensus engine and the fingerprint cache. Everything handed back to
//! callers is immutable; a refreshed evaluation is a new value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque request payload shared read-only with every pipeline task
pub type Payload = Arc<serde_json::Value>;

/// Content fingerprint used as the cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a caller-supplied fingerprint
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive a fingerprint from the payload and the requested pipeline set.
    ///
    /// The payload is hashed in its canonical JSON form (object keys sorted),
    /// followed by the sorted, length-prefixed pipeline ids.
    pub fn from_payload(payload: &serde_json::Value, requested: &[PipelineId]) -> Self {
        let mut hasher = Sha256::new();

        let canonical = serde_json::to_vec(payload).unwrap_or_default();
        hasher.update((canonical.len() as u64).to_le_bytes());
        hasher.update(&canonical);

        let mut ids: Vec<&str> = requested.iter().map(|p| p.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        hasher.update((ids.len() as u32).to_le_bytes());
        for id in ids {
            hasher.update((id.len() as u32).to_le_bytes());
            hasher.update(id.as_bytes());
        }

        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a registered analysis pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PipelineId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PipelineId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which aspect of the card a pipeline evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Identifies the card (set, number, variant)
    Recognition,
    /// Counterfeit / alteration detection
    Authenticity,
    /// Condition grading
    Grading,
    /// Market price estimate
    PricePrediction,
    /// Print centering measurement
    Centering,
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineKind::Recognition => write!(f, "recognition"),
            PipelineKind::Authenticity => write!(f, "authenticity"),
            PipelineKind::Grading => write!(f, "grading"),
            PipelineKind::PricePrediction => write!(f, "price_prediction"),
            PipelineKind::Centering => write!(f, "centering"),
        }
    }
}

/// A single evaluation request. Immutable once built.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Correlation id for logs and events
    pub request_id: String,
    pub fingerprint: Fingerprint,
    pub payload: Payload,
    /// Empty means every registered pipeline
    pub requested_pipelines: Vec<PipelineId>,
}

impl AnalysisRequest {
    /// Build a request for all registered pipelines, fingerprinted from content
    pub fn new(payload: serde_json::Value) -> Self {
        Self::for_pipelines(payload, Vec::new())
    }

    /// Build a request restricted to the given pipelines
    pub fn for_pipelines(payload: serde_json::Value, requested: Vec<PipelineId>) -> Self {
        let fingerprint = Fingerprint::from_payload(&payload, &requested);
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            fingerprint,
            payload: Arc::new(payload),
            requested_pipelines: requested,
        }
    }

    /// Build a request with a caller-supplied fingerprint
    pub fn with_fingerprint(fingerprint: Fingerprint, payload: serde_json::Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            fingerprint,
            payload: Arc::new(payload),
            requested_pipelines: Vec::new(),
        }
    }

    /// Whether the given pipeline should run for this request
    pub fn wants(&self, id: &PipelineId) -> bool {
        self.requested_pipelines.is_empty() || self.requested_pipelines.contains(id)
    }
}

/// Why a pipeline invocation produced no usable opinion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("pipeline timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("pipeline failed: {message}")]
    Failure { message: String },
}

impl PipelineError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Output of one adapter invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline_id: PipelineId,
    pub kind: PipelineKind,
    /// Opinion in [0, 1]; 0 when `error` is set
    pub score: f64,
    /// Self-reported confidence in [0, 1]; 0 when `error` is set
    pub confidence: f64,
    /// Pipeline-specific detail, passed through untouched
    pub detail: serde_json::Value,
    pub latency_ms: u64,
    /// Historical-accuracy multiplier sampled at invocation time
    pub accuracy_factor: f64,
    pub error: Option<PipelineError>,
}

impl PipelineResult {
    /// A successful result; score and confidence are clamped into [0, 1]
    pub fn success(
        pipeline_id: PipelineId,
        kind: PipelineKind,
        score: f64,
        confidence: f64,
        detail: serde_json::Value,
        latency_ms: u64,
    ) -> Self {
        Self {
            pipeline_id,
            kind,
            score: clamp_unit(score),
            confidence: clamp_unit(confidence),
            detail,
            latency_ms,
            accuracy_factor: 1.0,
            error: None,
        }
    }

    /// A failed result with zeroed opinion
    pub fn failed(
        pipeline_id: PipelineId,
        kind: PipelineKind,
        error: PipelineError,
        latency_ms: u64,
    ) -> Self {
        Self {
            pipeline_id,
            kind,
            score: 0.0,
            confidence: 0.0,
            detail: serde_json::Value::Null,
            latency_ms,
            accuracy_factor: 1.0,
            error: Some(error),
        }
    }

    pub fn with_accuracy_factor(mut self, factor: f64) -> Self {
        self.accuracy_factor = if factor.is_finite() {
            factor.max(0.0)
        } else {
            1.0
        };
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// NaN collapses to 0
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Severity of a cross-validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Major,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::None => write!(f, "none"),
            Severity::Minor => write!(f, "minor"),
            Severity::Major => write!(f, "major"),
        }
    }
}

/// A detected inconsistency between two successful pipeline results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyAnnotation {
    pub pipeline_id_a: PipelineId,
    pub pipeline_id_b: PipelineId,
    pub severity: Severity,
    /// Name of the rule that fired
    pub rule: String,
    pub explanation: String,
}

impl ConsistencyAnnotation {
    pub fn involves(&self, id: &PipelineId) -> bool {
        &self.pipeline_id_a == id || &self.pipeline_id_b == id
    }
}

/// Per-pipeline summary kept on the ensemble result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContribution {
    pub pipeline_id: PipelineId,
    pub kind: PipelineKind,
    pub score: f64,
    pub confidence: f64,
    /// Effective weight after accuracy and annotation adjustments
    pub weight: f64,
    /// Share of the total weight, in [0, 1]
    pub normalized_weight: f64,
}

/// Something a consumer should know before trusting a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Anomaly {
    /// Two pipelines disagree in a way a consistency rule flags
    Inconsistency {
        pipelines: (PipelineId, PipelineId),
        severity: Severity,
        explanation: String,
    },
    /// A pipeline produced no opinion
    PipelineFailed {
        pipeline_id: PipelineId,
        error: PipelineError,
    },
    /// Surviving pipelines are spread widely around the aggregate
    HighDispersion { dispersion: f64 },
}

impl Anomaly {
    pub fn severity(&self) -> Severity {
        match self {
            Anomaly::Inconsistency { severity, .. } => *severity,
            Anomaly::PipelineFailed { .. } | Anomaly::HighDispersion { .. } => Severity::Minor,
        }
    }
}

impl From<&ConsistencyAnnotation> for Anomaly {
    fn from(annotation: &ConsistencyAnnotation) -> Self {
        Anomaly::Inconsistency {
            pipelines: (
                annotation.pipeline_id_a.clone(),
                annotation.pipeline_id_b.clone(),
            ),
            severity: annotation.severity,
            explanation: annotation.explanation.clone(),
        }
    }
}

/// Discrete risk bucket for the evaluated item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// The synthesized verdict for one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub fingerprint: Fingerprint,
    pub aggregate_score: f64,
    pub aggregate_confidence: f64,
    pub dispersion: f64,
    pub contributing_pipelines: Vec<PipelineContribution>,
    pub anomalies: Vec<Anomaly>,
    pub risk_level: RiskLevel,
    pub recommendation: String,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EnsembleResult {
    pub fn contributor_ids(&self) -> Vec<&PipelineId> {
        self.contributing_pipelines
            .iter()
            .map(|c| &c.pipeline_id)
            .collect()
    }

    /// Whether the numeric fields satisfy their range invariants
    pub fn is_well_formed(&self) -> bool {
        let unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        unit(self.aggregate_score)
            && unit(self.aggregate_confidence)
            && self.dispersion.is_finite()
            && self.dispersion >= 0.0
            && !self.contributing_pipelines.is_empty()
    }
}

/// Explanation returned when no pipeline produced a usable opinion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsufficientDataReport {
    pub fingerprint: Fingerprint,
    /// One `PipelineFailed` entry per attempted pipeline
    pub anomalies: Vec<Anomaly>,
    pub computed_at: DateTime<Utc>,
}

/// What `submit` hands back. Expected operating conditions are states, not errors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Evaluated(Arc<EnsembleResult>),
    InsufficientData(InsufficientDataReport),
    LockTimeout {
        fingerprint: Fingerprint,
        waited_ms: u64,
    },
}

impl SubmitOutcome {
    pub fn result(&self) -> Option<&Arc<EnsembleResult>> {
        match self {
            SubmitOutcome::Evaluated(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, SubmitOutcome::InsufficientData(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            SubmitOutcome::Evaluated(_) => "evaluated",
            SubmitOutcome::InsufficientData(_) => "insufficient_data",
            SubmitOutcome::LockTimeout { .. } => "lock_timeout",
        }
    }

    /// For callers that would rather treat the non-evaluated states as errors
    pub fn into_result(self) -> crate::error::OrchestrationResult<Arc<EnsembleResult>> {
        match self {
            SubmitOutcome::Evaluated(result) => Ok(result),
            SubmitOutcome::InsufficientData(report) => Err(
                crate::error::OrchestrationError::InsufficientData(report.fingerprint),
            ),
            SubmitOutcome::LockTimeout {
                fingerprint,
                waited_ms,
            } => Err(crate::error::OrchestrationError::LockTimeout {
                fingerprint,
                waited_ms,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_stable_across_key_order() {
        let a = json!({"name": "Charizard", "set": "Base", "number": 4});
        let b = json!({"number": 4, "set": "Base", "name": "Charizard"});
        assert_eq!(
            Fingerprint::from_payload(&a, &[]),
            Fingerprint::from_payload(&b, &[])
        );
    }

    #[test]
    fn test_fingerprint_depends_on_requested_pipelines() {
        let payload = json!({"image": "abc"});
        let all = Fingerprint::from_payload(&payload, &[]);
        let grading = Fingerprint::from_payload(&payload, &["grading".into()]);
        let reordered = Fingerprint::from_payload(
            &payload,
            &["grading".into(), "authenticity".into()],
        );
        let ordered = Fingerprint::from_payload(
            &payload,
            &["authenticity".into(), "grading".into()],
        );

        assert_ne!(all, grading);
        assert_eq!(reordered, ordered);
        assert_eq!(all.as_str().len(), 64);
    }

    #[test]
    fn test_failed_result_zeroes_opinion() {
        let result = PipelineResult::failed(
            "grading".into(),
            PipelineKind::Grading,
            PipelineError::Timeout { timeout_ms: 50 },
            50,
        );
        assert_eq!(result.score, 0.0);
        assert_eq!(result.confidence, 0.0);
        assert!(!result.is_success());
        assert!(result.error.as_ref().unwrap().is_timeout());
    }

    #[test]
    fn test_success_clamps_out_of_range() {
        let result = PipelineResult::success(
            "centering".into(),
            PipelineKind::Centering,
            1.4,
            f64::NAN,
            serde_json::Value::Null,
            3,
        );
        assert_eq!(result.score, 1.0);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_request_wants() {
        let all = AnalysisRequest::new(json!({}));
        assert!(all.wants(&"anything".into()));

        let some = AnalysisRequest::for_pipelines(json!({}), vec!["grading".into()]);
        assert!(some.wants(&"grading".into()));
        assert!(!some.wants(&"centering".into()));
    }
}
