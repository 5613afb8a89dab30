//! Ensemble consensus
//!
//! All weighting lives here. [`combine`] is the pure core over explicit
//! `(score, confidence, weight inputs)` tuples; [`ConsensusEngine`] turns
//! pipeline results and consistency annotations into those tuples.
//!
//! For each surviving pipeline `i`:
//!
//! ```text
//! w_i        = max(confidence_i * accuracy_i * (1 - penalty_i), EPSILON_WEIGHT)
//! score      = Σ w_i·s_i / Σ w_i
//! dispersion = sqrt(Σ w_i·(s_i - score)² / Σ w_i)
//! confidence = (Σ w_i·c_i / Σ w_i) / (1 + k·dispersion)
//! ```

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::state::{
    ConsistencyAnnotation, PipelineContribution, PipelineId, PipelineResult, Severity,
};

/// Weight floor so disagreement never removes a pipeline entirely
pub const EPSILON_WEIGHT: f64 = 1e-3;

/// Default dispersion sensitivity `k`
pub const DEFAULT_DISPERSION_K: f64 = 2.0;

/// Penalty charged per annotation of the given severity
pub fn severity_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::None => 0.0,
        Severity::Minor => 0.35,
        Severity::Major => 1.0,
    }
}

/// Error type for consensus
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsensusError {
    #[error("no surviving pipeline results ({attempted} attempted)")]
    InsufficientData { attempted: usize },
}

/// Result type for consensus
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// One opinion with its weight inputs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusInput {
    pub score: f64,
    pub confidence: f64,
    pub accuracy_factor: f64,
    /// Annotation penalty in [0, 1]
    pub penalty: f64,
}

impl ConsensusInput {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self {
            score,
            confidence,
            accuracy_factor: 1.0,
            penalty: 0.0,
        }
    }

    pub fn with_accuracy(mut self, accuracy_factor: f64) -> Self {
        self.accuracy_factor = accuracy_factor;
        self
    }

    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.penalty = penalty;
        self
    }

    /// Effective weight, floored at [`EPSILON_WEIGHT`]
    pub fn weight(&self) -> f64 {
        let penalty = self.penalty.clamp(0.0, 1.0);
        let raw = self.confidence * self.accuracy_factor.max(0.0) * (1.0 - penalty);
        if raw.is_finite() {
            raw.max(EPSILON_WEIGHT)
        } else {
            EPSILON_WEIGHT
        }
    }
}

/// Aggregate numbers plus the weight each input received
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub aggregate_score: f64,
    pub aggregate_confidence: f64,
    pub dispersion: f64,
    /// Effective weight per input, same order as the inputs
    pub weights: Vec<f64>,
}

/// Combine opinions. Returns `None` for an empty input.
pub fn combine(inputs: &[ConsensusInput], k: f64) -> Option<Consensus> {
    match inputs {
        [] => None,
        [only] => Some(Consensus {
            aggregate_score: only.score,
            aggregate_confidence: only.confidence,
            dispersion: 0.0,
            weights: vec![only.weight()],
        }),
        _ => {
            let weights: Vec<f64> = inputs.iter().map(ConsensusInput::weight).collect();
            let total: f64 = weights.iter().sum();

            let weighted_mean = |f: fn(&ConsensusInput) -> f64| -> f64 {
                inputs
                    .iter()
                    .zip(&weights)
                    .map(|(input, w)| w * f(input))
                    .sum::<f64>()
                    / total
            };

            let score = weighted_mean(|i: &ConsensusInput| i.score);
            let mean_confidence = weighted_mean(|i: &ConsensusInput| i.confidence);
            let variance = inputs
                .iter()
                .zip(&weights)
                .map(|(input, w)| w * (input.score - score).powi(2))
                .sum::<f64>()
                / total;
            let dispersion = variance.max(0.0).sqrt();
            let consensus_factor = 1.0 / (1.0 + k.max(0.0) * dispersion);

            Some(Consensus {
                aggregate_score: score.clamp(0.0, 1.0),
                aggregate_confidence: (mean_confidence * consensus_factor).clamp(0.0, 1.0),
                dispersion,
                weights,
            })
        }
    }
}

/// Median of a non-empty slice; mean of the middle pair for even lengths
fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Charge each annotation's penalty to the member of the pair that deviates
/// more from the median surviving score; ties split evenly. Capped at 1.0.
pub fn annotation_penalties(
    survivors: &[&PipelineResult],
    annotations: &[ConsistencyAnnotation],
) -> HashMap<PipelineId, f64> {
    let mut penalties: HashMap<PipelineId, f64> = HashMap::new();
    if survivors.is_empty() {
        return penalties;
    }

    let scores: HashMap<&PipelineId, f64> =
        survivors.iter().map(|r| (&r.pipeline_id, r.score)).collect();
    let all: Vec<f64> = scores.values().copied().collect();
    let med = median(&all);

    for annotation in annotations {
        let amount = severity_penalty(annotation.severity);
        if amount == 0.0 {
            continue;
        }
        let (Some(&sa), Some(&sb)) = (
            scores.get(&annotation.pipeline_id_a),
            scores.get(&annotation.pipeline_id_b),
        ) else {
            continue;
        };

        let da = (sa - med).abs();
        let db = (sb - med).abs();
        if (da - db).abs() < 1e-9 {
            *penalties.entry(annotation.pipeline_id_a.clone()).or_default() += amount / 2.0;
            *penalties.entry(annotation.pipeline_id_b.clone()).or_default() += amount / 2.0;
        } else {
            let blamed = if da > db {
                &annotation.pipeline_id_a
            } else {
                &annotation.pipeline_id_b
            };
            *penalties.entry(blamed.clone()).or_default() += amount;
        }
    }

    for penalty in penalties.values_mut() {
        *penalty = penalty.min(1.0);
    }
    penalties
}

/// Output of [`ConsensusEngine::aggregate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutput {
    pub aggregate_score: f64,
    pub aggregate_confidence: f64,
    pub dispersion: f64,
    /// Surviving pipelines only, in input order
    pub contributions: Vec<PipelineContribution>,
}

/// Applies [`combine`] to a pipeline result set
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    dispersion_k: f64,
}

impl ConsensusEngine {
    pub fn new(dispersion_k: f64) -> Self {
        Self { dispersion_k }
    }

    pub fn dispersion_k(&self) -> f64 {
        self.dispersion_k
    }

    /// Weight the successful results and combine them
    pub fn aggregate(
        &self,
        results: &[PipelineResult],
        annotations: &[ConsistencyAnnotation],
    ) -> ConsensusResult<ConsensusOutput> {
        let survivors: Vec<&PipelineResult> = results.iter().filter(|r| r.is_success()).collect();
        let penalties = annotation_penalties(&survivors, annotations);

        let inputs: Vec<ConsensusInput> = survivors
            .iter()
            .map(|r| {
                ConsensusInput::new(r.score, r.confidence)
                    .with_accuracy(r.accuracy_factor)
                    .with_penalty(penalties.get(&r.pipeline_id).copied().unwrap_or(0.0))
            })
            .collect();

        let consensus = combine(&inputs, self.dispersion_k).ok_or(
            ConsensusError::InsufficientData {
                attempted: results.len(),
            },
        )?;

        let total: f64 = consensus.weights.iter().sum();
        let contributions = survivors
            .iter()
            .zip(&consensus.weights)
            .map(|(r, &weight)| PipelineContribution {
                pipeline_id: r.pipeline_id.clone(),
                kind: r.kind,
                score: r.score,
                confidence: r.confidence,
                weight,
                normalized_weight: if total > 0.0 { weight / total } else { 0.0 },
            })
            .collect();

        debug!(
            survivors = survivors.len(),
            score = consensus.aggregate_score,
            confidence = consensus.aggregate_confidence,
            dispersion = consensus.dispersion,
            "Consensus computed"
        );

        Ok(ConsensusOutput {
            aggregate_score: consensus.aggregate_score,
            aggregate_confidence: consensus.aggregate_confidence,
            dispersion: consensus.dispersion,
            contributions,
        })
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new(DEFAULT_DISPERSION_K)
    }
}
