//! Risk assessment for ensemble verdicts
//!
//! Maps the consensus numbers and the count of major inconsistencies to a
//! discrete [`RiskLevel`] plus a short recommendation. Pure and
//! deterministic; thresholds come from configuration.

use serde::{Deserialize, Serialize};

use crate::state::RiskLevel;

/// Threshold rules for each risk bucket.
///
/// A verdict is `High` if any high rule fires, else `Medium` if any medium
/// rule fires, else `Low`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    /// Major annotations at or above this count force `High`
    pub high_major_count: usize,
    pub high_min_confidence: f64,
    pub high_max_dispersion: f64,
    pub high_min_score: f64,
    /// Major annotations at or above this count force at least `Medium`
    pub medium_major_count: usize,
    pub medium_min_confidence: f64,
    pub medium_max_dispersion: f64,
    pub medium_min_score: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            high_major_count: 2,
            high_min_confidence: 0.40,
            high_max_dispersion: 0.30,
            high_min_score: 0.30,
            medium_major_count: 1,
            medium_min_confidence: 0.65,
            medium_max_dispersion: 0.15,
            medium_min_score: 0.60,
        }
    }
}

impl RiskThresholds {
    /// Check that bounds are finite and the medium band sits inside the high band
    pub fn validate(&self) -> Result<(), String> {
        let values = [
            self.high_min_confidence,
            self.high_max_dispersion,
            self.high_min_score,
            self.medium_min_confidence,
            self.medium_max_dispersion,
            self.medium_min_score,
        ];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err("thresholds must be finite and non-negative".to_string());
        }
        if self.medium_major_count > self.high_major_count {
            return Err("medium_major_count exceeds high_major_count".to_string());
        }
        if self.medium_min_confidence < self.high_min_confidence
            || self.medium_min_score < self.high_min_score
            || self.medium_max_dispersion > self.high_max_dispersion
        {
            return Err("medium thresholds must be stricter than high thresholds".to_string());
        }
        Ok(())
    }
}

/// Inputs to one assessment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskInputs {
    pub aggregate_score: f64,
    pub aggregate_confidence: f64,
    pub dispersion: f64,
    pub major_annotations: usize,
}

/// Result of an assessment
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub recommendation: String,
    /// Which rules fired, in evaluation order
    pub reasons: Vec<String>,
}

/// Pure threshold-based risk classifier
#[derive(Debug, Clone, Default)]
pub struct RiskAssessor {
    thresholds: RiskThresholds,
}

impl RiskAssessor {
    pub fn new(thresholds: RiskThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    /// Classify a verdict
    pub fn assess(&self, inputs: RiskInputs) -> RiskAssessment {
        let t = &self.thresholds;

        let high = Self::reasons(
            inputs,
            t.high_major_count,
            t.high_min_confidence,
            t.high_max_dispersion,
            t.high_min_score,
        );
        if !high.is_empty() {
            return RiskAssessment {
                level: RiskLevel::High,
                recommendation: recommendation(RiskLevel::High, &high),
                reasons: high,
            };
        }

        let medium = Self::reasons(
            inputs,
            t.medium_major_count,
            t.medium_min_confidence,
            t.medium_max_dispersion,
            t.medium_min_score,
        );
        if !medium.is_empty() {
            return RiskAssessment {
                level: RiskLevel::Medium,
                recommendation: recommendation(RiskLevel::Medium, &medium),
                reasons: medium,
            };
        }

        RiskAssessment {
            level: RiskLevel::Low,
            recommendation: recommendation(RiskLevel::Low, &[]),
            reasons: Vec::new(),
        }
    }

    fn reasons(
        inputs: RiskInputs,
        major_count: usize,
        min_confidence: f64,
        max_dispersion: f64,
        min_score: f64,
    ) -> Vec<String> {
        let mut reasons = Vec::new();
        if major_count > 0 && inputs.major_annotations >= major_count {
            reasons.push(format!(
                "{} major inconsistencies",
                inputs.major_annotations
            ));
        }
        if inputs.aggregate_confidence < min_confidence {
            reasons.push(format!(
                "confidence {:.2} below {:.2}",
                inputs.aggregate_confidence, min_confidence
            ));
        }
        if inputs.dispersion > max_dispersion {
            reasons.push(format!(
                "dispersion {:.2} above {:.2}",
                inputs.dispersion, max_dispersion
            ));
        }
        if inputs.aggregate_score < min_score {
            reasons.push(format!(
                "score {:.2} below {:.2}",
                inputs.aggregate_score, min_score
            ));
        }
        reasons
    }
}

fn recommendation(level: RiskLevel, reasons: &[String]) -> String {
    match level {
        RiskLevel::Low => "Pipelines agree with high confidence; safe to proceed.".to_string(),
        RiskLevel::Medium => format!(
            "Proceed with caution and spot-check the item ({}).",
            reasons.join("; ")
        ),
        RiskLevel::High => format!(
            "Hold for manual expert review ({}).",
            reasons.join("; ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(score: f64, confidence: f64, dispersion: f64, majors: usize) -> RiskInputs {
        RiskInputs {
            aggregate_score: score,
            aggregate_confidence: confidence,
            dispersion,
            major_annotations: majors,
        }
    }

    #[test]
    fn test_clean_verdict_is_low() {
        let assessment = RiskAssessor::default().assess(inputs(0.88, 0.82, 0.03, 0));
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(assessment.reasons.is_empty());
        assert!(assessment.recommendation.contains("safe to proceed"));
    }

    #[test]
    fn test_single_major_is_medium() {
        let assessment = RiskAssessor::default().assess(inputs(0.88, 0.82, 0.03, 1));
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert!(assessment.recommendation.contains("1 major inconsistencies"));
    }

    #[test]
    fn test_high_rules() {
        let assessor = RiskAssessor::default();
        assert_eq!(assessor.assess(inputs(0.9, 0.9, 0.0, 2)).level, RiskLevel::High);
        assert_eq!(assessor.assess(inputs(0.9, 0.35, 0.0, 0)).level, RiskLevel::High);
        assert_eq!(assessor.assess(inputs(0.9, 0.9, 0.31, 0)).level, RiskLevel::High);
        assert_eq!(assessor.assess(inputs(0.2, 0.9, 0.0, 0)).level, RiskLevel::High);
    }

    #[test]
    fn test_medium_rules() {
        let assessor = RiskAssessor::default();
        assert_eq!(assessor.assess(inputs(0.9, 0.6, 0.0, 0)).level, RiskLevel::Medium);
        assert_eq!(assessor.assess(inputs(0.9, 0.9, 0.2, 0)).level, RiskLevel::Medium);
        assert_eq!(assessor.assess(inputs(0.5, 0.9, 0.0, 0)).level, RiskLevel::Medium);
    }

    #[test]
    fn test_assessment_is_deterministic() {
        let assessor = RiskAssessor::default();
        let a = assessor.assess(inputs(0.55, 0.5, 0.2, 1));
        let b = assessor.assess(inputs(0.55, 0.5, 0.2, 1));
        assert_eq!(a, b);
        assert_eq!(a.reasons.len(), 4);
    }

    #[test]
    fn test_thresholds_validation() {
        assert!(RiskThresholds::default().validate().is_ok());

        let inverted = RiskThresholds {
            medium_min_confidence: 0.2,
            ..RiskThresholds::default()
        };
        assert!(inverted.validate().is_err());

        let nan = RiskThresholds {
            high_max_dispersion: f64::NAN,
            ..RiskThresholds::default()
        };
        assert!(nan.validate().is_err());
    }
}
