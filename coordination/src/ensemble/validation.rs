//! Cross-validation of pipeline results
//!
//! Rules look at pairs of successful results and may flag an
//! inconsistency. Each unordered pair yields at most one annotation: the
//! most severe finding across all rules, first rule winning ties. Pairs
//! involving a failed result are never examined.

use std::sync::Arc;

use tracing::debug;

use crate::state::{ConsistencyAnnotation, PipelineKind, PipelineResult, Severity};

/// What a rule reports when it fires
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub severity: Severity,
    pub explanation: String,
}

impl Finding {
    pub fn new(severity: Severity, explanation: impl Into<String>) -> Self {
        Self {
            severity,
            explanation: explanation.into(),
        }
    }
}

/// A predicate over a pair of successful results
pub trait ConsistencyRule: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect one pair. Called once per unordered pair; rules that care
    /// about direction must check both orientations themselves.
    fn check(&self, a: &PipelineResult, b: &PipelineResult) -> Option<Finding>;
}

/// A condition on one side of a [`ConflictRule`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    ScoreBelow(f64),
    ScoreAbove(f64),
    ConfidenceAbove(f64),
}

impl Condition {
    pub fn holds(&self, result: &PipelineResult) -> bool {
        match *self {
            Condition::ScoreBelow(bound) => result.score < bound,
            Condition::ScoreAbove(bound) => result.score > bound,
            Condition::ConfidenceAbove(bound) => result.confidence > bound,
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::ScoreBelow(b) => write!(f, "score < {:.2}", b),
            Condition::ScoreAbove(b) => write!(f, "score > {:.2}", b),
            Condition::ConfidenceAbove(b) => write!(f, "confidence > {:.2}", b),
        }
    }
}

/// Declarative rule: a pipeline of one kind meeting one condition while a
/// pipeline of another kind meets another is a contradiction.
#[derive(Debug, Clone)]
pub struct ConflictRule {
    pub name: String,
    pub first: (PipelineKind, Condition),
    pub second: (PipelineKind, Condition),
    pub severity: Severity,
}

impl ConflictRule {
    pub fn new(
        name: impl Into<String>,
        first: (PipelineKind, Condition),
        second: (PipelineKind, Condition),
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            first,
            second,
            severity,
        }
    }

    fn matches(&self, x: &PipelineResult, y: &PipelineResult) -> bool {
        x.kind == self.first.0
            && y.kind == self.second.0
            && self.first.1.holds(x)
            && self.second.1.holds(y)
    }
}

impl ConsistencyRule for ConflictRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, a: &PipelineResult, b: &PipelineResult) -> Option<Finding> {
        let (x, y) = if self.matches(a, b) {
            (a, b)
        } else if self.matches(b, a) {
            (b, a)
        } else {
            return None;
        };

        Some(Finding::new(
            self.severity,
            format!(
                "{} reports {} ({:.2}/{:.2}) while {} reports {} ({:.2}/{:.2})",
                x.pipeline_id,
                self.first.1,
                x.score,
                x.confidence,
                y.pipeline_id,
                self.second.1,
                y.score,
                y.confidence
            ),
        ))
    }
}

/// Generic rule: any two pipelines whose scores are far apart
#[derive(Debug, Clone)]
pub struct DivergenceRule {
    pub minor_gap: f64,
    pub major_gap: f64,
}

impl Default for DivergenceRule {
    fn default() -> Self {
        Self {
            minor_gap: 0.45,
            major_gap: 0.65,
        }
    }
}

impl ConsistencyRule for DivergenceRule {
    fn name(&self) -> &str {
        "score_divergence"
    }

    fn check(&self, a: &PipelineResult, b: &PipelineResult) -> Option<Finding> {
        let gap = (a.score - b.score).abs();
        let severity = if gap > self.major_gap {
            Severity::Major
        } else if gap > self.minor_gap {
            Severity::Minor
        } else {
            return None;
        };

        Some(Finding::new(
            severity,
            format!(
                "{} ({:.2}) and {} ({:.2}) diverge by {:.2}",
                a.pipeline_id, a.score, b.pipeline_id, b.score, gap
            ),
        ))
    }
}

/// Closure-backed rule for ad hoc checks
pub struct PredicateRule<F> {
    name: String,
    predicate: F,
}

impl<F> PredicateRule<F>
where
    F: Fn(&PipelineResult, &PipelineResult) -> Option<Finding> + Send + Sync,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<F> ConsistencyRule for PredicateRule<F>
where
    F: Fn(&PipelineResult, &PipelineResult) -> Option<Finding> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, a: &PipelineResult, b: &PipelineResult) -> Option<Finding> {
        (self.predicate)(a, b)
    }
}

/// Default rule set for card evaluation
pub fn default_rules() -> Vec<Arc<dyn ConsistencyRule>> {
    vec![
        Arc::new(ConflictRule::new(
            "counterfeit_but_pristine",
            (PipelineKind::Authenticity, Condition::ScoreBelow(0.4)),
            (PipelineKind::Grading, Condition::ScoreAbove(0.85)),
            Severity::Major,
        )),
        Arc::new(ConflictRule::new(
            "off_center_but_high_grade",
            (PipelineKind::Centering, Condition::ScoreBelow(0.4)),
            (PipelineKind::Grading, Condition::ScoreAbove(0.85)),
            Severity::Minor,
        )),
        Arc::new(ConflictRule::new(
            "unrecognized_but_priced",
            (PipelineKind::Recognition, Condition::ScoreBelow(0.4)),
            (PipelineKind::PricePrediction, Condition::ConfidenceAbove(0.75)),
            Severity::Minor,
        )),
        Arc::new(DivergenceRule::default()),
    ]
}

/// Applies consistency rules to a result set
#[derive(Clone)]
pub struct CrossValidator {
    rules: Vec<Arc<dyn ConsistencyRule>>,
}

impl CrossValidator {
    pub fn new(rules: Vec<Arc<dyn ConsistencyRule>>) -> Self {
        Self { rules }
    }

    /// Append a rule; evaluation order is insertion order
    pub fn with_rule(mut self, rule: Arc<dyn ConsistencyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Annotate every inconsistent pair of successful results
    pub fn validate(&self, results: &[PipelineResult]) -> Vec<ConsistencyAnnotation> {
        let successes: Vec<&PipelineResult> = results.iter().filter(|r| r.is_success()).collect();
        let mut annotations = Vec::new();

        for (i, a) in successes.iter().enumerate() {
            for b in &successes[i + 1..] {
                if let Some(annotation) = self.check_pair(a, b) {
                    debug!(
                        a = %annotation.pipeline_id_a,
                        b = %annotation.pipeline_id_b,
                        severity = %annotation.severity,
                        rule = %annotation.rule,
                        "Inconsistency detected"
                    );
                    annotations.push(annotation);
                }
            }
        }

        annotations
    }

    fn check_pair(&self, a: &PipelineResult, b: &PipelineResult) -> Option<ConsistencyAnnotation> {
        let mut worst: Option<(&str, Finding)> = None;
        for rule in &self.rules {
            let Some(finding) = rule.check(a, b) else {
                continue;
            };
            if finding.severity == Severity::None {
                continue;
            }
            let replace = worst
                .as_ref()
                .map_or(true, |(_, current)| finding.severity > current.severity);
            if replace {
                worst = Some((rule.name(), finding));
            }
        }

        worst.map(|(rule, finding)| ConsistencyAnnotation {
            pipeline_id_a: a.pipeline_id.clone(),
            pipeline_id_b: b.pipeline_id.clone(),
            severity: finding.severity,
            rule: rule.to_string(),
            explanation: finding.explanation,
        })
    }
}

impl Default for CrossValidator {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl std::fmt::Debug for CrossValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.rules.iter().map(|r| r.name()).collect();
        f.debug_struct("CrossValidator").field("rules", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PipelineError;

    fn ok(id: &str, kind: PipelineKind, score: f64, confidence: f64) -> PipelineResult {
        PipelineResult::success(id.into(), kind, score, confidence, serde_json::Value::Null, 5)
    }

    #[test]
    fn test_counterfeit_but_pristine_is_major() {
        let results = vec![
            ok("auth", PipelineKind::Authenticity, 0.2, 0.9),
            ok("grade", PipelineKind::Grading, 0.95, 0.9),
        ];
        let annotations = CrossValidator::default().validate(&results);

        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].severity, Severity::Major);
        assert!(annotations[0].involves(&"auth".into()));
        assert!(annotations[0].involves(&"grade".into()));
    }

    #[test]
    fn test_with_rule_appends() {
        let base = CrossValidator::default();
        let extra = default_rules().remove(0);
        let extended = base.clone().with_rule(extra);
        assert_eq!(extended.rule_count(), base.rule_count() + 1);
        assert_eq!(CrossValidator::new(Vec::new()).rule_count(), 0);
    }

    #[test]
    fn test_rule_matches_either_order() {
        let rule = ConflictRule::new(
            "test",
            (PipelineKind::Centering, Condition::ScoreBelow(0.4)),
            (PipelineKind::Grading, Condition::ScoreAbove(0.85)),
            Severity::Minor,
        );
        let centering = ok("c", PipelineKind::Centering, 0.3, 0.8);
        let grading = ok("g", PipelineKind::Grading, 0.9, 0.8);

        assert!(rule.check(&centering, &grading).is_some());
        assert!(rule.check(&grading, &centering).is_some());
    }

    #[test]
    fn test_most_severe_finding_wins() {
        // Conflict rule says minor, divergence of 0.6 also minor; add a major override
        let validator = CrossValidator::default().with_rule(Arc::new(PredicateRule::new(
            "always_major",
            |_: &PipelineResult, _: &PipelineResult| Some(Finding::new(Severity::Major, "forced")),
        )));
        let results = vec![
            ok("c", PipelineKind::Centering, 0.3, 0.8),
            ok("g", PipelineKind::Grading, 0.9, 0.8),
        ];

        let annotations = validator.validate(&results);
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].severity, Severity::Major);
        assert_eq!(annotations[0].rule, "always_major");
    }

    #[test]
    fn test_divergence_bands() {
        let rule = DivergenceRule::default();
        let a = ok("a", PipelineKind::Grading, 0.9, 0.8);

        assert!(rule.check(&a, &ok("b", PipelineKind::Grading, 0.6, 0.8)).is_none());
        assert_eq!(
            rule.check(&a, &ok("b", PipelineKind::Grading, 0.4, 0.8))
                .unwrap()
                .severity,
            Severity::Minor
        );
        assert_eq!(
            rule.check(&a, &ok("b", PipelineKind::Grading, 0.1, 0.8))
                .unwrap()
                .severity,
            Severity::Major
        );
    }

    #[test]
    fn test_failed_results_are_skipped() {
        let results = vec![
            ok("auth", PipelineKind::Authenticity, 0.2, 0.9),
            PipelineResult::failed(
                "grade".into(),
                PipelineKind::Grading,
                PipelineError::failure("down"),
                3,
            ),
        ];
        assert!(CrossValidator::default().validate(&results).is_empty());
    }

    #[test]
    fn test_consistent_results_have_no_annotations() {
        let results = vec![
            ok("auth", PipelineKind::Authenticity, 0.9, 0.9),
            ok("grade", PipelineKind::Grading, 0.85, 0.8),
            ok("center", PipelineKind::Centering, 0.8, 0.7),
            ok("recog", PipelineKind::Recognition, 0.95, 0.9),
        ];
        assert!(CrossValidator::default().validate(&results).is_empty());
    }

    #[test]
    fn test_unrecognized_but_confidently_priced() {
        let results = vec![
            ok("recog", PipelineKind::Recognition, 0.3, 0.5),
            ok("price", PipelineKind::PricePrediction, 0.6, 0.9),
        ];
        let annotations = CrossValidator::default().validate(&results);
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].rule, "unrecognized_but_priced");
        assert_eq!(annotations[0].severity, Severity::Minor);
    }
}
