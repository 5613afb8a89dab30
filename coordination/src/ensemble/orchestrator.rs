//! Ensemble orchestrator - the request path
//!
//! ```text
//! submit ─▶ cache.access ─┬─ hit ──────────────────────────────▶ result
//!                         ├─ in flight ─▶ wait on holder ──────▶ same result
//!                         └─ acquired ─▶ run_all ─▶ validate ─▶ consensus
//!                                         ─▶ risk ─▶ store + release ─▶ result
//! ```
//!
//! Built once at startup with [`OrchestratorBuilder`] and shared by handle.
//! Owns the background cache sweeper and the performance monitor task;
//! both stop when the orchestrator is dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigResult, OrchestratorConfig};
use crate::error::OrchestrationError;
use crate::events::{CacheOutcome, EventBus, OrchestrationEvent, SharedEventBus};
use crate::monitor::{HealthSnapshot, MonitorHandle, PerformanceMonitor};
use crate::pipeline::{AnalysisPipeline, PipelineAdapter, PipelineRegistration, SharedPipelineAdapter};
use crate::state::{
    AnalysisRequest, Anomaly, CacheAccess, EnsembleResult, Fingerprint, FingerprintCache,
    InsufficientDataReport, PipelineResult, Severity, SharedFingerprintCache, SubmitOutcome,
    WaitOutcome,
};

use super::consensus::{ConsensusEngine, ConsensusError};
use super::coordinator::ExecutionCoordinator;
use super::risk::{RiskAssessor, RiskInputs};
use super::validation::CrossValidator;

/// Shared reference to EnsembleOrchestrator
pub type SharedEnsembleOrchestrator = Arc<EnsembleOrchestrator>;

/// Assembles an [`EnsembleOrchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    adapters: Vec<SharedPipelineAdapter>,
    validator: Option<CrossValidator>,
    event_bus: Option<SharedEventBus>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            validator: None,
            event_bus: None,
        }
    }

    /// Register an adapter; registration order is result order
    pub fn register(mut self, adapter: SharedPipelineAdapter) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Wrap and register a pipeline
    pub fn register_pipeline(
        self,
        registration: PipelineRegistration,
        pipeline: Arc<dyn AnalysisPipeline>,
    ) -> Self {
        self.register(PipelineAdapter::new(registration, pipeline).shared())
    }

    /// Replace the default consistency rules
    pub fn with_validator(mut self, validator: CrossValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Publish onto an existing bus instead of a private one
    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Validate configuration and start background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> ConfigResult<EnsembleOrchestrator> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for adapter in &self.adapters {
            if !seen.insert(adapter.id().clone()) {
                return Err(ConfigError::Invalid {
                    field: "pipelines",
                    reason: format!("duplicate pipeline id {}", adapter.id()),
                });
            }
        }

        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::with_capacity(self.config.event_channel_capacity).shared());

        let cache = FingerprintCache::new(self.config.cache_max_entries, self.config.cache_ttl())
            .shared();
        let sweeper = cache.spawn_sweeper(self.config.sweep_interval());

        let monitor = MonitorHandle::spawn(
            monitor_for(&self.config, &self.adapters),
            event_bus.subscribe(),
        );
        let validator = self.validator.unwrap_or_default();

        info!(
            pipelines = self.adapters.len(),
            rules = validator.rule_count(),
            cache_ttl_ms = self.config.cache_ttl_ms,
            cache_max_entries = self.config.cache_max_entries,
            request_timeout_ms = self.config.global_request_timeout_ms,
            "Orchestrator started"
        );

        Ok(EnsembleOrchestrator {
            coordinator: ExecutionCoordinator::new(self.adapters, event_bus.clone()),
            validator,
            consensus: ConsensusEngine::new(self.config.consensus_dispersion_k),
            risk: RiskAssessor::new(self.config.risk.clone()),
            config: self.config,
            cache,
            event_bus,
            monitor,
            sweeper,
        })
    }

}

fn monitor_for(config: &OrchestratorConfig, adapters: &[SharedPipelineAdapter]) -> PerformanceMonitor {
    PerformanceMonitor::new(config.monitor_window(), config.monitor_max_samples)
        .with_pipelines(adapters.iter().map(|a| (a.id().clone(), a.kind())))
}

/// Deduplicating, fault-tolerant evaluation front door
pub struct EnsembleOrchestrator {
    config: OrchestratorConfig,
    cache: SharedFingerprintCache,
    coordinator: ExecutionCoordinator,
    validator: CrossValidator,
    consensus: ConsensusEngine,
    risk: RiskAssessor,
    event_bus: SharedEventBus,
    monitor: MonitorHandle,
    sweeper: JoinHandle<()>,
}

impl EnsembleOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Create a shared reference to this orchestrator
    pub fn shared(self) -> SharedEnsembleOrchestrator {
        Arc::new(self)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cache(&self) -> &SharedFingerprintCache {
        &self.cache
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    /// Evaluate under the configured request ceiling
    pub async fn submit(&self, request: AnalysisRequest) -> SubmitOutcome {
        self.submit_with_timeout(request, self.config.request_timeout())
            .await
    }

    /// Evaluate, bounding the whole call (including waiting on another
    /// caller's computation) by `ceiling`
    pub async fn submit_with_timeout(
        &self,
        request: AnalysisRequest,
        ceiling: Duration,
    ) -> SubmitOutcome {
        let started = Instant::now();
        let deadline = started + ceiling;
        let fingerprint = request.fingerprint.clone();

        self.event_bus.publish(OrchestrationEvent::RequestSubmitted {
            request_id: request.request_id.clone(),
            fingerprint: fingerprint.clone(),
            timestamp: Utc::now(),
        });

        loop {
            match self.cache.access(&fingerprint) {
                CacheAccess::Hit(result) => {
                    self.publish_access(&fingerprint, CacheOutcome::Hit);
                    debug!(request_id = %request.request_id, fingerprint = %fingerprint, "Cache hit");
                    return SubmitOutcome::Evaluated(result);
                }
                CacheAccess::Acquired(lock) => {
                    self.publish_access(&fingerprint, CacheOutcome::Miss);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let (outcome, cut_at_ceiling) = self.compute(&request, remaining).await;
                    // A ceiling shorter than the configured one must not pin a
                    // partial verdict for everyone else
                    if cut_at_ceiling && ceiling < self.config.request_timeout() {
                        debug!(
                            request_id = %request.request_id,
                            fingerprint = %fingerprint,
                            ceiling_ms = ceiling.as_millis() as u64,
                            "Result cut short by caller ceiling; not caching"
                        );
                        lock.complete_uncached(outcome.clone());
                    } else {
                        lock.complete(outcome.clone(), self.config.cache_ttl());
                    }
                    return outcome;
                }
                CacheAccess::InFlight(waiter) => {
                    debug!(
                        request_id = %request.request_id,
                        fingerprint = %fingerprint,
                        "Joining in-flight computation"
                    );
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match waiter.wait(remaining).await {
                        WaitOutcome::Completed(outcome) => {
                            self.publish_access(&fingerprint, CacheOutcome::Coalesced);
                            return outcome;
                        }
                        WaitOutcome::Abandoned => {
                            debug!(fingerprint = %fingerprint, "In-flight computation abandoned; retrying");
                            continue;
                        }
                        WaitOutcome::TimedOut => {
                            self.publish_access(&fingerprint, CacheOutcome::Coalesced);
                            let waited_ms = started.elapsed().as_millis() as u64;
                            let error = OrchestrationError::LockTimeout {
                                fingerprint: fingerprint.clone(),
                                waited_ms,
                            };
                            warn!(
                                request_id = %request.request_id,
                                action = error.kind().suggested_action(),
                                "{}",
                                error
                            );
                            self.event_bus.publish(OrchestrationEvent::LockTimedOut {
                                request_id: request.request_id.clone(),
                                fingerprint: fingerprint.clone(),
                                waited_ms,
                                timestamp: Utc::now(),
                            });
                            return SubmitOutcome::LockTimeout {
                                fingerprint,
                                waited_ms,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Drop the cached result for `fingerprint` so the next submit recomputes.
    /// A computation already in flight is unaffected.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let existed = self.cache.invalidate(fingerprint);
        info!(fingerprint = %fingerprint, existed, "Cache invalidated");
        self.event_bus.publish(OrchestrationEvent::CacheInvalidated {
            fingerprint: fingerprint.clone(),
            existed,
            timestamp: Utc::now(),
        });
        existed
    }

    /// Per-pipeline latency and success rates plus cache health
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let stats = self.cache.stats();
        match self.monitor.snapshot(stats).await {
            Some(snapshot) => snapshot,
            None => {
                warn!("Performance monitor unavailable; returning empty snapshot");
                monitor_for(&self.config, self.coordinator.adapters()).snapshot(Utc::now(), stats)
            }
        }
    }

    fn publish_access(&self, fingerprint: &Fingerprint, outcome: CacheOutcome) {
        self.event_bus.publish(OrchestrationEvent::CacheAccessed {
            fingerprint: fingerprint.clone(),
            outcome,
            timestamp: Utc::now(),
        });
    }

    /// Run, validate, aggregate and assess. Also reports whether the
    /// ceiling cut any pipeline off.
    async fn compute(&self, request: &AnalysisRequest, ceiling: Duration) -> (SubmitOutcome, bool) {
        let settled = self.coordinator.settle(request, ceiling).await;
        let cut_at_ceiling = settled.cut_at_ceiling;
        let results = settled.results;
        let annotations = self.validator.validate(&results);
        let failures = failure_anomalies(&results);

        let output = match self.consensus.aggregate(&results, &annotations) {
            Ok(output) => output,
            Err(ConsensusError::InsufficientData { attempted }) => {
                let error = OrchestrationError::InsufficientData(request.fingerprint.clone());
                warn!(
                    request_id = %request.request_id,
                    fingerprint = %request.fingerprint,
                    attempted,
                    action = error.kind().suggested_action(),
                    "{}",
                    error
                );
                self.event_bus.publish(OrchestrationEvent::InsufficientData {
                    request_id: request.request_id.clone(),
                    fingerprint: request.fingerprint.clone(),
                    attempted,
                    timestamp: Utc::now(),
                });
                let report = InsufficientDataReport {
                    fingerprint: request.fingerprint.clone(),
                    anomalies: failures,
                    computed_at: Utc::now(),
                };
                return (SubmitOutcome::InsufficientData(report), cut_at_ceiling);
            }
        };

        let major_annotations = annotations
            .iter()
            .filter(|a| a.severity == Severity::Major)
            .count();
        let assessment = self.risk.assess(RiskInputs {
            aggregate_score: output.aggregate_score,
            aggregate_confidence: output.aggregate_confidence,
            dispersion: output.dispersion,
            major_annotations,
        });

        let mut anomalies: Vec<Anomaly> = annotations.iter().map(Anomaly::from).collect();
        anomalies.extend(failures);
        if output.dispersion > self.risk.thresholds().medium_max_dispersion {
            anomalies.push(Anomaly::HighDispersion {
                dispersion: output.dispersion,
            });
        }

        let computed_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.config.cache_ttl())
            .ok()
            .and_then(|ttl| computed_at.checked_add_signed(ttl))
            .unwrap_or(computed_at);

        let result = EnsembleResult {
            fingerprint: request.fingerprint.clone(),
            aggregate_score: output.aggregate_score,
            aggregate_confidence: output.aggregate_confidence,
            dispersion: output.dispersion,
            contributing_pipelines: output.contributions,
            anomalies,
            risk_level: assessment.level,
            recommendation: assessment.recommendation,
            computed_at,
            expires_at,
        };

        info!(
            request_id = %request.request_id,
            fingerprint = %request.fingerprint,
            score = result.aggregate_score,
            confidence = result.aggregate_confidence,
            dispersion = result.dispersion,
            risk = %result.risk_level,
            contributors = result.contributing_pipelines.len(),
            "Ensemble computed"
        );
        self.event_bus.publish(OrchestrationEvent::EnsembleComputed {
            request_id: request.request_id.clone(),
            fingerprint: request.fingerprint.clone(),
            aggregate_score: result.aggregate_score,
            aggregate_confidence: result.aggregate_confidence,
            dispersion: result.dispersion,
            risk_level: result.risk_level,
            contributors: result.contributing_pipelines.len(),
            timestamp: computed_at,
        });

        (SubmitOutcome::Evaluated(Arc::new(result)), cut_at_ceiling)
    }
}

impl Drop for EnsembleOrchestrator {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.monitor.abort();
    }
}

fn failure_anomalies(results: &[PipelineResult]) -> Vec<Anomaly> {
    results
        .iter()
        .filter_map(|r| {
            let error = r.error.as_ref()?;
            debug!(
                "{}",
                OrchestrationError::from_pipeline(r.pipeline_id.clone(), error)
            );
            Some(Anomaly::PipelineFailed {
                pipeline_id: r.pipeline_id.clone(),
                error: error.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineFault, PipelineOutput};
    use crate::state::{PipelineKind, RiskLevel};
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed(f64, f64);

    #[async_trait]
    impl AnalysisPipeline for Fixed {
        async fn analyze(&self, _payload: &serde_json::Value) -> Result<PipelineOutput, PipelineFault> {
            Ok(PipelineOutput::new(self.0, self.1))
        }
    }

    fn test_setup(pipelines: Vec<(&str, PipelineKind, f64, f64)>) -> EnsembleOrchestrator {
        let mut builder = EnsembleOrchestrator::builder(OrchestratorConfig::default());
        for (id, kind, score, confidence) in pipelines {
            builder = builder.register_pipeline(
                PipelineRegistration::new(id, kind, Duration::from_secs(1)),
                Arc::new(Fixed(score, confidence)),
            );
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_agreeing_pipelines_are_low_risk() {
        let orchestrator = test_setup(vec![
            ("recog", PipelineKind::Recognition, 0.92, 0.9),
            ("auth", PipelineKind::Authenticity, 0.9, 0.85),
            ("grade", PipelineKind::Grading, 0.88, 0.8),
        ]);

        let outcome = orchestrator.submit(AnalysisRequest::new(json!({"card": 1}))).await;
        let result = outcome.result().unwrap();

        assert_eq!(result.risk_level, RiskLevel::Low);
        assert!(result.anomalies.is_empty());
        let ids: Vec<&str> = result.contributor_ids().into_iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["recog", "auth", "grade"]);
        assert!(result.expires_at > result.computed_at);
    }

    #[tokio::test]
    async fn test_counterfeit_conflict_is_flagged() {
        let orchestrator = test_setup(vec![
            ("auth", PipelineKind::Authenticity, 0.1, 0.9),
            ("grade", PipelineKind::Grading, 0.95, 0.9),
            ("center", PipelineKind::Centering, 0.9, 0.8),
        ]);

        let outcome = orchestrator.submit(AnalysisRequest::new(json!({"card": 2}))).await;
        let result = outcome.result().unwrap();

        assert!(result
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::Inconsistency { severity: Severity::Major, .. })));
        assert_ne!(result.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let built = EnsembleOrchestrator::builder(OrchestratorConfig::default())
            .register_pipeline(
                PipelineRegistration::new("dup", PipelineKind::Grading, Duration::from_secs(1)),
                Arc::new(Fixed(0.5, 0.5)),
            )
            .register_pipeline(
                PipelineRegistration::new("dup", PipelineKind::Centering, Duration::from_secs(1)),
                Arc::new(Fixed(0.5, 0.5)),
            )
            .build();

        assert!(matches!(built, Err(ConfigError::Invalid { field: "pipelines", .. })));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let orchestrator = test_setup(vec![("grade", PipelineKind::Grading, 0.7, 0.8)]);
        let payload = json!({"card": 3});

        let first = orchestrator.submit(AnalysisRequest::new(payload.clone())).await;
        let first = first.result().unwrap().clone();
        assert!(orchestrator.invalidate(&first.fingerprint));
        assert!(!orchestrator.invalidate(&first.fingerprint));

        let second = orchestrator.submit(AnalysisRequest::new(payload)).await;
        assert!(!Arc::ptr_eq(&first, second.result().unwrap()));
    }

    #[tokio::test]
    async fn test_no_pipelines_is_insufficient_data() {
        let orchestrator = test_setup(Vec::new());
        let outcome = orchestrator.submit(AnalysisRequest::new(json!({}))).await;

        assert!(outcome.is_insufficient_data());
        assert!(orchestrator.cache().is_empty());
        assert!(matches!(
            outcome.into_result(),
            Err(OrchestrationError::InsufficientData(_))
        ));
    }
}
