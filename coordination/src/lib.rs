//! Card Evaluation Orchestration Library
//!
//! This library provides the orchestration core for evaluating trading
//! cards with several independent analysis pipelines:
//! - Content-fingerprint cache with TTL, LRU bound and at-most-one
//!   in-flight computation per fingerprint
//! - Concurrent fan-out to every registered pipeline, tolerating partial failure
//! - Pairwise cross-validation of pipeline opinions
//! - Dispersion-aware weighted consensus and risk assessment
//! - Event bus and rolling performance monitor
//!
//! # Usage
//!
//! ```bash
//! # Evaluate a payload against the HTTP pipelines declared in a config file
//! cardeval evaluate --config cardeval.toml --payload card.json
//!
//! # Print the content fingerprint of a payload
//! cardeval fingerprint --payload card.json
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod ensemble;
pub mod error;
pub mod events;
pub mod monitor;
pub mod pipeline;
pub mod state;

// Re-export configuration types
pub use config::{ConfigError, ConfigFile, ConfigResult, OrchestratorConfig, PipelineConfig};

// Re-export error taxonomy
pub use error::{ErrorKind, OrchestrationError, OrchestrationResult};

// Re-export key ensemble types
pub use ensemble::{
    ConsensusEngine, CrossValidator, EnsembleOrchestrator, ExecutionCoordinator,
    OrchestratorBuilder, RiskAssessor, RiskThresholds, SharedEnsembleOrchestrator,
};

// Re-export key event types
pub use events::{EventBus, OrchestrationEvent, SharedEventBus};

// Re-export monitor types
pub use monitor::{CacheHealth, HealthSnapshot, PerformanceMonitor, PipelineHealth};

// Re-export pipeline contract
pub use pipeline::{
    AccuracyFactorProvider, AnalysisPipeline, FixedAccuracy, HttpPipeline, PipelineAdapter,
    PipelineFault, PipelineOutput, PipelineRegistration, SharedPipelineAdapter,
};

// Re-export key state types
pub use state::{
    AnalysisRequest, Anomaly, ConsistencyAnnotation, EnsembleResult, Fingerprint,
    FingerprintCache, InsufficientDataReport, PipelineContribution, PipelineError, PipelineId,
    PipelineKind, PipelineResult, RiskLevel, Severity, SubmitOutcome,
};
