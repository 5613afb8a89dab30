//! Ensemble evaluation module
//!
//! Runs every registered analysis pipeline for a card concurrently,
//! reconciles their opinions and produces one verdict.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                  EnsembleOrchestrator                      │
//! │  • Fingerprint cache lookup / in-flight dedup              │
//! │  • Request ceiling                                         │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                 ExecutionCoordinator                       │
//! │  • One task per pipeline, joined on a completion channel   │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!           ┌───────────────┼───────────────┐
//!           ▼               ▼               ▼
//!     ┌───────────┐   ┌───────────┐   ┌───────────┐
//!     │   Cross   │   │ Consensus │   │   Risk    │
//!     │ Validator │   │  Engine   │   │ Assessor  │
//!     └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! # Components
//!
//! - **ExecutionCoordinator**: settle-all fan-out with per-pipeline and request timeouts
//! - **CrossValidator**: pairwise consistency rules over successful results
//! - **ConsensusEngine**: dispersion-aware weighted aggregation
//! - **RiskAssessor**: threshold mapping to a risk level and recommendation
//!
//! # Usage
//!
//! ```ignore
//! use cardeval_coordination::ensemble::EnsembleOrchestrator;
//! use cardeval_coordination::pipeline::PipelineRegistration;
//!
//! let orchestrator = EnsembleOrchestrator::builder(config)
//!     .register_pipeline(PipelineRegistration::new("grading", PipelineKind::Grading, timeout), grader)
//!     .build()?
//!     .shared();
//!
//! let outcome = orchestrator.submit(AnalysisRequest::new(payload)).await;
//! ```

pub mod consensus;
pub mod coordinator;
pub mod orchestrator;
pub mod risk;
pub mod validation;

pub use consensus::{
    combine, Consensus, ConsensusEngine, ConsensusError, ConsensusInput, ConsensusOutput,
    ConsensusResult, DEFAULT_DISPERSION_K, EPSILON_WEIGHT,
};
pub use coordinator::{ExecutionCoordinator, Settled, SharedExecutionCoordinator};
pub use orchestrator::{EnsembleOrchestrator, OrchestratorBuilder, SharedEnsembleOrchestrator};
pub use risk::{RiskAssessment, RiskAssessor, RiskInputs, RiskThresholds};
pub use validation::{
    default_rules, Condition, ConflictRule, ConsistencyRule, CrossValidator, DivergenceRule,
    Finding, PredicateRule,
};
