//! Evaluation state: the data model and the fingerprint cache
//!
//! The fingerprint cache and its in-flight table are the only state shared
//! across requests. Everything else lives for the duration of one request.
//!
//! # Usage
//!
//! ```ignore
//! use cardeval_coordination::state::{CacheAccess, FingerprintCache};
//!
//! let cache = FingerprintCache::new(10_000, Duration::from_secs(900)).shared();
//!
//! match cache.access(&request.fingerprint) {
//!     CacheAccess::Hit(result) => return result,
//!     CacheAccess::InFlight(waiter) => waiter.wait(ceiling).await,
//!     CacheAccess::Acquired(lock) => {
//!         let outcome = compute().await;
//!         lock.complete(outcome, cache.default_ttl());
//!     }
//! }
//! ```

pub mod cache;
pub mod types;

pub use cache::{
    Acquisition, CacheAccess, CacheEntry, CacheStats, ComputationLock, FingerprintCache,
    InFlightWaiter, Lookup, SharedFingerprintCache, WaitOutcome,
};
pub use types::{
    AnalysisRequest, Anomaly, ConsistencyAnnotation, EnsembleResult, Fingerprint,
    InsufficientDataReport, Payload, PipelineContribution, PipelineError, PipelineId,
    PipelineKind, PipelineResult, RiskLevel, Severity, SubmitOutcome,
};
