//! Event types for evaluation orchestration
//!
//! Published on the [`EventBus`](super::EventBus) at every step of a
//! request. The performance monitor consumes them; other observers may
//! subscribe as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{Fingerprint, PipelineId, PipelineKind, PipelineResult, RiskLevel};

/// How one pipeline invocation settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    Failure,
    Timeout,
}

impl InvocationOutcome {
    pub fn of(result: &PipelineResult) -> Self {
        match &result.error {
            None => Self::Success,
            Some(e) if e.is_timeout() => Self::Timeout,
            Some(_) => Self::Failure,
        }
    }
}

impl std::fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationOutcome::Success => write!(f, "success"),
            InvocationOutcome::Failure => write!(f, "failure"),
            InvocationOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

/// How a cache access resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Joined another caller's in-flight computation
    Coalesced,
}

impl std::fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheOutcome::Hit => write!(f, "hit"),
            CacheOutcome::Miss => write!(f, "miss"),
            CacheOutcome::Coalesced => write!(f, "coalesced"),
        }
    }
}

/// All orchestration events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A request entered `submit`
    RequestSubmitted {
        request_id: String,
        fingerprint: Fingerprint,
        timestamp: DateTime<Utc>,
    },

    /// The fingerprint cache was consulted
    CacheAccessed {
        fingerprint: Fingerprint,
        outcome: CacheOutcome,
        timestamp: DateTime<Utc>,
    },

    /// One adapter invocation settled (including ceiling timeouts)
    PipelineCompleted {
        request_id: String,
        fingerprint: Fingerprint,
        pipeline_id: PipelineId,
        kind: PipelineKind,
        latency_ms: u64,
        outcome: InvocationOutcome,
        timestamp: DateTime<Utc>,
    },

    /// An ensemble verdict was produced
    EnsembleComputed {
        request_id: String,
        fingerprint: Fingerprint,
        aggregate_score: f64,
        aggregate_confidence: f64,
        dispersion: f64,
        risk_level: RiskLevel,
        contributors: usize,
        timestamp: DateTime<Utc>,
    },

    /// No pipeline survived
    InsufficientData {
        request_id: String,
        fingerprint: Fingerprint,
        attempted: usize,
        timestamp: DateTime<Utc>,
    },

    /// Waiting on another caller's computation exceeded the ceiling
    LockTimedOut {
        request_id: String,
        fingerprint: Fingerprint,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A cached result was explicitly dropped
    CacheInvalidated {
        fingerprint: Fingerprint,
        existed: bool,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    /// Get the event timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestrationEvent::RequestSubmitted { timestamp, .. } => *timestamp,
            OrchestrationEvent::CacheAccessed { timestamp, .. } => *timestamp,
            OrchestrationEvent::PipelineCompleted { timestamp, .. } => *timestamp,
            OrchestrationEvent::EnsembleComputed { timestamp, .. } => *timestamp,
            OrchestrationEvent::InsufficientData { timestamp, .. } => *timestamp,
            OrchestrationEvent::LockTimedOut { timestamp, .. } => *timestamp,
            OrchestrationEvent::CacheInvalidated { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            OrchestrationEvent::RequestSubmitted { .. } => "request_submitted",
            OrchestrationEvent::CacheAccessed { .. } => "cache_accessed",
            OrchestrationEvent::PipelineCompleted { .. } => "pipeline_completed",
            OrchestrationEvent::EnsembleComputed { .. } => "ensemble_computed",
            OrchestrationEvent::InsufficientData { .. } => "insufficient_data",
            OrchestrationEvent::LockTimedOut { .. } => "lock_timed_out",
            OrchestrationEvent::CacheInvalidated { .. } => "cache_invalidated",
        }
    }

    /// Every event is scoped to a fingerprint
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            OrchestrationEvent::RequestSubmitted { fingerprint, .. }
            | OrchestrationEvent::CacheAccessed { fingerprint, .. }
            | OrchestrationEvent::PipelineCompleted { fingerprint, .. }
            | OrchestrationEvent::EnsembleComputed { fingerprint, .. }
            | OrchestrationEvent::InsufficientData { fingerprint, .. }
            | OrchestrationEvent::LockTimedOut { fingerprint, .. }
            | OrchestrationEvent::CacheInvalidated { fingerprint, .. } => fingerprint,
        }
    }

    /// Get the request ID if this event is request-scoped
    pub fn request_id(&self) -> Option<&str> {
        match self {
            OrchestrationEvent::RequestSubmitted { request_id, .. }
            | OrchestrationEvent::PipelineCompleted { request_id, .. }
            | OrchestrationEvent::EnsembleComputed { request_id, .. }
            | OrchestrationEvent::InsufficientData { request_id, .. }
            | OrchestrationEvent::LockTimedOut { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PipelineError;

    #[test]
    fn test_event_serialization() {
        let event = OrchestrationEvent::CacheAccessed {
            fingerprint: Fingerprint::new("fp-1"),
            outcome: CacheOutcome::Coalesced,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"cache_accessed\""));
        assert!(json.contains("\"outcome\":\"coalesced\""));

        let parsed: OrchestrationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "cache_accessed");
    }

    #[test]
    fn test_event_accessors() {
        let event = OrchestrationEvent::PipelineCompleted {
            request_id: "req-1".to_string(),
            fingerprint: Fingerprint::new("fp-1"),
            pipeline_id: "grading".into(),
            kind: PipelineKind::Grading,
            latency_ms: 120,
            outcome: InvocationOutcome::Success,
            timestamp: Utc::now(),
        };

        assert_eq!(event.request_id(), Some("req-1"));
        assert_eq!(event.fingerprint().as_str(), "fp-1");
        assert_eq!(event.event_type(), "pipeline_completed");
    }

    #[test]
    fn test_invocation_outcome_of_result() {
        let timeout = PipelineResult::failed(
            "a".into(),
            PipelineKind::Recognition,
            PipelineError::Timeout { timeout_ms: 10 },
            10,
        );
        let failure = PipelineResult::failed(
            "a".into(),
            PipelineKind::Recognition,
            PipelineError::failure("boom"),
            1,
        );
        assert_eq!(InvocationOutcome::of(&timeout), InvocationOutcome::Timeout);
        assert_eq!(InvocationOutcome::of(&failure), InvocationOutcome::Failure);
    }
}
