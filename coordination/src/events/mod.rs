//! Event-driven observation of the orchestration core
//!
//! Every step of a request publishes an [`OrchestrationEvent`] on the
//! [`EventBus`]. The performance monitor is one subscriber; an external
//! observability collaborator may subscribe alongside it.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────────┐
//! │ Orchestrator │────▶│  Event Bus   │────▶│ PerformanceMonitor   │
//! │  (publish)   │     │  (broadcast) │     │ other subscribers    │
//! └──────────────┘     └──────────────┘     └──────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cardeval_coordination::events::{EventBus, EventBusExt, EventFilter};
//!
//! let bus = EventBus::with_capacity(1024).shared();
//! let mut receiver = bus.subscribe_filtered(EventFilter::new().types(vec!["ensemble_computed"]));
//! let event = receiver.recv().await?;
//! ```

pub mod bus;
pub mod types;

// Re-export core types
pub use bus::{
    EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use types::{CacheOutcome, InvocationOutcome, OrchestrationEvent};
