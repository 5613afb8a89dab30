//! Execution coordinator - fan-out/fan-in over registered pipelines
//!
//! One task per applicable adapter is spawned onto the runtime. Each task
//! reports on a completion channel; the coordinator collects until every
//! task has reported or the request ceiling passes. Anything still pending
//! at the ceiling is aborted and recorded as timed out. A failing adapter
//! never cancels the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{InvocationOutcome, OrchestrationEvent, SharedEventBus};
use crate::pipeline::SharedPipelineAdapter;
use crate::state::{AnalysisRequest, PipelineError, PipelineResult};

/// Aborts every still-running pipeline task when dropped, including when
/// the caller's future is cancelled mid-join
struct AbortOnDrop(Vec<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// One fan-out after every selected pipeline has settled
#[derive(Debug, Clone)]
pub struct Settled {
    /// One result per selected adapter, in registration order
    pub results: Vec<PipelineResult>,
    /// Whether the request ceiling abandoned any pipeline
    pub cut_at_ceiling: bool,
}

/// Shared reference to ExecutionCoordinator
pub type SharedExecutionCoordinator = Arc<ExecutionCoordinator>;

/// Runs every applicable pipeline for a request concurrently
pub struct ExecutionCoordinator {
    adapters: Vec<SharedPipelineAdapter>,
    event_bus: SharedEventBus,
}

impl ExecutionCoordinator {
    /// Create a coordinator over adapters in registration order
    pub fn new(adapters: Vec<SharedPipelineAdapter>, event_bus: SharedEventBus) -> Self {
        Self {
            adapters,
            event_bus,
        }
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedExecutionCoordinator {
        Arc::new(self)
    }

    pub fn adapters(&self) -> &[SharedPipelineAdapter] {
        &self.adapters
    }

    /// Adapters the request asks for; unknown requested ids are logged and skipped
    fn select(&self, request: &AnalysisRequest) -> Vec<SharedPipelineAdapter> {
        for requested in &request.requested_pipelines {
            if !self.adapters.iter().any(|a| a.id() == requested) {
                warn!(
                    request_id = %request.request_id,
                    pipeline = %requested,
                    "Requested pipeline is not registered; skipping"
                );
            }
        }

        self.adapters
            .iter()
            .filter(|a| request.wants(a.id()))
            .cloned()
            .collect()
    }

    /// Invoke every applicable adapter and join, bounded by `ceiling`.
    ///
    /// Always returns one result per selected adapter, in registration order.
    pub async fn run_all(&self, request: &AnalysisRequest, ceiling: Duration) -> Vec<PipelineResult> {
        self.settle(request, ceiling).await.results
    }

    /// Like [`run_all`](Self::run_all), also reporting whether the ceiling
    /// cut any pipeline off
    pub async fn settle(&self, request: &AnalysisRequest, ceiling: Duration) -> Settled {
        let selected = self.select(request);
        if selected.is_empty() {
            warn!(request_id = %request.request_id, "No pipelines selected");
            return Settled {
                results: Vec::new(),
                cut_at_ceiling: false,
            };
        }

        let started = Instant::now();
        let deadline = started + ceiling;
        let (tx, mut rx) = mpsc::channel::<(usize, PipelineResult)>(selected.len());

        let tasks = AbortOnDrop(
            selected
                .iter()
                .enumerate()
                .map(|(slot, adapter)| {
                    let adapter = Arc::clone(adapter);
                    let payload = Arc::clone(&request.payload);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = adapter.invoke(&payload, adapter.timeout()).await;
                        let _ = tx.send((slot, result)).await;
                    })
                })
                .collect(),
        );
        drop(tx);

        debug!(
            request_id = %request.request_id,
            pipelines = selected.len(),
            ceiling_ms = ceiling.as_millis() as u64,
            "Dispatched pipelines"
        );

        let mut slots: Vec<Option<PipelineResult>> = vec![None; selected.len()];
        let mut received = 0;
        let mut ceiling_hit = false;
        while received < selected.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((slot, result))) => {
                    slots[slot] = Some(result);
                    received += 1;
                }
                // Every sender is gone; remaining tasks died without reporting
                Ok(None) => break,
                Err(_elapsed) => {
                    ceiling_hit = true;
                    break;
                }
            }
        }

        drop(tasks);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let results: Vec<PipelineResult> = slots
            .into_iter()
            .zip(&selected)
            .map(|(slot, adapter)| {
                slot.unwrap_or_else(|| {
                    let error = if ceiling_hit {
                        warn!(
                            request_id = %request.request_id,
                            pipeline = %adapter.id(),
                            ceiling_ms = ceiling.as_millis() as u64,
                            "Pipeline abandoned at request ceiling"
                        );
                        PipelineError::Timeout {
                            timeout_ms: ceiling.as_millis() as u64,
                        }
                    } else {
                        warn!(
                            request_id = %request.request_id,
                            pipeline = %adapter.id(),
                            "Pipeline task ended without reporting"
                        );
                        PipelineError::failure("pipeline task terminated")
                    };
                    PipelineResult::failed(adapter.id().clone(), adapter.kind(), error, elapsed_ms)
                        .with_accuracy_factor(adapter.registration().accuracy_factor())
                })
            })
            .collect();

        for result in &results {
            self.event_bus.publish(OrchestrationEvent::PipelineCompleted {
                request_id: request.request_id.clone(),
                fingerprint: request.fingerprint.clone(),
                pipeline_id: result.pipeline_id.clone(),
                kind: result.kind,
                latency_ms: result.latency_ms,
                outcome: InvocationOutcome::of(result),
                timestamp: Utc::now(),
            });
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            request_id = %request.request_id,
            fingerprint = %request.fingerprint,
            succeeded = results.len() - failed,
            failed,
            elapsed_ms,
            ceiling_hit,
            "Pipelines settled"
        );

        Settled {
            results,
            cut_at_ceiling: ceiling_hit,
        }
    }
}
