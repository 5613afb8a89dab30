//! Performance monitor
//!
//! Keeps a rolling window of invocation samples per pipeline and lifetime
//! cache hit/miss counters. It runs as an actor fed by the event bus, so
//! the request path only ever publishes and never waits on it.
//!
//! ```text
//!   EventBus ──broadcast──▶ monitor task ◀──snapshot request── orchestrator
//!                               │
//!                               └──oneshot reply──▶ HealthSnapshot
//! ```
//!
//! A snapshot request first drains every event already queued on the
//! subscription, so a snapshot reflects everything published before it was
//! asked for.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{CacheOutcome, InvocationOutcome, OrchestrationEvent};
use crate::state::{CacheStats, PipelineId, PipelineKind};

/// One adapter invocation as seen by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub pipeline_id: PipelineId,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    pub outcome: InvocationOutcome,
}

/// Rolling health of one pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub kind: Option<PipelineKind>,
    /// Samples inside the window
    pub samples: usize,
    /// 1.0 when the window is empty
    pub success_rate: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub failures: usize,
    pub timeouts: usize,
}

/// Cache counters plus derived hit rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHealth {
    pub size: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    /// hits / (hits + misses + coalesced)
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
}

/// Point-in-time view for the observability collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub per_pipeline: BTreeMap<PipelineId, PipelineHealth>,
    pub cache: CacheHealth,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PipelineWindow {
    kind: Option<PipelineKind>,
    samples: VecDeque<PerformanceSample>,
}

/// Rolling aggregates. Append and prune only.
#[derive(Debug)]
pub struct PerformanceMonitor {
    window: Duration,
    max_samples: usize,
    pipelines: HashMap<PipelineId, PipelineWindow>,
    hits: u64,
    misses: u64,
    coalesced: u64,
}

impl PerformanceMonitor {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            window,
            max_samples: max_samples.max(1),
            pipelines: HashMap::new(),
            hits: 0,
            misses: 0,
            coalesced: 0,
        }
    }

    /// Pre-register pipelines so they show up before their first sample
    pub fn with_pipelines(
        mut self,
        pipelines: impl IntoIterator<Item = (PipelineId, PipelineKind)>,
    ) -> Self {
        for (id, kind) in pipelines {
            self.pipelines.entry(id).or_default().kind = Some(kind);
        }
        self
    }

    pub fn record_sample(&mut self, sample: PerformanceSample, kind: Option<PipelineKind>) {
        let window = self.pipelines.entry(sample.pipeline_id.clone()).or_default();
        if kind.is_some() {
            window.kind = kind;
        }
        window.samples.push_back(sample);
        while window.samples.len() > self.max_samples {
            window.samples.pop_front();
        }
    }

    pub fn record_cache(&mut self, outcome: CacheOutcome) {
        match outcome {
            CacheOutcome::Hit => self.hits += 1,
            CacheOutcome::Miss => self.misses += 1,
            CacheOutcome::Coalesced => self.coalesced += 1,
        }
    }

    /// Fold one bus event into the aggregates; other event types are ignored
    pub fn observe(&mut self, event: &OrchestrationEvent) {
        match event {
            OrchestrationEvent::PipelineCompleted {
                pipeline_id,
                kind,
                latency_ms,
                outcome,
                timestamp,
                ..
            } => self.record_sample(
                PerformanceSample {
                    pipeline_id: pipeline_id.clone(),
                    timestamp: *timestamp,
                    latency_ms: *latency_ms,
                    outcome: *outcome,
                },
                Some(*kind),
            ),
            OrchestrationEvent::CacheAccessed { outcome, .. } => self.record_cache(*outcome),
            _ => {}
        }
    }

    /// Drop samples older than the window relative to `now`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return;
        };
        for pipeline in self.pipelines.values_mut() {
            while pipeline
                .samples
                .front()
                .is_some_and(|s| s.timestamp < cutoff)
            {
                pipeline.samples.pop_front();
            }
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Prune to `now` and summarize
    pub fn snapshot(&mut self, now: DateTime<Utc>, cache: CacheStats) -> HealthSnapshot {
        self.prune(now);

        let per_pipeline = self
            .pipelines
            .iter()
            .map(|(id, window)| (id.clone(), summarize(window)))
            .collect();

        HealthSnapshot {
            per_pipeline,
            cache: CacheHealth {
                size: cache.size,
                in_flight: cache.in_flight,
                hits: self.hits,
                misses: self.misses,
                coalesced: self.coalesced,
                hit_rate: self.hit_rate(),
                evictions: cache.evictions,
                expirations: cache.expirations,
                corruptions: cache.corruptions,
            },
            taken_at: now,
        }
    }
}

fn summarize(window: &PipelineWindow) -> PipelineHealth {
    let samples = window.samples.len();
    let mut latencies: Vec<u64> = window.samples.iter().map(|s| s.latency_ms).collect();
    latencies.sort_unstable();

    let count = |wanted: InvocationOutcome| {
        window
            .samples
            .iter()
            .filter(|s| s.outcome == wanted)
            .count()
    };
    let successes = count(InvocationOutcome::Success);

    PipelineHealth {
        kind: window.kind,
        samples,
        success_rate: if samples == 0 {
            1.0
        } else {
            successes as f64 / samples as f64
        },
        p50_ms: nearest_rank(&latencies, 50),
        p95_ms: nearest_rank(&latencies, 95),
        failures: count(InvocationOutcome::Failure),
        timeouts: count(InvocationOutcome::Timeout),
    }
}

/// Nearest-rank percentile of a sorted slice; 0 when empty
fn nearest_rank(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

enum MonitorCommand {
    Snapshot {
        cache: CacheStats,
        reply: oneshot::Sender<HealthSnapshot>,
    },
}

/// Handle on a running monitor task
#[derive(Debug)]
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for MonitorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorCommand::Snapshot { .. } => f.write_str("Snapshot"),
        }
    }
}

impl MonitorHandle {
    /// Spawn the monitor task on the current runtime
    pub fn spawn(
        monitor: PerformanceMonitor,
        events: broadcast::Receiver<OrchestrationEvent>,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(16);
        let task = tokio::spawn(run(monitor, events, receiver));
        Self { commands, task }
    }

    /// Ask the monitor for a snapshot. `None` if the task has stopped.
    pub async fn snapshot(&self, cache: CacheStats) -> Option<HealthSnapshot> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(MonitorCommand::Snapshot { cache, reply })
            .await
            .ok()?;
        response.await.ok()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut monitor: PerformanceMonitor,
    mut events: broadcast::Receiver<OrchestrationEvent>,
    mut commands: mpsc::Receiver<MonitorCommand>,
) {
    debug!("Performance monitor started");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => monitor.observe(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Performance monitor lagged; samples dropped");
                }
                Err(RecvError::Closed) => break,
            },
            command = commands.recv() => match command {
                Some(MonitorCommand::Snapshot { cache, reply }) => {
                    drain(&mut monitor, &mut events);
                    let _ = reply.send(monitor.snapshot(Utc::now(), cache));
                }
                None => break,
            },
        }
    }
    debug!("Performance monitor stopped");
}

fn drain(monitor: &mut PerformanceMonitor, events: &mut broadcast::Receiver<OrchestrationEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => monitor.observe(&event),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Performance monitor lagged; samples dropped");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::Fingerprint;

    fn sample(id: &str, latency_ms: u64, outcome: InvocationOutcome, at: DateTime<Utc>) -> PerformanceSample {
        PerformanceSample {
            pipeline_id: id.into(),
            timestamp: at,
            latency_ms,
            outcome,
        }
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let sorted: Vec<u64> = (1..=20).collect();
        assert_eq!(nearest_rank(&sorted, 50), 10);
        assert_eq!(nearest_rank(&sorted, 95), 19);
        assert_eq!(nearest_rank(&[7], 95), 7);
        assert_eq!(nearest_rank(&[], 50), 0);
    }

    #[test]
    fn test_success_rate_and_counts() {
        let now = Utc::now();
        let mut monitor = PerformanceMonitor::new(Duration::from_secs(300), 1024);
        monitor.record_sample(sample("g", 10, InvocationOutcome::Success, now), None);
        monitor.record_sample(sample("g", 20, InvocationOutcome::Success, now), None);
        monitor.record_sample(sample("g", 30, InvocationOutcome::Failure, now), None);
        monitor.record_sample(sample("g", 40, InvocationOutcome::Timeout, now), None);

        let snapshot = monitor.snapshot(now, CacheStats::default());
        let health = &snapshot.per_pipeline[&PipelineId::from("g")];
        assert_eq!(health.samples, 4);
        assert_eq!(health.success_rate, 0.5);
        assert_eq!(health.failures, 1);
        assert_eq!(health.timeouts, 1);
        assert_eq!(health.p50_ms, 20);
        assert_eq!(health.p95_ms, 40);
    }

    #[test]
    fn test_prune_drops_old_samples() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(600);
        let mut monitor = PerformanceMonitor::new(Duration::from_secs(300), 1024)
            .with_pipelines([(PipelineId::from("g"), PipelineKind::Grading)]);
        monitor.record_sample(sample("g", 500, InvocationOutcome::Failure, old), None);
        monitor.record_sample(sample("g", 5, InvocationOutcome::Success, now), None);

        let snapshot = monitor.snapshot(now, CacheStats::default());
        let health = &snapshot.per_pipeline[&PipelineId::from("g")];
        assert_eq!(health.samples, 1);
        assert_eq!(health.success_rate, 1.0);
        assert_eq!(health.kind, Some(PipelineKind::Grading));
    }

    #[test]
    fn test_sample_cap() {
        let now = Utc::now();
        let mut monitor = PerformanceMonitor::new(Duration::from_secs(300), 3);
        for latency in 0..10 {
            monitor.record_sample(sample("g", latency, InvocationOutcome::Success, now), None);
        }
        let snapshot = monitor.snapshot(now, CacheStats::default());
        assert_eq!(snapshot.per_pipeline[&PipelineId::from("g")].samples, 3);
    }

    #[test]
    fn test_empty_window_is_healthy() {
        let mut monitor = PerformanceMonitor::new(Duration::from_secs(300), 16)
            .with_pipelines([(PipelineId::from("idle"), PipelineKind::Centering)]);
        let snapshot = monitor.snapshot(Utc::now(), CacheStats::default());
        let health = &snapshot.per_pipeline[&PipelineId::from("idle")];

        assert_eq!(health.samples, 0);
        assert_eq!(health.success_rate, 1.0);
        assert_eq!(snapshot.cache.hit_rate, 0.0);
    }

    #[test]
    fn test_hit_rate_counts_coalesced() {
        let mut monitor = PerformanceMonitor::new(Duration::from_secs(300), 16);
        monitor.record_cache(CacheOutcome::Hit);
        monitor.record_cache(CacheOutcome::Miss);
        monitor.record_cache(CacheOutcome::Coalesced);
        monitor.record_cache(CacheOutcome::Hit);
        assert_eq!(monitor.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_actor_reflects_published_events() {
        let bus = EventBus::new();
        let handle = MonitorHandle::spawn(
            PerformanceMonitor::new(Duration::from_secs(300), 16),
            bus.subscribe(),
        );

        bus.publish(OrchestrationEvent::CacheAccessed {
            fingerprint: Fingerprint::new("fp"),
            outcome: CacheOutcome::Miss,
            timestamp: Utc::now(),
        });
        bus.publish(OrchestrationEvent::PipelineCompleted {
            request_id: "r".to_string(),
            fingerprint: Fingerprint::new("fp"),
            pipeline_id: "grading".into(),
            kind: PipelineKind::Grading,
            latency_ms: 42,
            outcome: InvocationOutcome::Success,
            timestamp: Utc::now(),
        });

        let snapshot = handle.snapshot(CacheStats::default()).await.unwrap();
        assert_eq!(snapshot.cache.misses, 1);
        assert_eq!(snapshot.per_pipeline[&PipelineId::from("grading")].p50_ms, 42);
    }
}
