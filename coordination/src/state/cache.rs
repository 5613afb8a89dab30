//! Fingerprint cache with in-flight computation locks
//!
//! Completed ensemble results are kept per fingerprint with a TTL and a
//! least-recently-used bound. Alongside the entries sits the in-flight
//! table: at most one computation per fingerprint may hold a
//! [`ComputationLock`]; everyone else racing on that fingerprint gets an
//! [`InFlightWaiter`] and receives the same outcome when the holder
//! completes.
//!
//! Entries, recency order and the in-flight table share one mutex so that
//! "check cache, then claim the computation" is a single atomic step.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::OrchestrationError;
use crate::state::{EnsembleResult, Fingerprint, SubmitOutcome};

/// Shared reference to FingerprintCache
pub type SharedFingerprintCache = Arc<FingerprintCache>;

/// A cached result plus its expiry bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: Arc<EnsembleResult>,
    pub expires_at: Instant,
    last_access: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of a plain lookup
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(Arc<EnsembleResult>),
    Miss,
}

/// Outcome of trying to claim a computation
#[derive(Debug)]
pub enum Acquisition {
    Acquired(ComputationLock),
    AlreadyInFlight(InFlightWaiter),
}

/// Outcome of the combined lookup-or-claim step used on the request path
#[derive(Debug)]
pub enum CacheAccess {
    Hit(Arc<EnsembleResult>),
    Acquired(ComputationLock),
    InFlight(InFlightWaiter),
}

/// Counters kept by the cache itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub in_flight: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
}

struct InFlight {
    token: u64,
    sender: watch::Sender<Option<SubmitOutcome>>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// access tick -> fingerprint, oldest first
    recency: BTreeMap<u64, Fingerprint>,
    tick: u64,
    in_flight: HashMap<Fingerprint, InFlight>,
    next_token: u64,
    evictions: u64,
    expirations: u64,
    corruptions: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove_entry(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.recency.remove(&entry.last_access);
        Some(entry)
    }

    /// Lazily expire or reject a corrupted entry, bumping recency on a hit
    fn lookup(&mut self, fingerprint: &Fingerprint, now: Instant) -> Lookup {
        let state = match self.entries.get(fingerprint) {
            None => return Lookup::Miss,
            Some(entry) if entry.is_expired(now) => EntryState::Expired,
            Some(entry) => match validate_entry(fingerprint, entry) {
                Ok(()) => EntryState::Fresh,
                Err(e) => EntryState::Corrupt(e),
            },
        };

        match state {
            EntryState::Expired => {
                self.remove_entry(fingerprint);
                self.expirations += 1;
                debug!(fingerprint = %fingerprint, "Cache entry expired");
                Lookup::Miss
            }
            EntryState::Corrupt(e) => {
                self.remove_entry(fingerprint);
                self.corruptions += 1;
                warn!(fingerprint = %fingerprint, "{}", e);
                Lookup::Miss
            }
            EntryState::Fresh => {
                let tick = self.next_tick();
                let Some(entry) = self.entries.get_mut(fingerprint) else {
                    return Lookup::Miss;
                };
                let old = std::mem::replace(&mut entry.last_access, tick);
                let result = entry.result.clone();
                self.recency.remove(&old);
                self.recency.insert(tick, fingerprint.clone());
                Lookup::Hit(result)
            }
        }
    }

    fn insert(
        &mut self,
        fingerprint: Fingerprint,
        result: Arc<EnsembleResult>,
        expires_at: Instant,
        max_entries: usize,
    ) {
        self.remove_entry(&fingerprint);
        let tick = self.next_tick();
        self.recency.insert(tick, fingerprint.clone());
        self.entries.insert(
            fingerprint,
            CacheEntry {
                result,
                expires_at,
                last_access: tick,
            },
        );

        while self.entries.len() > max_entries {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
            debug!(fingerprint = %oldest, "Evicted least recently used entry");
        }
    }

    /// Claim a fresh token, or subscribe to the computation already running
    fn claim(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<u64, watch::Receiver<Option<SubmitOutcome>>> {
        if let Some(existing) = self.in_flight.get(fingerprint) {
            return Err(existing.sender.subscribe());
        }
        self.next_token += 1;
        let token = self.next_token;
        let (sender, _) = watch::channel(None);
        self.in_flight
            .insert(fingerprint.clone(), InFlight { token, sender });
        Ok(token)
    }

    /// Remove the in-flight marker only if it still belongs to `token`
    fn release(&mut self, fingerprint: &Fingerprint, token: u64) -> Option<InFlight> {
        match self.in_flight.get(fingerprint) {
            Some(flight) if flight.token == token => self.in_flight.remove(fingerprint),
            _ => None,
        }
    }
}

enum EntryState {
    Fresh,
    Expired,
    Corrupt(OrchestrationError),
}

fn validate_entry(fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), OrchestrationError> {
    if &entry.result.fingerprint != fingerprint {
        return Err(OrchestrationError::CacheCorruption {
            fingerprint: fingerprint.clone(),
            reason: format!("entry belongs to {}", entry.result.fingerprint),
        });
    }
    if !entry.result.is_well_formed() {
        return Err(OrchestrationError::CacheCorruption {
            fingerprint: fingerprint.clone(),
            reason: "aggregate fields out of range".to_string(),
        });
    }
    Ok(())
}

/// Content-addressed store of completed ensemble results
pub struct FingerprintCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    default_ttl: Duration,
}

impl FingerprintCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    /// Create a shared reference to this cache
    pub fn shared(self) -> SharedFingerprintCache {
        Arc::new(self)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch a fresh result, expiring or discarding the entry if needed
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        self.lock().lookup(fingerprint, Instant::now())
    }

    /// Claim the computation for `fingerprint`, or join the one in flight
    pub fn try_acquire_computation(self: &Arc<Self>, fingerprint: &Fingerprint) -> Acquisition {
        let mut inner = self.lock();
        match inner.claim(fingerprint) {
            Ok(token) => Acquisition::Acquired(self.lock_for(fingerprint, token)),
            Err(receiver) => Acquisition::AlreadyInFlight(InFlightWaiter {
                fingerprint: fingerprint.clone(),
                receiver,
            }),
        }
    }

    /// Lookup and claim in one atomic step
    pub fn access(self: &Arc<Self>, fingerprint: &Fingerprint) -> CacheAccess {
        let mut inner = self.lock();
        if let Lookup::Hit(result) = inner.lookup(fingerprint, Instant::now()) {
            return CacheAccess::Hit(result);
        }
        match inner.claim(fingerprint) {
            Ok(token) => CacheAccess::Acquired(self.lock_for(fingerprint, token)),
            Err(receiver) => CacheAccess::InFlight(InFlightWaiter {
                fingerprint: fingerprint.clone(),
                receiver,
            }),
        }
    }

    fn lock_for(self: &Arc<Self>, fingerprint: &Fingerprint, token: u64) -> ComputationLock {
        ComputationLock {
            cache: Arc::downgrade(self),
            fingerprint: fingerprint.clone(),
            token,
            completed: false,
        }
    }

    /// Store a result under `fingerprint` for `ttl`
    pub fn store(&self, fingerprint: Fingerprint, result: Arc<EnsembleResult>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.lock()
            .insert(fingerprint, result, expires_at, self.max_entries);
    }

    /// Drop the entry for `fingerprint`; returns whether one existed
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.lock().remove_entry(fingerprint).is_some();
        if removed {
            debug!(fingerprint = %fingerprint, "Cache entry invalidated");
        }
        removed
    }

    /// Remove every expired entry; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(fp, _)| fp.clone())
            .collect();

        for fingerprint in &expired {
            inner.remove_entry(fingerprint);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// Periodically sweep expired entries until the cache is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().in_flight.contains_key(fingerprint)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            size: inner.entries.len(),
            in_flight: inner.in_flight.len(),
            evictions: inner.evictions,
            expirations: inner.expirations,
            corruptions: inner.corruptions,
        }
    }
}

/// Exclusive right to compute the result for one fingerprint.
///
/// Completing it publishes the outcome to every waiter and, for an
/// evaluated result, stores it. Dropping it uncompleted releases the
/// marker and wakes waiters with nothing so they retry.
#[derive(Debug)]
pub struct ComputationLock {
    cache: Weak<FingerprintCache>,
    fingerprint: Fingerprint,
    token: u64,
    completed: bool,
}

impl ComputationLock {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Publish the outcome, caching it if it is an evaluated result
    pub fn complete(self, outcome: SubmitOutcome, ttl: Duration) {
        self.finish(outcome, Some(ttl));
    }

    /// Publish the outcome to waiters without storing it
    pub fn complete_uncached(self, outcome: SubmitOutcome) {
        self.finish(outcome, None);
    }

    fn finish(mut self, outcome: SubmitOutcome, ttl: Option<Duration>) {
        self.completed = true;
        let Some(cache) = self.cache.upgrade() else {
            return;
        };

        let mut inner = cache.lock();
        if let (SubmitOutcome::Evaluated(result), Some(ttl)) = (&outcome, ttl) {
            let expires_at = Instant::now() + ttl;
            inner.insert(
                self.fingerprint.clone(),
                result.clone(),
                expires_at,
                cache.max_entries,
            );
        }
        if let Some(flight) = inner.release(&self.fingerprint, self.token) {
            flight.sender.send_replace(Some(outcome));
        }
    }
}

impl Drop for ComputationLock {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            if cache.lock().release(&self.fingerprint, self.token).is_some() {
                warn!(fingerprint = %self.fingerprint, "In-flight computation abandoned");
            }
        }
    }
}

/// How waiting on someone else's computation ended
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Completed(SubmitOutcome),
    /// The holder went away without publishing; retry
    Abandoned,
    TimedOut,
}

/// Handle on another caller's in-flight computation
#[derive(Debug)]
pub struct InFlightWaiter {
    fingerprint: Fingerprint,
    receiver: watch::Receiver<Option<SubmitOutcome>>,
}

impl InFlightWaiter {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Suspend until the holder publishes, abandons, or `timeout` elapses
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        let waited = tokio::time::timeout(timeout, self.receiver.wait_for(|v| v.is_some())).await;
        match waited {
            Ok(Ok(value)) => match value.clone() {
                Some(outcome) => WaitOutcome::Completed(outcome),
                None => WaitOutcome::Abandoned,
            },
            Ok(Err(_closed)) => WaitOutcome::Abandoned,
            Err(_elapsed) => WaitOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PipelineContribution, PipelineKind, RiskLevel};
    use chrono::Utc;

    fn result_for(fingerprint: &Fingerprint, score: f64) -> Arc<EnsembleResult> {
        Arc::new(EnsembleResult {
            fingerprint: fingerprint.clone(),
            aggregate_score: score,
            aggregate_confidence: 0.8,
            dispersion: 0.0,
            contributing_pipelines: vec![PipelineContribution {
                pipeline_id: "grading".into(),
                kind: PipelineKind::Grading,
                score,
                confidence: 0.8,
                weight: 0.8,
                normalized_weight: 1.0,
            }],
            anomalies: vec![],
            risk_level: RiskLevel::Low,
            recommendation: "ok".to_string(),
            computed_at: Utc::now(),
            expires_at: Utc::now(),
        })
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::new(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_lookup_and_ttl_expiry() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60));
        cache.store(fp("a"), result_for(&fp("a"), 0.7), Duration::from_secs(60));

        assert!(matches!(cache.lookup(&fp("a")), Lookup::Hit(_)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(cache.lookup(&fp("a")), Lookup::Miss));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_recent_access() {
        let cache = FingerprintCache::new(2, Duration::from_secs(60));
        let ttl = Duration::from_secs(60);
        cache.store(fp("a"), result_for(&fp("a"), 0.1), ttl);
        cache.store(fp("b"), result_for(&fp("b"), 0.2), ttl);

        // Touch "a" so "b" becomes least recently used
        assert!(matches!(cache.lookup(&fp("a")), Lookup::Hit(_)));
        cache.store(fp("c"), result_for(&fp("c"), 0.3), ttl);

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.lookup(&fp("a")), Lookup::Hit(_)));
        assert!(matches!(cache.lookup(&fp("b")), Lookup::Miss));
        assert!(matches!(cache.lookup(&fp("c")), Lookup::Hit(_)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_store_replaces_single_entry() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60));
        let ttl = Duration::from_secs(60);
        cache.store(fp("a"), result_for(&fp("a"), 0.1), ttl);
        cache.store(fp("a"), result_for(&fp("a"), 0.9), ttl);

        assert_eq!(cache.len(), 1);
        match cache.lookup(&fp("a")) {
            Lookup::Hit(r) => assert_eq!(r.aggregate_score, 0.9),
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_corrupted_entry_is_a_miss() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60));
        cache.store(fp("a"), result_for(&fp("other"), 0.5), Duration::from_secs(60));

        assert!(matches!(cache.lookup(&fp("a")), Lookup::Miss));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().corruptions, 1);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60));
        cache.store(fp("a"), result_for(&fp("a"), 0.5), Duration::from_secs(60));

        assert!(cache.invalidate(&fp("a")));
        assert!(!cache.invalidate(&fp("a")));
        assert!(matches!(cache.lookup(&fp("a")), Lookup::Miss));
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_first() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60)).shared();

        let lock = match cache.try_acquire_computation(&fp("a")) {
            Acquisition::Acquired(lock) => lock,
            Acquisition::AlreadyInFlight(_) => panic!("first caller must acquire"),
        };
        let waiter = match cache.try_acquire_computation(&fp("a")) {
            Acquisition::AlreadyInFlight(waiter) => waiter,
            Acquisition::Acquired(_) => panic!("second caller must wait"),
        };
        assert!(cache.is_in_flight(&fp("a")));

        let result = result_for(&fp("a"), 0.6);
        let wait = tokio::spawn(waiter.wait(Duration::from_secs(5)));
        lock.complete(SubmitOutcome::Evaluated(result.clone()), Duration::from_secs(60));

        match wait.await.unwrap() {
            WaitOutcome::Completed(SubmitOutcome::Evaluated(r)) => assert!(Arc::ptr_eq(&r, &result)),
            other => panic!("unexpected wait outcome: {:?}", other),
        }
        assert!(!cache.is_in_flight(&fp("a")));
        assert!(matches!(cache.access(&fp("a")), CacheAccess::Hit(_)));
    }

    #[tokio::test]
    async fn test_dropped_lock_wakes_waiters_as_abandoned() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60)).shared();

        let lock = match cache.access(&fp("a")) {
            CacheAccess::Acquired(lock) => lock,
            _ => panic!("expected acquire"),
        };
        let waiter = match cache.access(&fp("a")) {
            CacheAccess::InFlight(waiter) => waiter,
            _ => panic!("expected in-flight"),
        };

        drop(lock);
        assert!(matches!(
            waiter.wait(Duration::from_secs(5)).await,
            WaitOutcome::Abandoned
        ));
        assert!(matches!(cache.access(&fp("a")), CacheAccess::Acquired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_times_out() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60)).shared();
        let _lock = match cache.access(&fp("a")) {
            CacheAccess::Acquired(lock) => lock,
            _ => panic!("expected acquire"),
        };
        let waiter = match cache.access(&fp("a")) {
            CacheAccess::InFlight(waiter) => waiter,
            _ => panic!("expected in-flight"),
        };

        assert!(matches!(
            waiter.wait(Duration::from_millis(100)).await,
            WaitOutcome::TimedOut
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60));
        cache.store(fp("short"), result_for(&fp("short"), 0.5), Duration::from_secs(1));
        cache.store(fp("long"), result_for(&fp("long"), 0.5), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_removes_expired_entries() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60)).shared();
        cache.store(fp("short"), result_for(&fp("short"), 0.5), Duration::from_secs(1));
        cache.store(fp("long"), result_for(&fp("long"), 0.5), Duration::from_secs(100));
        let sweeper = cache.spawn_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        // No lookup ran; only the sweeper can have removed the entry
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_uncached_completion_reaches_waiters_only() {
        let cache = FingerprintCache::new(10, Duration::from_secs(60)).shared();
        let lock = match cache.access(&fp("a")) {
            CacheAccess::Acquired(lock) => lock,
            _ => panic!("expected acquire"),
        };
        let waiter = match cache.access(&fp("a")) {
            CacheAccess::InFlight(waiter) => waiter,
            _ => panic!("expected in-flight"),
        };

        let result = result_for(&fp("a"), 0.4);
        lock.complete_uncached(SubmitOutcome::Evaluated(result.clone()));

        match waiter.wait(Duration::from_secs(5)).await {
            WaitOutcome::Completed(SubmitOutcome::Evaluated(r)) => assert!(Arc::ptr_eq(&r, &result)),
            other => panic!("unexpected wait outcome: {:?}", other),
        }
        assert!(cache.is_empty());
        assert!(!cache.is_in_flight(&fp("a")));
    }
}
