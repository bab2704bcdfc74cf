//! Adaptive admission control for remote calls
//!
//! One controller is shared by every transaction in the process. It bounds
//! the number of remote calls in flight and adapts that bound from the
//! outcomes callers report back:
//! - rate-limit signal: `limit = max(min, floor(limit / 2))`
//! - `increase_after_successes` clean successes: `limit = min(max, limit + 1)`
//!
//! A decrease never revokes calls already in flight. The visible limit steps
//! down towards the new target as those permits are released, so
//! `in_flight <= current_limit` holds at every instant.

use super::admission_config::AdmissionConfig;
use super::admission_stats::AdmissionStats;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Admission errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The controller was shut down while the caller waited
    #[error("Admission controller is closed")]
    Closed,
}

/// Outcome of one remote call, reported back after it completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// 429-style throttling
    RateLimited,
    /// Any other failure; neither grows nor shrinks the limit
    Failure,
}

/// Mutable admission state, guarded by one mutex
#[derive(Debug)]
struct AdmissionState {
    /// Limit new admissions are checked against
    current_limit: u32,
    /// Where `current_limit` settles once excess permits drain
    target_limit: u32,
    in_flight: u32,
    queue_depth: u32,
    /// Recent rate-limit signals, halved every `signal_decay_secs`
    rate_limit_signals: u32,
    signal_anchor: Instant,
    success_streak: u32,
    closed: bool,
}

impl AdmissionState {
    fn new(initial_limit: u32) -> Self {
        Self {
            current_limit: initial_limit,
            target_limit: initial_limit,
            in_flight: 0,
            queue_depth: 0,
            rate_limit_signals: 0,
            signal_anchor: Instant::now(),
            success_streak: 0,
            closed: false,
        }
    }

    fn settle_limit(&mut self) {
        self.current_limit = self.target_limit.max(self.in_flight);
    }

    fn decay_signals(&mut self, now: Instant, half_life: Duration) {
        if self.rate_limit_signals == 0 {
            self.signal_anchor = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.signal_anchor);
        let halvings = (elapsed.as_secs_f64() / half_life.as_secs_f64()).floor() as u32;
        if halvings > 0 {
            self.rate_limit_signals = self.rate_limit_signals.checked_shr(halvings).unwrap_or(0);
            self.signal_anchor += half_life * halvings;
        }
    }
}

/// Read-only view of the admission state for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub current_limit: u32,
    pub target_limit: u32,
    pub min_limit: u32,
    pub max_limit: u32,
    pub in_flight: u32,
    pub queue_depth: u32,
    /// `in_flight / current_limit`
    pub utilization: f64,
    pub rate_limit_signals: u32,
    pub total_admitted: u64,
    pub total_successes: u64,
    pub total_rate_limited: u64,
    pub total_failures: u64,
    pub closed: bool,
}

struct AdmissionInner {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
    notify: Notify,
    closed_tx: watch::Sender<bool>,
    pacer: Option<DefaultDirectRateLimiter>,
    stats: AdmissionStats,
}

impl AdmissionInner {
    /// Push the gauges to the metrics registry
    fn publish(&self, state: &AdmissionState) {
        let metrics = crate::metrics::metrics();
        metrics.admission_current_limit.set(state.current_limit as i64);
        metrics.admission_in_flight.set(state.in_flight as i64);
        metrics.admission_queue_depth.set(state.queue_depth as i64);
    }

    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.settle_limit();
            self.publish(&state);
        }
        self.notify.notify_one();
    }
}

/// Shared handle to the process-wide admission controller
///
/// Cloning is cheap; every clone refers to the same state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<AdmissionInner>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Create a controller. The config is expected to be validated.
    pub fn new(config: AdmissionConfig) -> Self {
        let initial = config.initial_limit.clamp(config.min_limit, config.max_limit);
        let pacer = config
            .max_requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        let (closed_tx, _) = watch::channel(false);

        let inner = AdmissionInner {
            state: Mutex::new(AdmissionState::new(initial)),
            notify: Notify::new(),
            closed_tx,
            pacer,
            stats: AdmissionStats::new(),
            config,
        };
        inner.publish(&inner.state.lock());

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &AdmissionStats {
        &self.inner.stats
    }

    /// Wait for a permit to issue one remote call
    ///
    /// Suspends until `in_flight < current_limit`. Dropping the returned
    /// future abandons the wait without leaking a slot.
    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::Closed);
        }

        if let Some(pacer) = &self.inner.pacer {
            tokio::select! {
                _ = pacer.until_ready() => {}
                _ = self.closed() => return Err(AdmissionError::Closed),
            }
        }

        let wait_start = Instant::now();
        if let Some(permit) = self.try_acquire_slot(false) {
            return Ok(permit);
        }

        {
            let mut state = self.inner.state.lock();
            state.queue_depth += 1;
            self.inner.publish(&state);
        }
        let _waiting = scopeguard::guard(&self.inner, |inner| {
            let mut state = inner.state.lock();
            state.queue_depth = state.queue_depth.saturating_sub(1);
            inner.publish(&state);
        });

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire_slot(true) {
                let waited = wait_start.elapsed();
                crate::metrics::metrics()
                    .permit_wait_seconds
                    .observe(waited.as_secs_f64());
                debug!(waited_ms = waited.as_millis() as u64, "Admission permit granted after wait");
                return Ok(permit);
            }

            if self.is_closed() {
                return Err(AdmissionError::Closed);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed() => return Err(AdmissionError::Closed),
            }
        }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.try_acquire_slot(false)
    }

    fn try_acquire_slot(&self, waited: bool) -> Option<AdmissionPermit> {
        let mut state = self.inner.state.lock();
        if state.closed || state.in_flight >= state.current_limit {
            return None;
        }

        state.in_flight += 1;
        self.inner.stats.record_admitted(waited);
        self.inner.publish(&state);
        drop(state);

        Some(AdmissionPermit {
            inner: Arc::clone(&self.inner),
            acquired_at: Instant::now(),
            released: false,
        })
    }

    /// Explicitly hand a permit back (equivalent to dropping it)
    pub fn release(&self, permit: AdmissionPermit) {
        permit.release();
    }

    /// Feed one remote-call outcome into the AIMD rule
    pub fn record_outcome(&self, outcome: CallOutcome) {
        let config = &self.inner.config;
        let mut raised = false;
        let mut state = self.inner.state.lock();

        match outcome {
            CallOutcome::Success => {
                self.inner.stats.record_success();
                state.success_streak += 1;
                if state.success_streak >= config.increase_after_successes {
                    state.success_streak = 0;
                    if state.target_limit < config.max_limit {
                        state.target_limit += 1;
                        raised = true;
                        self.inner.stats.record_increase();
                    }
                }
            }
            CallOutcome::RateLimited => {
                self.inner.stats.record_rate_limited();
                crate::metrics::metrics().rate_limit_signals.inc();

                let now = Instant::now();
                state.decay_signals(now, config.signal_half_life());
                state.rate_limit_signals = state.rate_limit_signals.saturating_add(1);
                state.success_streak = 0;

                let previous = state.target_limit;
                state.target_limit = (state.target_limit / 2).max(config.min_limit);
                if state.target_limit < previous {
                    self.inner.stats.record_decrease();
                }

                warn!(
                    previous_limit = previous,
                    new_limit = state.target_limit,
                    in_flight = state.in_flight,
                    recent_signals = state.rate_limit_signals,
                    "Rate-limit signal, shrinking concurrency limit"
                );
            }
            CallOutcome::Failure => {
                self.inner.stats.record_failure();
            }
        }

        state.settle_limit();
        self.inner.publish(&state);
        drop(state);

        if raised {
            self.inner.notify.notify_one();
        }
    }

    pub fn current_limit(&self) -> u32 {
        self.inner.state.lock().current_limit
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.state.lock().in_flight
    }

    pub fn queue_depth(&self) -> u32 {
        self.inner.state.lock().queue_depth
    }

    /// Decayed count of recent rate-limit signals
    pub fn rate_limit_signals(&self) -> u32 {
        let mut state = self.inner.state.lock();
        state.decay_signals(Instant::now(), self.inner.config.signal_half_life());
        state.rate_limit_signals
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let config = &self.inner.config;
        let stats = &self.inner.stats;
        let mut state = self.inner.state.lock();
        state.decay_signals(Instant::now(), config.signal_half_life());

        AdmissionSnapshot {
            current_limit: state.current_limit,
            target_limit: state.target_limit,
            min_limit: config.min_limit,
            max_limit: config.max_limit,
            in_flight: state.in_flight,
            queue_depth: state.queue_depth,
            utilization: if state.current_limit == 0 {
                0.0
            } else {
                state.in_flight as f64 / state.current_limit as f64
            },
            rate_limit_signals: state.rate_limit_signals,
            total_admitted: stats.total_admitted(),
            total_successes: stats.total_successes(),
            total_rate_limited: stats.total_rate_limited(),
            total_failures: stats.total_failures(),
            closed: state.closed,
        }
    }

    /// Stop admitting. Current waiters and backoff sleeps observe the close.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.closed_tx.send_replace(true);
        self.inner.notify.notify_waiters();
        info!("Admission controller closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Right to issue one concurrent remote call
///
/// Released explicitly with `release()` or automatically on drop; the slot is
/// returned exactly once either way.
pub struct AdmissionPermit {
    inner: Arc<AdmissionInner>,
    acquired_at: Instant,
    released: bool,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("held_for", &self.acquired_at.elapsed())
            .field("released", &self.released)
            .finish()
    }
}

impl AdmissionPermit {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(mut self) {
        self.release_internal();
    }

    fn release_internal(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inner.release_slot();
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_internal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn controller(initial: u32, min: u32, max: u32) -> AdmissionController {
        AdmissionController::new(AdmissionConfig::default().with_limits(initial, min, max))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let admission = controller(2, 1, 10);

        let p1 = admission.acquire().await.unwrap();
        let p2 = admission.acquire().await.unwrap();
        assert_eq!(admission.in_flight(), 2);
        assert!(admission.try_acquire().is_none());

        admission.release(p1);
        assert_eq!(admission.in_flight(), 1);

        drop(p2);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiter_is_woken_on_release() {
        let admission = controller(1, 1, 10);
        let held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.map(|p| p.held_for()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(admission.queue_depth(), 1);

        drop(held);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be admitted")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(admission.queue_depth(), 0);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_queue_depth() {
        let admission = controller(1, 1, 10);
        let _held = admission.acquire().await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(20), admission.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(admission.queue_depth(), 0);
        assert_eq!(admission.in_flight(), 1);
    }

    #[test]
    fn test_multiplicative_decrease() {
        let admission = controller(10, 1, 100);

        let expected = [5, 2, 1, 1, 1, 1];
        for want in expected {
            admission.record_outcome(CallOutcome::RateLimited);
            assert_eq!(admission.current_limit(), want);
        }
        assert_eq!(admission.rate_limit_signals(), 6);
    }

    #[test]
    fn test_additive_increase_after_success_window() {
        let mut config = AdmissionConfig::default().with_limits(4, 1, 5);
        config.increase_after_successes = 3;
        let admission = AdmissionController::new(config);

        for _ in 0..3 {
            admission.record_outcome(CallOutcome::Success);
        }
        assert_eq!(admission.current_limit(), 5);

        // Capped at max_limit
        for _ in 0..6 {
            admission.record_outcome(CallOutcome::Success);
        }
        assert_eq!(admission.current_limit(), 5);
    }

    #[test]
    fn test_rate_limit_resets_success_streak() {
        let mut config = AdmissionConfig::default().with_limits(8, 1, 20);
        config.increase_after_successes = 3;
        let admission = AdmissionController::new(config);

        admission.record_outcome(CallOutcome::Success);
        admission.record_outcome(CallOutcome::Success);
        admission.record_outcome(CallOutcome::RateLimited);
        assert_eq!(admission.current_limit(), 4);

        admission.record_outcome(CallOutcome::Success);
        admission.record_outcome(CallOutcome::Success);
        assert_eq!(admission.current_limit(), 4);
        admission.record_outcome(CallOutcome::Success);
        assert_eq!(admission.current_limit(), 5);
    }

    #[test]
    fn test_plain_failures_are_neutral() {
        let admission = controller(6, 1, 10);
        for _ in 0..20 {
            admission.record_outcome(CallOutcome::Failure);
        }
        assert_eq!(admission.current_limit(), 6);
    }

    #[tokio::test]
    async fn test_decrease_never_undercuts_in_flight() {
        let admission = controller(8, 1, 10);
        let mut permits = Vec::new();
        for _ in 0..6 {
            permits.push(admission.acquire().await.unwrap());
        }

        admission.record_outcome(CallOutcome::RateLimited);
        let snapshot = admission.snapshot();
        assert_eq!(snapshot.target_limit, 4);
        assert_eq!(snapshot.current_limit, 6);
        assert!(snapshot.in_flight <= snapshot.current_limit);
        assert!(admission.try_acquire().is_none());

        permits.truncate(3);
        assert_eq!(admission.current_limit(), 4);
        assert!(admission.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_in_flight_bound() {
        let admission = controller(3, 1, 3);
        let peak = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..24 {
            let admission = admission.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let permit = admission.acquire().await.unwrap();
                let snapshot = admission.snapshot();
                assert!(snapshot.in_flight <= snapshot.current_limit);
                peak.fetch_max(snapshot.in_flight, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                drop(permit);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(admission.in_flight(), 0);
        assert_eq!(admission.stats().total_admitted(), 24);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let admission = controller(1, 1, 1);
        let _held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        admission.close();
        let result = waiter.await.unwrap();
        assert_eq!(result, Err(AdmissionError::Closed));
        assert!(admission.acquire().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_counter_decays() {
        let mut config = AdmissionConfig::default();
        config.signal_decay_secs = 10;
        let admission = AdmissionController::new(config);

        for _ in 0..4 {
            admission.record_outcome(CallOutcome::RateLimited);
        }
        assert_eq!(admission.rate_limit_signals(), 4);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(admission.rate_limit_signals(), 2);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(admission.rate_limit_signals(), 0);
    }
}
