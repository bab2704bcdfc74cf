use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters for the admission controller
/// Lock-free so the hot path never waits on the state mutex for bookkeeping
#[derive(Debug, Default)]
pub struct AdmissionStats {
    /// Permits handed out
    pub total_admitted: AtomicU64,

    /// Acquires that had to wait for a slot
    pub total_queued: AtomicU64,

    /// Successful remote calls reported back
    pub total_successes: AtomicU64,

    /// Rate-limit signals reported back
    pub total_rate_limited: AtomicU64,

    /// Other failures reported back
    pub total_failures: AtomicU64,

    /// Multiplicative decreases applied
    pub limit_decreases: AtomicU64,

    /// Additive increases applied
    pub limit_increases: AtomicU64,
}

impl AdmissionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self, waited: bool) {
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.total_queued.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decrease(&self) {
        self.limit_decreases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increase(&self) {
        self.limit_increases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_admitted(&self) -> u64 {
        self.total_admitted.load(Ordering::Relaxed)
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }

    pub fn total_rate_limited(&self) -> u64 {
        self.total_rate_limited.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Fraction of reported outcomes that were rate-limit signals
    pub fn rate_limit_ratio(&self) -> f64 {
        let limited = self.total_rate_limited();
        let total = limited + self.total_successes() + self.total_failures();
        if total == 0 {
            return 0.0;
        }
        limited as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rate_limit_ratio() {
        let stats = AdmissionStats::new();
        assert_eq!(stats.rate_limit_ratio(), 0.0);

        stats.record_success();
        stats.record_success();
        stats.record_rate_limited();

        assert!((stats.rate_limit_ratio() - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_concurrent_admissions() {
        let stats = Arc::new(AdmissionStats::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    stats.record_admitted(i % 2 == 0);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.total_admitted(), 800);
        assert_eq!(stats.total_queued.load(Ordering::Relaxed), 400);
    }
}
