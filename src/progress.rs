use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Structured progress sink used by the orchestrator and all stages.
///
/// Implementations must be shareable across the preprocess worker threads.
pub trait Progress: Send + Sync {
    fn set_step(&self, label: &str);
    fn set_action(&self, label: &str);
    fn info(&self, msg: &str);
    fn warning(&self, msg: &str);
    fn error(&self, msg: &str);

    /// Declare the work total the following `progress` calls are keyed to
    fn set_total(&self, total: u64);
    fn progress(&self, current: u64);

    /// Number of `error` calls so far; non-zero maps to a non-zero exit code
    fn error_count(&self) -> u64;
}

/// Progress sink that reports through `tracing`
#[derive(Default)]
pub struct ConsoleProgress {
    errors: AtomicU64,
    total: AtomicU64,
    last_percent: AtomicU64,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Progress for ConsoleProgress {
    fn set_step(&self, label: &str) {
        info!("{}", label);
    }

    fn set_action(&self, label: &str) {
        info!("- {}", label);
    }

    fn info(&self, msg: &str) {
        info!("{}", msg);
    }

    fn warning(&self, msg: &str) {
        warn!("{}", msg);
    }

    fn error(&self, msg: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        error!("{}", msg);
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.last_percent.store(0, Ordering::Relaxed);
    }

    fn progress(&self, current: u64) {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return;
        }

        let percent = current * 100 / total;
        let last = self.last_percent.load(Ordering::Relaxed);

        // report in 10% increments only
        if percent / 10 > last / 10 {
            self.last_percent.store(percent, Ordering::Relaxed);
            info!("  {}%", percent);
        }
    }

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Progress sink that swallows everything; used by tests
#[derive(Default)]
pub struct SilentProgress {
    errors: AtomicU64,
}

impl Progress for SilentProgress {
    fn set_step(&self, _label: &str) {}
    fn set_action(&self, _label: &str) {}
    fn info(&self, _msg: &str) {}
    fn warning(&self, _msg: &str) {}

    fn error(&self, _msg: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn set_total(&self, _total: u64) {}
    fn progress(&self, _current: u64) {}

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Cooperative cancellation handle polled by long-running stages.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct Breaker {
    aborted: Arc<AtomicBool>,
}

impl Breaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the running import to stop at its next polling point
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_flag_is_shared_between_clones() {
        let breaker = Breaker::new();
        let other = breaker.clone();

        assert!(!other.is_aborted());
        breaker.abort();
        assert!(other.is_aborted());

        other.reset();
        assert!(!breaker.is_aborted());
    }

    #[test]
    fn error_count_tracks_reported_errors() {
        let progress = SilentProgress::default();
        progress.error("first");
        progress.error("second");
        assert_eq!(progress.error_count(), 2);
    }
}
