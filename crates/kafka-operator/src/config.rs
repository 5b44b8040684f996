//! Reconciler tuning

use std::time::Duration;

/// Requeue intervals used by the lifecycle reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Requeue after a pass with nothing in flight
    pub steady_requeue: Duration,
    /// Requeue while an upgrade or Cruise Control task is in flight
    pub active_requeue: Duration,
    /// Requeue when Cruise Control is not ready to accept a task
    pub engine_not_ready_requeue: Duration,
    /// Base delay for error backoff
    pub error_requeue: Duration,
    /// Upper bound for error backoff
    pub max_error_requeue: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            steady_requeue: Duration::from_secs(300),
            active_requeue: Duration::from_secs(10),
            engine_not_ready_requeue: Duration::from_secs(20),
            error_requeue: Duration::from_secs(30),
            max_error_requeue: Duration::from_secs(600),
        }
    }
}

impl ReconcilerConfig {
    /// Exponential backoff for the `retries`-th consecutive failure
    pub fn error_backoff(&self, retries: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries.min(10));
        self.error_requeue
            .saturating_mul(factor)
            .min(self.max_error_requeue)
    }
}
