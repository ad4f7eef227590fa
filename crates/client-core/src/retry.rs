use std::time::Duration;

/// Backoff between failed event long-polls.
///
/// Tracks consecutive failures internally: each [`next_delay`] doubles the
/// wait up to the cap, and [`succeeded`] forgets the streak after any good
/// poll so the next failure starts from the base delay again.
///
/// [`next_delay`]: PollBackoff::next_delay
/// [`succeeded`]: PollBackoff::succeeded
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    attempt: u32,
}

impl PollBackoff {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            attempt: 0,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Consecutive failures since the last successful poll.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record one failure and return how long to sleep before retrying.
    ///
    /// A server `Retry-After` hint wins over the computed delay when it is
    /// larger, still bounded by the cap.
    pub fn next_delay(&mut self, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = self.attempt.min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(bounded)
    }

    /// Forget the failure streak. True when there was one to forget,
    /// which is the moment a recovery is worth reporting.
    pub fn succeeded(&mut self) -> bool {
        std::mem::take(&mut self.attempt) > 0
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(3_000, 30_000)
    }
}
