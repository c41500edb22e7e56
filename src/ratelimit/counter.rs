//! Fixed-window counter state.

/// Convert a remaining window length into a `Retry-After` value in seconds.
///
/// Rounds up and never returns less than one second.
pub fn retry_after_secs(remaining_ms: u64) -> u64 {
    remaining_ms.div_ceil(1000).max(1)
}

/// Count of requests seen for a key within the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window ends (epoch milliseconds)
    pub reset_at_ms: u64,
}

impl CounterEntry {
    /// Start a new window at `now_ms` with a count of one.
    pub fn fresh(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            reset_at_ms: now_ms.saturating_add(window_ms),
        }
    }

    /// Whether the window has ended at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }

    /// Register one more request, opening a new window if this one has ended.
    pub fn hit(&mut self, now_ms: u64, window_ms: u64) {
        if self.is_expired(now_ms) {
            *self = Self::fresh(now_ms, window_ms);
        } else {
            self.count = self.count.saturating_add(1);
        }
    }

    /// Requests still allowed under `limit`.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }

    /// Milliseconds until the window resets.
    pub fn time_until_reset(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms)
    }
}
