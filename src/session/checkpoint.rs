//! Cadence of partial-content writes while a reply streams

use std::time::Duration;
use tokio::time::Instant;

/// When to write a checkpoint: every `every_deltas` deltas or once `interval`
/// has elapsed since the last write, whichever comes first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub every_deltas: u32,
    pub interval: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_deltas: 16,
            interval: Duration::from_millis(500),
        }
    }
}

/// Tracks deltas and time since the last checkpoint
#[derive(Debug)]
pub(crate) struct CheckpointClock {
    policy: CheckpointPolicy,
    deltas_since: u32,
    last_written: Instant,
}

impl CheckpointClock {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            deltas_since: 0,
            last_written: Instant::now(),
        }
    }

    pub fn record_delta(&mut self) {
        self.deltas_since = self.deltas_since.saturating_add(1);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if self.deltas_since == 0 {
            return false;
        }
        self.deltas_since >= self.policy.every_deltas.max(1)
            || now.duration_since(self.last_written) >= self.policy.interval
    }

    pub fn mark_written(&mut self, now: Instant) {
        self.deltas_since = 0;
        self.last_written = now;
    }
}
