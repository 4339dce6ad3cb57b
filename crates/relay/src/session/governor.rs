use std::time::Duration;

use nextdesk_common::protocol::CloseReason;
use tokio::time::Instant;

use crate::config::Limits;

const RATE_WINDOW: Duration = Duration::from_millis(1000);

/// Per-connection message rate and size limits.
///
/// The rate counter restarts once more than a second has passed since the
/// window opened. The size check repeats the transport's own ceiling.
#[derive(Debug)]
pub struct MessageGovernor {
    max_rate: usize,
    max_payload: usize,
    count: usize,
    window_start: Instant,
}

impl MessageGovernor {
    pub fn new(limits: &Limits, now: Instant) -> Self {
        Self {
            max_rate: limits.max_msg_rate_per_sec,
            max_payload: limits.max_payload,
            count: 0,
            window_start: now,
        }
    }

    pub fn check(&mut self, size: usize, now: Instant) -> Result<(), CloseReason> {
        if now.saturating_duration_since(self.window_start) > RATE_WINDOW {
            self.count = 0;
            self.window_start = now;
        }

        self.count += 1;
        if self.count > self.max_rate {
            return Err(CloseReason::MessageRateLimited);
        }
        if size > self.max_payload {
            return Err(CloseReason::PayloadTooLarge);
        }
        Ok(())
    }

    pub fn messages_in_window(&self) -> usize {
        self.count
    }
}
