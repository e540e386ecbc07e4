//! Send-rate circuit breaker
//!
//! Counts twin sends in a rolling one-minute window. Exceeding the limit
//! trips the breaker for a fixed cooldown; merged properties keep
//! accumulating in the buffer while it is open.

use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug)]
pub struct CircuitBreaker {
    max_per_minute: u32,
    cooldown: Duration,
    message_count: u32,
    window_start: Instant,
    tripped: bool,
    reset_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(max_per_minute: u32, cooldown: Duration) -> Self {
        Self {
            max_per_minute,
            cooldown,
            message_count: 0,
            window_start: Instant::now(),
            tripped: false,
            reset_at: None,
        }
    }

    /// Accounts for one send attempt. Failed transmits count against the
    /// window too, so a flapping link cannot burst past the limit.
    pub fn record_send(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= Duration::from_secs(60) {
            self.window_start = now;
            self.message_count = 0;
        }
        self.message_count += 1;
        if self.message_count > self.max_per_minute && !self.tripped {
            self.tripped = true;
            self.reset_at = Some(now + self.cooldown);
            warn!(
                "twin send rate exceeded {}/min, circuit open for {:?}",
                self.max_per_minute, self.cooldown
            );
        }
    }

    /// True while sends are suppressed. Automatically closes once the
    /// cooldown has elapsed.
    pub fn is_open(&mut self, now: Instant) -> bool {
        if !self.tripped {
            return false;
        }
        match self.reset_at {
            Some(reset_at) if now >= reset_at => {
                self.tripped = false;
                self.reset_at = None;
                self.message_count = 0;
                self.window_start = now;
                info!("twin circuit closed, resuming sends");
                false
            }
            _ => true,
        }
    }
}
