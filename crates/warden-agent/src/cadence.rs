use std::time::Duration;

const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Poll delay that stays short while output flows and backs off while idle.
#[derive(Debug, Clone)]
pub struct AdaptiveCadence {
    min: Duration,
    max: Duration,
    current: Duration,
    idle_polls: u32,
}

impl AdaptiveCadence {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            idle_polls: 0,
        }
    }

    /// Delay before the next poll, given whether the last one produced lines.
    pub fn next_delay(&mut self, had_lines: bool) -> Duration {
        if had_lines {
            self.idle_polls = 0;
            self.current = self.min;
        } else {
            self.idle_polls = self.idle_polls.saturating_add(1);
            let grown = Duration::from_secs_f64(self.current.as_secs_f64() * BACKOFF_MULTIPLIER);
            self.current = grown.clamp(self.min, self.max);
        }
        self.current
    }

    /// After a failed poll, wait the full idle interval.
    pub fn after_error(&mut self) -> Duration {
        self.current = self.max;
        self.current
    }

    pub fn idle_polls(&self) -> u32 {
        self.idle_polls
    }
}
