use std::time::Duration;

use tokio::time::Instant;

/// Opens at most once per period. Used to throttle periodic log lines.
#[derive(Debug)]
pub struct RateGate {
    period: Duration,
    next: Instant,
}

impl RateGate {
    /// The first call to [`RateGate::ready`] opens only after `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Whether the period has elapsed since the gate last opened. Opening
    /// rearms the gate.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        if now < self.next {
            return false;
        }
        self.next = now + self.period;
        true
    }
}
