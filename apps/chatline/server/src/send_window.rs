use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// Rolling count of successful sends over the last minute.
#[derive(Debug, Default)]
pub struct SendWindow {
    sent_at: Mutex<VecDeque<Instant>>,
}

impl SendWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        let now = Instant::now();
        let mut sent_at = self.sent_at.lock();
        prune(&mut sent_at, now);
        sent_at.push_back(now);
    }

    pub fn per_minute(&self) -> usize {
        let mut sent_at = self.sent_at.lock();
        prune(&mut sent_at, Instant::now());
        sent_at.len()
    }
}

fn prune(sent_at: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = sent_at.front() {
        if now.duration_since(*oldest) >= WINDOW {
            sent_at.pop_front();
        } else {
            break;
        }
    }
}
