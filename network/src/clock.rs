//! Wall clock anchored once and advanced by the tokio timer.
//!
//! Persisted timestamps need wall-clock values, but retry and expiry
//! timers run on tokio time. Anchoring one to the other keeps both views
//! consistent, including under a paused test runtime.

use idnet_types::{Clock, Timestamp};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct TokioClock {
    anchor_wall: Timestamp,
    anchor: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(Timestamp::now())
    }

    pub fn anchored_at(wall: Timestamp) -> Self {
        Self {
            anchor_wall: wall,
            anchor: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.anchor_wall.saturating_add(self.anchor.elapsed())
    }
}
