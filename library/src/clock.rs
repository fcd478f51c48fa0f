use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall clock that advances with the tokio clock.
///
/// Timestamps taken through it stay consistent with `tokio::time` timers, so
/// tests running with paused time see call durations that match the virtual
/// time they advanced.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    #[must_use]
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
