//! Wall-clock time source backed by tokio

use async_trait::async_trait;
use fanout_core::Clock;
use std::time::Duration;
use tokio::time::Instant;

/// Real clock; `now` is measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    /// Start a clock at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_moves_now_forward() {
        let clock = TokioClock::new();
        clock.sleep(Duration::from_secs(30)).await;
        assert!(clock.now() >= Duration::from_secs(30));
    }
}
