//! Stall alarm for the coordinator's waits.
//!
//! A [`Watchdog`] never runs in the background. The coordinator races
//! [`Watchdog::tick`] against the completion it awaits inside
//! `tokio::select!`, so the alarm is dropped as soon as the completion
//! arrives. Each tick that finds the stage idle for longer than the stall
//! timeout counts as one recovery attempt. Any activity resets the count.

use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Alarm {
    /// The stage is still within its timeout.
    Quiet,
    /// The stage stalled. The caller should attempt recovery.
    Stalled,
    /// Recovery attempts are used up.
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
pub(crate) struct Watchdog {
    stall_after: Duration,
    poll_interval: Duration,
    max_recoveries: u32,
    last_activity: Instant,
    consecutive: u32,
    total: u32,
}

impl Watchdog {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            stall_after: config.stall_timeout,
            poll_interval: config.poll_interval,
            max_recoveries: config.max_stall_recoveries,
            last_activity: Instant::now(),
            consecutive: 0,
            total: 0,
        }
    }

    /// Record progress.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.consecutive = 0;
    }

    /// Resolves after one polling interval.
    pub async fn tick(&self) {
        sleep(self.poll_interval).await;
    }

    pub fn check(&mut self) -> Alarm {
        if self.last_activity.elapsed() <= self.stall_after {
            return Alarm::Quiet;
        }
        if self.consecutive >= self.max_recoveries {
            return Alarm::Exhausted {
                attempts: self.consecutive,
            };
        }
        self.consecutive += 1;
        self.total += 1;
        // Give the recovery a full timeout before the next attempt.
        self.last_activity = Instant::now();
        Alarm::Stalled
    }

    /// Recovery attempts over the watchdog's lifetime.
    pub fn total_recoveries(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    fn watchdog(max: u32) -> Watchdog {
        Watchdog::new(
            &PipelineConfig::new()
                .with_stall_timeout(Duration::from_secs(1))
                .with_max_stall_recoveries(max),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fires_only_after_timeout() {
        let mut dog = watchdog(3);
        advance(Duration::from_millis(1000)).await;
        assert_eq!(dog.check(), Alarm::Quiet);
        advance(Duration::from_millis(1)).await;
        assert_eq!(dog.check(), Alarm::Stalled);
        // Re-armed by the attempt.
        assert_eq!(dog.check(), Alarm::Quiet);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_consecutive_attempts() {
        let mut dog = watchdog(2);
        for _ in 0..2 {
            advance(Duration::from_millis(1100)).await;
            assert_eq!(dog.check(), Alarm::Stalled);
        }
        advance(Duration::from_millis(1100)).await;
        assert_eq!(dog.check(), Alarm::Exhausted { attempts: 2 });
        assert_eq!(dog.total_recoveries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_count() {
        let mut dog = watchdog(1);
        advance(Duration::from_millis(1100)).await;
        assert_eq!(dog.check(), Alarm::Stalled);
        dog.touch();
        advance(Duration::from_millis(1100)).await;
        assert_eq!(dog.check(), Alarm::Stalled);
        assert_eq!(dog.total_recoveries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_waits_one_interval() {
        let dog = watchdog(1);
        let before = Instant::now();
        dog.tick().await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(102));
    }
}
