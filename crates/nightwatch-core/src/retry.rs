//! Reconnect backoff shared by the pinner and the instrumentation channel.
//!
//! A strategy maps a consecutive-failure count to the next wait. Waits grow up
//! to a ceiling; after a fixed number of attempts the strategy asks for one
//! longer cool-down pause and the counter starts over, so a target that is
//! simply not running costs little CPU and log output.

use std::time::{Duration, Instant};

/// The wait to apply before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    Retry(Duration),
    /// Long pause after which the attempt counter is reset
    Cooldown(Duration),
}

impl RetryDelay {
    pub fn duration(&self) -> Duration {
        match *self {
            RetryDelay::Retry(d) | RetryDelay::Cooldown(d) => d,
        }
    }

    pub fn is_cooldown(&self) -> bool {
        matches!(self, RetryDelay::Cooldown(_))
    }
}

pub trait RetryStrategy: Send {
    /// Wait before retrying after the `attempt`-th consecutive failure (1-based).
    fn delay_for(&self, attempt: u32) -> RetryDelay;
}

/// Doubling backoff with a ceiling and periodic cool-down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub ceiling: Duration,
    /// Failures after which a cool-down replaces the regular delay
    pub attempts_before_cooldown: u32,
    pub cooldown: Duration,
}

impl ExponentialBackoff {
    /// Slow-growing policy for the pinner's reconnect loop.
    pub fn reconnect() -> Self {
        Self {
            initial: Duration::from_secs(1),
            ceiling: Duration::from_secs(16),
            attempts_before_cooldown: 10,
            cooldown: Duration::from_secs(30),
        }
    }

    /// Short policy for the instrumentation channel, which should recover
    /// within a couple of seconds once the target is back.
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_secs(2),
            ceiling: Duration::from_secs(5),
            attempts_before_cooldown: 15,
            cooldown: Duration::from_secs(15),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::reconnect()
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn delay_for(&self, attempt: u32) -> RetryDelay {
        if self.attempts_before_cooldown > 0 && attempt >= self.attempts_before_cooldown {
            return RetryDelay::Cooldown(self.cooldown);
        }

        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        RetryDelay::Retry(delay)
    }
}

/// Constant delay, no cool-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl RetryStrategy for FixedDelay {
    fn delay_for(&self, _attempt: u32) -> RetryDelay {
        RetryDelay::Retry(self.0)
    }
}

/// Consecutive-failure counter driving a [`RetryStrategy`].
#[derive(Debug)]
pub struct Backoff<S> {
    strategy: S,
    attempts: u32,
}

impl<S: RetryStrategy> Backoff<S> {
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            attempts: 0,
        }
    }

    /// Record a failure and return the wait before the next attempt.
    pub fn next_delay(&mut self) -> RetryDelay {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self.strategy.delay_for(self.attempts);
        if delay.is_cooldown() {
            self.attempts = 0;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Lets a repeating status line through at most once per window.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns `true` if the line should be emitted now.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forget the last emission, e.g. after the condition cleared.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
