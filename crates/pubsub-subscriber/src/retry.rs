//! Automatic retry policy for failed requests.

use std::time::Duration;

const LINEAR_DEFAULT_DELAY: Duration = Duration::from_secs(2);
const LINEAR_MAX_ATTEMPTS: u32 = 10;
const EXPONENTIAL_MIN_DELAY: Duration = Duration::from_secs(2);
const EXPONENTIAL_MAX_DELAY: Duration = Duration::from_secs(150);
const EXPONENTIAL_MAX_ATTEMPTS: u32 = 6;
const MAX_JITTER_MS: u64 = 1000;

/// Endpoint category a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Subscribe,
    Presence,
    Time,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt.
    Linear { delay: Duration },
    /// Delay doubles per attempt: `min, 2*min, 4*min, ...` capped at `max`.
    Exponential { min: Duration, max: Duration },
}

/// How many consecutive failures are tolerated and how long to wait between
/// attempts.
///
/// `max_attempts` counts failed attempts, the first included: with
/// `max_attempts = 3` the third consecutive failure is terminal and no fourth
/// request is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
    /// Endpoint categories never retried automatically.
    pub excluded: Vec<Endpoint>,
    /// Add up to one second of random delay to each attempt.
    pub jitter: bool,
}

impl RetryPolicy {
    /// 2s between attempts, 10 attempts.
    pub fn linear() -> Self {
        Self::linear_with(LINEAR_DEFAULT_DELAY, LINEAR_MAX_ATTEMPTS)
    }

    /// Delay is raised to at least 2s and attempts capped at 10.
    pub fn linear_with(delay: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Linear {
                delay: delay.max(LINEAR_DEFAULT_DELAY),
            },
            max_attempts: max_attempts.min(LINEAR_MAX_ATTEMPTS),
            excluded: Vec::new(),
            jitter: true,
        }
    }

    /// 2s doubling up to 150s, 6 attempts.
    pub fn exponential() -> Self {
        Self::exponential_with(
            EXPONENTIAL_MIN_DELAY,
            EXPONENTIAL_MAX_DELAY,
            EXPONENTIAL_MAX_ATTEMPTS,
        )
    }

    /// Bounds are clamped to `[2s, 150s]` and attempts capped at 6.
    pub fn exponential_with(min: Duration, max: Duration, max_attempts: u32) -> Self {
        let min = min.max(EXPONENTIAL_MIN_DELAY);
        let max = max.min(EXPONENTIAL_MAX_DELAY).max(min);
        Self {
            backoff: Backoff::Exponential { min, max },
            max_attempts: max_attempts.min(EXPONENTIAL_MAX_ATTEMPTS),
            excluded: Vec::new(),
            jitter: true,
        }
    }

    pub fn excluding(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.excluded.extend(endpoints);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn covers(&self, endpoint: Endpoint) -> bool {
        !self.excluded.contains(&endpoint)
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` when the request should not be retried again.
    pub fn delay(&self, endpoint: Endpoint, failures: u32) -> Option<Duration> {
        if failures == 0 || failures >= self.max_attempts || !self.covers(endpoint) {
            return None;
        }
        let base = self.base_delay(failures);
        if self.jitter {
            Some(base + jitter())
        } else {
            Some(base)
        }
    }

    pub(crate) fn base_delay(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Linear { delay } => delay,
            Backoff::Exponential { min, max } => {
                let exp = failures.saturating_sub(1).min(30);
                min.saturating_mul(1u32 << exp).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear()
    }
}

fn jitter() -> Duration {
    // Subsecond wall-clock nanos are unpredictable enough to spread retries.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(nanos % MAX_JITTER_MS)
}
