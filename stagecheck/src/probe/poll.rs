//! Poll loop state machine.
//!
//! The decision of what to do after an attempt is a pure function of the time
//! elapsed and the attempt's outcome, so the same policy drives blocking,
//! async or timer-based loops.

use crate::errors::{ProbeConfigError, ProbeTimeoutError};
use serde::Serialize;
use std::time::Duration;

/// Fixed delay between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// A progress notification is emitted on every attempt that is a multiple of this.
pub const PROGRESS_EVERY: u32 = 30;

/// Validated timing parameters for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    timeout: Duration,
    per_attempt_timeout: Duration,
    backoff: Duration,
}

impl ProbeSettings {
    /// Creates settings, checking `0 < per_attempt_timeout <= timeout`.
    pub fn new(timeout: Duration, per_attempt_timeout: Duration) -> Result<Self, ProbeConfigError> {
        if timeout.is_zero() {
            return Err(ProbeConfigError::ZeroTimeout);
        }
        if per_attempt_timeout.is_zero() {
            return Err(ProbeConfigError::ZeroPerAttemptTimeout);
        }
        if per_attempt_timeout > timeout {
            return Err(ProbeConfigError::PerAttemptExceedsTimeout {
                per_attempt: per_attempt_timeout,
                timeout,
            });
        }
        Ok(Self {
            timeout,
            per_attempt_timeout,
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Overrides the delay between attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the overall timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the per-attempt timeout.
    #[must_use]
    pub fn per_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout
    }

    /// Returns the delay between attempts.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Decides what follows an attempt that finished `elapsed` after polling began.
    ///
    /// A retry is only scheduled when more than one backoff interval remains,
    /// so a loop never starts an attempt past its deadline.
    #[must_use]
    pub fn decide(&self, elapsed: Duration, healthy: bool) -> PollDecision {
        if healthy {
            return PollDecision::Healthy;
        }
        let remaining = self.timeout.saturating_sub(elapsed);
        if remaining > self.backoff {
            PollDecision::RetryAfter(self.backoff)
        } else {
            PollDecision::TimedOut
        }
    }

    /// Returns the longest a probe with these settings can run.
    #[must_use]
    pub fn upper_bound(&self) -> Duration {
        self.timeout + self.per_attempt_timeout + self.backoff
    }
}

/// What the poll loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Stop: the target is healthy.
    Healthy,
    /// Sleep for the given delay, then attempt again.
    RetryAfter(Duration),
    /// Stop: the deadline leaves no room for another attempt.
    TimedOut,
}

/// Returns true if attempt number `attempt` should emit a progress notification.
#[must_use]
pub fn reports_progress(attempt: u32) -> bool {
    attempt > 0 && attempt % PROGRESS_EVERY == 0
}

/// Terminal outcome of a poll loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeResult {
    /// The target satisfied its expected response.
    Healthy {
        /// Attempts made, including the successful one.
        attempts: u32,
        /// Time from the first attempt to the successful one.
        #[serde(with = "duration_secs")]
        elapsed: Duration,
    },
    /// The deadline passed first.
    TimedOut {
        /// Attempts made.
        attempts: u32,
        /// Time spent polling.
        #[serde(with = "duration_secs")]
        elapsed: Duration,
        /// The last transport error or response mismatch.
        last_error: String,
    },
}

impl ProbeResult {
    /// Returns true for `Healthy`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    /// Returns the number of attempts made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Healthy { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// Returns the time spent polling.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Healthy { elapsed, .. } | Self::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    /// Converts a timeout into an error naming the target, for callers that escalate.
    pub fn into_result(self, target: &str, timeout: Duration) -> Result<(u32, Duration), ProbeTimeoutError> {
        match self {
            Self::Healthy { attempts, elapsed } => Ok((attempts, elapsed)),
            Self::TimedOut {
                attempts,
                elapsed,
                last_error,
            } => Err(ProbeTimeoutError {
                target: target.to_string(),
                timeout,
                attempts,
                elapsed,
                last_error,
            }),
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
