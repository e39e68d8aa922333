//! Failure classification and the reconnection policy table.

use std::{fmt, time::Duration};

use crate::{network::CloseReason, utils::jitter};

/// Failure taxonomy driving recovery. Never raised to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Explicit logout or invalid session signature.
    LoggedOut,
    AuthRejected,
    AuthTimeout,
    ServerTerminated,
    Conflict,
    Transient,
}

impl FailureClass {
    pub fn classify(reason: &CloseReason) -> Self {
        match reason {
            CloseReason::LoggedOut | CloseReason::BadSession => Self::LoggedOut,
            CloseReason::AuthRejected => Self::AuthRejected,
            CloseReason::ChallengeTimeout => Self::AuthTimeout,
            CloseReason::ServerTerminated => Self::ServerTerminated,
            CloseReason::Replaced => Self::Conflict,
            CloseReason::Stream(_) | CloseReason::Code(_) => Self::Transient,
        }
    }

    pub fn destroys_credentials(self) -> bool {
        matches!(self, Self::LoggedOut | Self::AuthRejected)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoggedOut => "logged_out",
            Self::AuthRejected => "auth_rejected",
            Self::AuthTimeout => "auth_timeout",
            Self::ServerTerminated => "server_terminated",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
        };
        f.write_str(s)
    }
}

/// What a session does after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Stay disconnected until an external start.
    Stop,
    Restart { delay: Duration, force_new: bool },
    /// Retry budget exhausted: surface `error` and wait for an external trigger.
    GiveUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    pub max_attempts: u32,
    pub challenge_retry: Duration,
    pub server_restart: Duration,
    pub conflict_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            ceiling: Duration::from_secs(60),
            max_attempts: 10,
            challenge_retry: Duration::from_secs(3),
            server_restart: Duration::from_secs(10),
            conflict_backoff: Duration::from_secs(120),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempts + jitter, ceiling)`.
    pub fn transient_delay(&self, attempts: u32, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(31));
        self.base
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.ceiling)
    }

    /// Random jitter in `[0, base)`.
    ///
    /// Keeping it below `base` is what makes consecutive transient delays
    /// non-decreasing: `base * 2^(n+1) >= base * 2^n + base`.
    pub fn jitter(&self) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        jitter(self.base.saturating_sub(Duration::from_millis(1)))
    }

    /// Policy table. `attempts` counts retries already scheduled since the last
    /// successful connect.
    pub fn decide(&self, class: FailureClass, attempts: u32, jitter: Duration) -> ReconnectAction {
        if class == FailureClass::LoggedOut {
            return ReconnectAction::Stop;
        }
        if attempts >= self.max_attempts {
            return ReconnectAction::GiveUp;
        }

        let (delay, force_new) = match class {
            FailureClass::AuthRejected => (Duration::ZERO, true),
            FailureClass::AuthTimeout => (self.challenge_retry, false),
            FailureClass::ServerTerminated => (self.server_restart.saturating_add(jitter), false),
            FailureClass::Conflict => (self.conflict_backoff, false),
            FailureClass::Transient => (self.transient_delay(attempts, jitter), false),
            FailureClass::LoggedOut => unreachable!("handled above"),
        };
        ReconnectAction::Restart { delay, force_new }
    }
}
