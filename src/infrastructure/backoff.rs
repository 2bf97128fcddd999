//! Reconnect Backoff
//!
//! Explicit state machine for the satellite's link to its master:
//!
//! ```text
//! Connected --disconnect--> Disconnected --schedule--> Reconnecting{1, t}
//!     ^                                                   |
//!     +---------------- connect ok -----------------------+
//!                 Reconnecting{n, t} --fail--> Reconnecting{n+1, t'}
//! ```
//!
//! The delay for attempt `n` is `min(c_n + jitter, max_delay)` with
//! `c_n = min(base * multiplier^(n-1), max_delay)` and jitter drawn from
//! `[0, jitter_ratio * c_n]`.

use crate::replication::config::ReconnectPolicy;
use std::time::{Duration, Instant};

/// State of the link to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, next_retry_at: Instant },
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Delay calculation for a reconnect policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Un-jittered delay for attempt `n` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let cap = self.policy.max_delay.as_secs_f64();
        let secs = (self.policy.base_delay.as_secs_f64() * self.policy.multiplier.powi(exponent)).min(cap);
        Duration::from_secs_f64(secs)
    }

    /// Delay for attempt `n` with a jitter sample in `[0, 1]`.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = base.mul_f64(self.policy.jitter_ratio * sample.clamp(0.0, 1.0));
        (base + jitter).min(self.policy.max_delay)
    }

    /// Delay for attempt `n` with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random::<f64>())
    }
}

/// Reconnect state machine driven by the satellite loop's timer.
#[derive(Debug)]
pub struct ReconnectMachine {
    backoff: Backoff,
    state: LinkState,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            backoff: Backoff::new(policy),
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Attempts made since the last successful connect.
    pub fn attempt(&self) -> u32 {
        match self.state {
            LinkState::Reconnecting { attempt, .. } => attempt,
            _ => 0,
        }
    }

    /// Link established; the attempt counter resets.
    pub fn on_connected(&mut self) {
        self.state = LinkState::Connected;
    }

    /// Link lost or never established; no retry scheduled yet.
    pub fn on_disconnected(&mut self) {
        self.state = LinkState::Disconnected;
    }

    /// Schedule the next attempt. Returns its number and delay.
    pub fn schedule_retry(&mut self, now: Instant) -> (u32, Duration) {
        let attempt = self.attempt().saturating_add(1);
        let delay = self.backoff.delay(attempt);
        self.state = LinkState::Reconnecting {
            attempt,
            next_retry_at: now + delay,
        };
        (attempt, delay)
    }

    /// When the pending retry is due, if one is scheduled.
    pub fn next_retry_at(&self) -> Option<Instant> {
        match self.state {
            LinkState::Reconnecting { next_retry_at, .. } => Some(next_retry_at),
            _ => None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.state {
            LinkState::Reconnecting { next_retry_at, .. } => now >= next_retry_at,
            LinkState::Disconnected => true,
            LinkState::Connected => false,
        }
    }

    /// Pull the pending retry forward to `now`, keeping the attempt count.
    pub fn retry_now(&mut self, now: Instant) {
        if let LinkState::Reconnecting { attempt, .. } = self.state {
            self.state = LinkState::Reconnecting {
                attempt,
                next_retry_at: now,
            };
        }
    }
}
