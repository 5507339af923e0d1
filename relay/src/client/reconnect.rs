//! Reconnection controller — exponential backoff with jitter.
//!
//! `delay = min(max, initial × multiplier^attempt)`, optionally stretched by
//! up to 10%. The attempt counter resets on every successful connection and
//! the controller gives up after `max_attempts` consecutive failures.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{ClientError, Disconnect, WorkspaceClient};

const MAX_JITTER: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max)
    }

    /// Delay before retry number `attempt`, jittered when enabled.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(0.0..=MAX_JITTER);
        base.mul_f64(factor)
    }
}

/// Attempt counter over a [`ReconnectPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Keep `client` connected to its hub until `stop` flips or retries run out.
///
/// Only disconnects the local process did not ask for are retried.
///
/// # Errors
///
/// Returns [`ClientError::MaxRetriesExceeded`] once the policy gives up.
pub async fn maintain(
    client: &WorkspaceClient,
    policy: ReconnectPolicy,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ClientError> {
    let mut backoff = Backoff::new(policy);
    loop {
        if *stop.borrow() {
            client.disconnect();
            return Ok(());
        }
        match client.connect().await {
            Ok(session) => {
                backoff.reset();
                tokio::select! {
                    reason = session.wait() => match reason {
                        Disconnect::Requested => return Ok(()),
                        Disconnect::Lost(reason) => warn!(%reason, "client: hub connection lost"),
                    },
                    _ = stop.changed() => {
                        client.disconnect();
                        return Ok(());
                    }
                }
            }
            Err(e) => warn!(error = %e, attempt = backoff.attempts(), "client: connect failed"),
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(ClientError::MaxRetriesExceeded(backoff.attempts()));
        };
        info!(delay_ms = delay.as_millis(), attempt = backoff.attempts(), "client: reconnecting");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = stop.changed() => return Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "reconnect_test.rs"]
mod tests;
