//! Hub discovery and election over the well-known port.
//!
//! ALGORITHM
//! =========
//! 1. Probe `/health` on the well-known address.
//! 2. Healthy → become a client.
//! 3. Otherwise bind the port. Bound → become the hub.
//! 4. Address in use → someone won the race between 1 and 3. Wait the
//!    settle delay and re-probe, a bounded number of times, then become a
//!    client of the winner.
//! 5. Any other bind error is fatal.
//!
//! The OS guarantees at most one process holds the port; no other shared
//! resource takes part.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::routes::status::HealthResponse;

// =============================================================================
// PROBE
// =============================================================================

/// Liveness check against a would-be hub.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` when a healthy hub answers at `addr`.
    async fn probe(&self, addr: SocketAddr) -> bool;
}

/// Probe that issues `GET /health` with a short timeout.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, addr: SocketAddr) -> bool {
        let url = format!("http://{addr}/health");
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(%addr, error = %e, "probe: no hub");
                return false;
            }
        };
        if !response.status().is_success() {
            return false;
        }
        match response.json::<HealthResponse>().await {
            Ok(health) => health.status == "ok",
            Err(e) => {
                warn!(%addr, error = %e, "probe: unexpected health payload");
                false
            }
        }
    }
}

// =============================================================================
// ELECTION
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionSettings {
    pub addr: SocketAddr,
    pub settle_delay: Duration,
    pub probe_retries: u32,
}

/// Outcome of one election round.
#[derive(Debug)]
pub enum Election {
    /// This process holds the port and must serve the hub on it.
    Hub(TcpListener),
    /// A healthy hub already answers at the address.
    Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("port {addr} is taken but no hub answered after {attempts} probes")]
    HubUnreachable { addr: SocketAddr, attempts: u32 },
}

/// Run one election round.
///
/// # Errors
///
/// Returns [`ElectionError::Bind`] for bind failures other than "address in
/// use", and [`ElectionError::HubUnreachable`] when the port is held by
/// something that never answers the health probe.
pub async fn elect(probe: &dyn HealthProbe, settings: &ElectionSettings) -> Result<Election, ElectionError> {
    let addr = settings.addr;
    if probe.probe(addr).await {
        info!(%addr, "election: hub found");
        return Ok(Election::Client);
    }

    match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "election: won, serving as hub");
            Ok(Election::Hub(listener))
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            info!(%addr, "election: lost bind race, waiting for winner");
            for attempt in 1..=settings.probe_retries {
                tokio::time::sleep(settings.settle_delay).await;
                if probe.probe(addr).await {
                    info!(%addr, attempt, "election: winner found");
                    return Ok(Election::Client);
                }
                debug!(%addr, attempt, "election: winner not ready");
            }
            Err(ElectionError::HubUnreachable { addr, attempts: settings.probe_retries })
        }
        Err(source) => Err(ElectionError::Bind { addr, source }),
    }
}

#[cfg(test)]
#[path = "discovery_test.rs"]
mod tests;
