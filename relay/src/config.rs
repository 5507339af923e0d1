//! Process configuration, loaded from environment variables.
//!
//! Every value has a default; unparseable values fall back to it rather
//! than failing startup. The port override exists for test isolation: the
//! election protocol relies on every process agreeing on one port.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use frames::WireCodec;
use frames::protocol::Registration;
use sha2::{Digest, Sha256};

use crate::client::reconnect::ReconnectPolicy;
use crate::client::ClientConfig;
use crate::discovery::ElectionSettings;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 47921;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 500;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1_000;
const DEFAULT_PROBE_RETRIES: u32 = 5;
const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 5_000;

/// Hex characters of the root-path digest used as the default workspace ID.
const WORKSPACE_ID_LEN: usize = 16;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

fn env_ms(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}

// =============================================================================
// WORKSPACE IDENTITY
// =============================================================================

/// Who this process is when it registers with the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceIdentity {
    pub workspace_id: String,
    pub name: String,
    pub root_path: PathBuf,
}

impl WorkspaceIdentity {
    /// Derive name and ID from the root path.
    #[must_use]
    pub fn from_root(root_path: impl Into<PathBuf>) -> Self {
        let root_path = root_path.into();
        Self { workspace_id: workspace_id_for(&root_path), name: dir_name(&root_path), root_path }
    }

    fn from_env() -> Self {
        let root = env_string("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let mut identity = Self::from_root(root);
        if let Some(name) = env_string("WORKSPACE_NAME") {
            identity.name = name;
        }
        if let Some(id) = env_string("WORKSPACE_ID") {
            identity.workspace_id = id;
        }
        identity
    }

    #[must_use]
    pub fn registration(&self) -> Registration {
        Registration {
            workspace_id: self.workspace_id.clone(),
            name: self.name.clone(),
            root_path: self.root_path.to_string_lossy().into_owned(),
        }
    }
}

/// Stable ID for a workspace root: a prefix of its SHA-256 in hex.
#[must_use]
pub fn workspace_id_for(root: &Path) -> String {
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    let mut id = String::with_capacity(WORKSPACE_ID_LEN);
    for byte in digest.iter().take(WORKSPACE_ID_LEN / 2) {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

fn dir_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_owned())
}

// =============================================================================
// RELAY CONFIG
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Hub → board query deadline.
    pub query_timeout: Duration,
    /// Client → hub query deadline. Never shorter than `query_timeout`.
    pub client_timeout: Duration,
    pub probe_timeout: Duration,
    pub settle_delay: Duration,
    pub probe_retries: u32,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub workspace: WorkspaceIdentity,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            client_timeout: Duration::from_millis(DEFAULT_CLIENT_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            probe_retries: DEFAULT_PROBE_RETRIES,
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            reconnect: ReconnectPolicy::default(),
            snapshot_path: None,
            snapshot_interval: Duration::from_millis(DEFAULT_SNAPSHOT_INTERVAL_MS),
            workspace: WorkspaceIdentity::from_root(PathBuf::from(".")),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            initial: env_ms("RELAY_RECONNECT_INITIAL_MS", 1_000),
            max: env_ms("RELAY_RECONNECT_MAX_MS", 30_000),
            multiplier: env_parse("RELAY_RECONNECT_MULTIPLIER", defaults.multiplier),
            max_attempts: env_parse("RELAY_RECONNECT_MAX_ATTEMPTS", defaults.max_attempts),
            jitter: env_parse("RELAY_RECONNECT_JITTER", defaults.jitter),
        };
        Self {
            host: env_string("RELAY_HOST").unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port: env_parse("RELAY_PORT", DEFAULT_PORT),
            query_timeout: env_ms("RELAY_QUERY_TIMEOUT_MS", DEFAULT_QUERY_TIMEOUT_MS),
            client_timeout: env_ms("RELAY_CLIENT_TIMEOUT_MS", DEFAULT_CLIENT_TIMEOUT_MS),
            probe_timeout: env_ms("RELAY_PROBE_TIMEOUT_MS", DEFAULT_PROBE_TIMEOUT_MS),
            settle_delay: env_ms("RELAY_SETTLE_DELAY_MS", DEFAULT_SETTLE_DELAY_MS),
            probe_retries: env_parse("RELAY_PROBE_RETRIES", DEFAULT_PROBE_RETRIES),
            ping_interval: env_ms("RELAY_PING_INTERVAL_MS", DEFAULT_PING_INTERVAL_MS),
            reconnect,
            snapshot_path: env_string("RELAY_SNAPSHOT_PATH").map(PathBuf::from),
            snapshot_interval: env_ms("RELAY_SNAPSHOT_INTERVAL_MS", DEFAULT_SNAPSHOT_INTERVAL_MS),
            workspace: WorkspaceIdentity::from_env(),
        }
        .normalized()
    }

    /// Enforce cross-field constraints.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.client_timeout < self.query_timeout {
            self.client_timeout = self.query_timeout;
        }
        self
    }

    /// Hub address, falling back to loopback when the host does not parse.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        let host: IpAddr = self.host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(host, self.port)
    }

    #[must_use]
    pub fn election(&self) -> ElectionSettings {
        ElectionSettings { addr: self.addr(), settle_delay: self.settle_delay, probe_retries: self.probe_retries }
    }

    #[must_use]
    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            addr: self.addr(),
            registration: self.workspace.registration(),
            query_timeout: self.client_timeout.max(self.query_timeout),
            ping_interval: self.ping_interval,
            codec: WireCodec::Protobuf,
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
