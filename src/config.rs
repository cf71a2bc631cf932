//! Session configuration.

use std::time::Duration;

/// STUN servers queried when UPnP cannot provide an external address.
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun.l.google.com:19302"];

/// Interval between keepalive PINGs on the push stream. A PONG that has not
/// arrived by the next PING terminates the stream.
pub const WEBSOCKET_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on waits during session creation.
pub const SESSION_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waits during session start and hole punching.
pub const SESSION_START_TIMEOUT: Duration = Duration::from_secs(30);

/// How long UPnP gateway discovery may take.
pub const UPNP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for a hole-punching session.
#[derive(Debug, Clone)]
pub struct HolepunchConfig {
    /// STUN servers tried in order for external address discovery.
    pub stun_servers: Vec<String>,
    /// Whether to attempt UPnP gateway discovery and port mapping.
    pub upnp: bool,
    /// How long to wait for UPnP gateway discovery.
    pub upnp_discovery_timeout: Duration,
    /// Interval between keepalive PINGs on the push stream.
    pub ping_interval: Duration,
    /// Bound on waits during session creation.
    pub creation_timeout: Duration,
    /// Bound on waits during session start and hole punching.
    pub start_timeout: Duration,
}

impl Default for HolepunchConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            upnp: true,
            upnp_discovery_timeout: UPNP_DISCOVERY_TIMEOUT,
            ping_interval: WEBSOCKET_PING_INTERVAL,
            creation_timeout: SESSION_CREATION_TIMEOUT,
            start_timeout: SESSION_START_TIMEOUT,
        }
    }
}

impl HolepunchConfig {
    /// Replace the STUN server list.
    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    /// Enable or disable UPnP port mapping.
    pub fn with_upnp(mut self, upnp: bool) -> Self {
        self.upnp = upnp;
        self
    }

    /// Override the session start / hole punching timeout.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}
