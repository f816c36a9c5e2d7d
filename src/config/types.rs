//! Configuration Types

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outbound::SelectionPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub outbounds: Vec<OutboundConfig>,
    pub probe: ProbeSettings,
    pub interception: InterceptionConfig,
    pub monitoring: MonitoringConfig,
}

/// Listener and per-connection limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP and UDP listeners bind `0.0.0.0:<port>`
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub relay_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub udp_session_timeout: Duration,
    /// Time allowed for a stream to deliver its original-destination header
    #[serde(with = "humantime_serde")]
    pub header_timeout: Duration,
}

/// Routing policy source
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Inline policy text
    pub policy: Option<String>,
    /// Policy file, used when no inline policy is given
    pub policy_file: Option<PathBuf>,
    /// Root of the geosite/geoip lists
    pub data_dir: PathBuf,
}

/// One outbound group
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundConfig {
    pub name: String,
    /// Dialer links, e.g. `socks5://10.0.0.1:1080`
    pub dialers: Vec<String>,
    #[serde(default)]
    pub policy: SelectionPolicy,
}

/// Latency probe schedule shared by all groups
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub target: SocketAddr,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Interception layer setup
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InterceptionConfig {
    /// Links to bind on startup
    pub links: Vec<String>,
    /// Links known to the in-memory interception layer
    pub static_links: Vec<StaticLinkConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticLinkConfig {
    pub name: String,
    pub index: u32,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 12345,
            shutdown_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(300),
            udp_session_timeout: Duration::from_secs(30),
            header_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: None,
            policy_file: None,
            data_dir: PathBuf::from("/usr/share/tproute"),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([1, 1, 1, 1], 443)),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
