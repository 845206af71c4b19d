use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

use crate::{NodeId, OverlayId};

/// Process-wide settings plus one [`OverlayConfig`] per overlay.
///
/// Loading these from disk is the embedding daemon's business; deserializing
/// is ours. All durations are given in seconds.
#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Settings {
    /// Cadence of the signalling maintenance tick.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_presence_interval")]
    pub presence_interval: Duration,
    /// Lifetime of a cached peer-address entry.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_cache_expiry")]
    pub cache_expiry: Duration,
    /// Deadline for any pending bus request or queued remote action.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Deadline for a NAT-traversing handshake to complete.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_link_setup_timeout")]
    pub link_setup_timeout: Duration,
    /// Deadline for a kernel tunnel handshake to complete.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_geneve_setup_timeout")]
    pub geneve_setup_timeout: Duration,
    /// Tick of the timed-transaction worker.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_event_period")]
    pub event_period: Duration,
    /// Interfaces no data plane may bind, across all overlays.
    #[serde(default)]
    pub ignored_net_interfaces: Vec<String>,
    pub overlays: BTreeMap<OverlayId, OverlayConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    X509,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct OverlayConfig {
    pub host_address: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub authentication_method: AuthMethod,
    #[serde(default)]
    pub cert_directory: Option<PathBuf>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub tap_name_prefix: Option<String>,
    #[serde(default)]
    pub ignored_net_interfaces: Vec<String>,
    #[serde(default)]
    pub allow_recursive_tunneling: bool,
    /// Remote address peers bind their kernel tunnels to.
    #[serde(default)]
    pub end_point_address: Option<IpAddr>,
    /// Peers that always get a direct edge.
    #[serde(default)]
    pub static_edges: Vec<NodeId>,
    /// Only build edges from the static list.
    #[serde(default)]
    pub manual_topology: bool,
    #[serde(default = "default_min_successors")]
    pub min_successors: usize,
    #[serde(default = "default_max_long_distance_edges", rename = "MaxLongDistEdges")]
    pub max_long_distance_edges: usize,
    #[serde(default = "default_max_on_demand_edges")]
    pub max_on_demand_edges: usize,
    #[serde(default)]
    pub stun: Vec<String>,
    #[serde(default)]
    pub turn: Vec<TurnServer>,
}

#[derive(Debug, serde::Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TurnServer {
    pub address: String,
    pub user: String,
    pub password: String,
}

fn default_presence_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_expiry() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_link_setup_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_geneve_setup_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_event_period() -> Duration {
    Duration::from_secs(1)
}

fn default_min_successors() -> usize {
    2
}

fn default_max_long_distance_edges() -> usize {
    4
}

fn default_max_on_demand_edges() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_fill_defaults() {
        let json = r#"{
            "Overlays": {
                "ol001": {
                    "HostAddress": "signal.example.org",
                    "Port": 5222,
                    "Username": "node1@example.org",
                    "MinSuccessors": 2,
                    "MaxLongDistEdges": 4
                }
            }
        }"#;

        let settings = serde_json::from_str::<Settings>(json).unwrap();

        assert_eq!(settings.presence_interval, Duration::from_secs(30));
        assert_eq!(settings.cache_expiry, Duration::from_secs(60));
        assert_eq!(settings.event_period, Duration::from_secs(1));

        let overlay = &settings.overlays[&OverlayId::from("ol001")];
        assert_eq!(overlay.authentication_method, AuthMethod::Password);
        assert!(!overlay.allow_recursive_tunneling);
        assert!(!overlay.manual_topology);
    }

    #[test]
    fn x509_overlay_parses() {
        let json = r#"{
            "HostAddress": "signal.example.org",
            "Port": 5223,
            "AuthenticationMethod": "x509",
            "CertDirectory": "/etc/weft/certs",
            "CertFile": "node1.crt",
            "KeyFile": "node1.key"
        }"#;

        let overlay = serde_json::from_str::<OverlayConfig>(json).unwrap();

        assert_eq!(overlay.authentication_method, AuthMethod::X509);
        assert_eq!(overlay.cert_file.as_deref().unwrap().to_str(), Some("node1.crt"));
    }
}
