//! Relay server configuration

use crate::heartbeat::HeartbeatConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use wormhole_mux::MuxConfig;

/// Everything the tunnel server needs to run
#[derive(Clone)]
pub struct ServerConfig {
    /// Identifies this node in registry records
    pub node_id: String,

    /// Host name advertised in endpoint addresses (`<localhost>:<port>`)
    pub localhost: String,

    /// Cluster this node belongs to, recorded with each session
    pub cluster_url: String,

    /// PKCS#8 PEM server key
    pub private_key: Vec<u8>,

    /// Interface public endpoints listen on
    pub endpoint_bind_ip: IpAddr,

    /// Limit for the handshake and for the client hello
    pub handshake_timeout: Duration,

    pub heartbeat: HeartbeatConfig,

    pub mux: MuxConfig,
}

impl ServerConfig {
    pub fn new(node_id: impl Into<String>, localhost: impl Into<String>, private_key: Vec<u8>) -> Self {
        Self {
            node_id: node_id.into(),
            localhost: localhost.into(),
            cluster_url: String::new(),
            private_key,
            endpoint_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            handshake_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            mux: MuxConfig::default(),
        }
    }

    pub fn with_cluster_url(mut self, cluster_url: impl Into<String>) -> Self {
        self.cluster_url = cluster_url.into();
        self
    }

    pub fn with_endpoint_bind_ip(mut self, ip: IpAddr) -> Self {
        self.endpoint_bind_ip = ip;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_mux(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("node_id", &self.node_id)
            .field("localhost", &self.localhost)
            .field("cluster_url", &self.cluster_url)
            .field("endpoint_bind_ip", &self.endpoint_bind_ip)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("heartbeat", &self.heartbeat)
            .field("mux", &self.mux)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_builders() {
        let config = ServerConfig::new("node-1", "relay.example.com", b"pem".to_vec())
            .with_cluster_url("https://cluster.example.com")
            .with_endpoint_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_handshake_timeout(Duration::from_secs(3));

        assert_eq!(config.node_id, "node-1");
        assert_eq!(config.cluster_url, "https://cluster.example.com");
        assert_eq!(config.endpoint_bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.heartbeat.startup_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let config = ServerConfig::new("node-1", "relay", b"SECRET KEY MATERIAL".to_vec());
        assert!(!format!("{:?}", config).contains("SECRET"));
    }
}
