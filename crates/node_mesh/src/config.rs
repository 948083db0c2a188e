//! Runtime configuration of one mesh node.

use crate::codec::MAX_PAYLOAD_LIMIT;
use crate::error::MeshError;
use crate::node_table::NodeAddr;
use crate::types::NodeId;
use std::time::Duration;

/// Lower bound of the heartbeat interval in seconds.
pub const MIN_HEARTBEAT_SECS: u64 = 3;
/// Upper bound of the heartbeat interval in seconds.
pub const MAX_HEARTBEAT_SECS: u64 = 30;
/// Largest node table supported by the 8-bit node id.
pub const MAX_NODES: usize = 256;

/// How this node finds the cluster directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CenterRole {
    /// This node hosts the directory.
    Host,
    /// Connect to the center listening at `host:port`.
    Remote(String),
}

/// Configuration consumed by [`NodeMesh::start`](crate::NodeMesh::start).
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Id of this node, `1..max_nodes`.
    pub node_id: NodeId,
    /// Addresses of this node. `node_host:node_port` is also the listen
    /// address; port `0` picks a free port.
    pub node_addr: NodeAddr,
    pub center: CenterRole,
    /// Heartbeat interval in seconds, clamped to `[3, 30]`.
    pub heartbeat_secs: u64,
    /// Period of the heartbeat/reconnect tick.
    pub tick_interval: Duration,
    /// Node table size.
    pub max_nodes: usize,
    /// Maximum number of simultaneous links.
    pub max_connections: usize,
    /// Maximum frame payload in bytes.
    pub max_payload: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Frames buffered per link before it is considered stuck.
    pub write_queue_frames: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            node_addr: NodeAddr {
                node_host: "127.0.0.1".to_string(),
                node_port: 7100,
                ..NodeAddr::default()
            },
            center: CenterRole::Host,
            heartbeat_secs: 10,
            tick_interval: Duration::from_secs(1),
            max_nodes: MAX_NODES,
            max_connections: 1024,
            max_payload: MAX_PAYLOAD_LIMIT,
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            write_queue_frames: 4096,
        }
    }
}

impl MeshConfig {
    /// Heartbeat interval after clamping.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(clamp_heartbeat(self.heartbeat_secs))
    }

    pub fn is_center(&self) -> bool {
        self.center == CenterRole::Host
    }

    /// Checks the settings that make startup impossible.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.max_nodes < 2 || self.max_nodes > MAX_NODES {
            return Err(MeshError::Config(format!(
                "max_nodes must be in 2..={MAX_NODES}, got {}",
                self.max_nodes
            )));
        }
        if !self.node_id.is_assigned() || self.node_id.index() >= self.max_nodes {
            return Err(MeshError::Config(format!(
                "node id {} out of range 1..{}",
                self.node_id, self.max_nodes
            )));
        }
        if self.max_connections == 0 {
            return Err(MeshError::Config("max_connections must be positive".into()));
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(MeshError::Config(format!(
                "max_payload must be in 1..={MAX_PAYLOAD_LIMIT}, got {}",
                self.max_payload
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(MeshError::Config("tick_interval must be positive".into()));
        }
        if let CenterRole::Remote(endpoint) = &self.center {
            if endpoint.is_empty() {
                return Err(MeshError::Config("center address is empty".into()));
            }
        }
        Ok(())
    }
}

/// Clamps a heartbeat interval to `[3, 30]` seconds.
pub fn clamp_heartbeat(secs: u64) -> u64 {
    secs.clamp(MIN_HEARTBEAT_SECS, MAX_HEARTBEAT_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_is_clamped() {
        assert_eq!(clamp_heartbeat(0), 3);
        assert_eq!(clamp_heartbeat(12), 12);
        assert_eq!(clamp_heartbeat(600), 30);
        let config = MeshConfig {
            heartbeat_secs: 1,
            ..MeshConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_node_id_range() {
        let mut config = MeshConfig::default();
        assert!(config.validate().is_ok());

        config.node_id = NodeId(0);
        assert!(config.validate().is_err());

        config.node_id = NodeId(16);
        config.max_nodes = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_center_needs_address() {
        let config = MeshConfig {
            center: CenterRole::Remote(String::new()),
            ..MeshConfig::default()
        };
        assert!(matches!(config.validate(), Err(MeshError::Config(_))));
    }
}
