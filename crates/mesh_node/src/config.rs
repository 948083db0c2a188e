//! Configuration management for the mesh node.
//!
//! This module handles loading, validation, and conversion of node
//! configuration from TOML files and command-line arguments.

use crate::cli::Args;
use anyhow::Context;
use node_mesh::codec::MAX_PAYLOAD_LIMIT;
use node_mesh::config::MAX_NODES;
use node_mesh::{
    is_valid_name, CenterRole, MeshConfig, NodeAddr, NodeId, CENTER_MODULE_ID, CENTER_MODULE_NAME,
    MESH_MODULE_ID,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity and addresses of this node
    #[serde(default)]
    pub node: NodeSettings,
    /// Where the cluster directory lives
    #[serde(default)]
    pub center: CenterSettings,
    /// Mesh tuning
    #[serde(default)]
    pub mesh: MeshSettings,
    /// Modules hosted by this node
    #[serde(default)]
    pub modules: ModuleSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Identity and addresses of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Node id, unique in the cluster
    pub id: u8,
    /// Internal mesh host, also the listen host (empty means all interfaces)
    pub node_host: String,
    /// Internal mesh port (0 picks a free port)
    pub node_port: u16,
    /// Client gateway host advertised to peers
    pub gate_host: String,
    /// Client gateway port advertised to peers
    pub gate_port: u16,
    /// Public host handed out to clients
    pub wan_host: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: 1,
            node_host: "127.0.0.1".to_string(),
            node_port: 7100,
            gate_host: String::new(),
            gate_port: 0,
            wan_host: String::new(),
        }
    }
}

/// Location of the center node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CenterSettings {
    /// Center mesh host
    pub host: String,
    /// Center mesh port
    pub port: u16,
    /// Whether this node hosts the directory itself
    pub host_center: bool,
}

impl Default for CenterSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7100,
            host_center: true,
        }
    }
}

/// Mesh tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Heartbeat interval in seconds, clamped to [3, 30]
    pub heartbeat_secs: u64,
    /// Heartbeat and reconnect tick in milliseconds
    pub tick_interval_ms: u64,
    /// Node table size
    pub max_nodes: usize,
    /// Maximum simultaneous links
    pub max_connections: usize,
    /// Maximum frame payload in bytes
    pub max_payload: usize,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Center handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Frames buffered per link
    pub write_queue_frames: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        let defaults = MeshConfig::default();
        Self {
            heartbeat_secs: defaults.heartbeat_secs,
            tick_interval_ms: defaults.tick_interval.as_millis() as u64,
            max_nodes: defaults.max_nodes,
            max_connections: defaults.max_connections,
            max_payload: defaults.max_payload,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            write_queue_frames: defaults.write_queue_frames,
        }
    }
}

/// Modules registered at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    /// Local modules published to the cluster
    pub publish: Vec<PublishedModule>,
    /// Module names to subscribe to
    pub subscribe: Vec<String>,
}

/// One local module advertised under a name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedModule {
    pub name: String,
    /// Local module id (2-255)
    pub id: u8,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if loading/creation failed.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides on top of the file settings.
    pub fn apply_cli(&mut self, args: &Args) {
        if let Some(id) = args.node_id {
            self.node.id = id;
        }
        if let Some(port) = args.port {
            self.node.node_port = port;
        }
        if let Some(address) = &args.center_addr {
            let (host, port) = match address.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().unwrap_or(self.center.port)),
                None => (address.as_str(), self.center.port),
            };
            self.center.host = host.to_string();
            self.center.port = port;
            self.center.host_center = false;
        }
        if args.center {
            self.center.host_center = true;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.mesh.max_nodes < 2 || self.mesh.max_nodes > MAX_NODES {
            return Err(format!(
                "max_nodes must be between 2 and {MAX_NODES}, got {}",
                self.mesh.max_nodes
            ));
        }
        if self.node.id == 0 || usize::from(self.node.id) >= self.mesh.max_nodes {
            return Err(format!(
                "Node id {} out of range 1..{}",
                self.node.id, self.mesh.max_nodes
            ));
        }
        if !self.center.host_center && (self.center.host.is_empty() || self.center.port == 0) {
            return Err("Center host and port are required unless host_center is set".to_string());
        }
        if self.mesh.max_payload == 0 || self.mesh.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(format!(
                "max_payload must be between 1 and {MAX_PAYLOAD_LIMIT}, got {}",
                self.mesh.max_payload
            ));
        }
        if self.mesh.tick_interval_ms == 0 {
            return Err("tick_interval_ms cannot be zero".to_string());
        }
        if self.mesh.max_connections == 0 || self.mesh.write_queue_frames == 0 {
            return Err("max_connections and write_queue_frames must be positive".to_string());
        }
        for module in &self.modules.publish {
            if !is_valid_name(&module.name) || module.name == CENTER_MODULE_NAME {
                return Err(format!("Invalid module name: {:?}", module.name));
            }
            if module.id == 0 || module.id == MESH_MODULE_ID || module.id == CENTER_MODULE_ID {
                return Err(format!(
                    "Module {} uses reserved id {}",
                    module.name, module.id
                ));
            }
        }
        if let Some(name) = self.modules.subscribe.iter().find(|n| !is_valid_name(n)) {
            return Err(format!("Invalid subscription name: {name:?}"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Converts the file settings into the configuration the mesh starts
    /// with. The heartbeat interval is clamped on the way.
    pub fn to_mesh_config(&self) -> MeshConfig {
        let center = if self.center.host_center {
            CenterRole::Host
        } else {
            CenterRole::Remote(format!("{}:{}", self.center.host, self.center.port))
        };
        MeshConfig {
            node_id: NodeId(self.node.id),
            node_addr: NodeAddr {
                node_host: self.node.node_host.clone(),
                node_port: self.node.node_port,
                gate_host: self.node.gate_host.clone(),
                gate_port: self.node.gate_port,
                wan_host: self.node.wan_host.clone(),
            },
            center,
            heartbeat_secs: node_mesh::config::clamp_heartbeat(self.mesh.heartbeat_secs),
            tick_interval: Duration::from_millis(self.mesh.tick_interval_ms),
            max_nodes: self.mesh.max_nodes,
            max_connections: self.mesh.max_connections,
            max_payload: self.mesh.max_payload,
            connect_timeout: Duration::from_millis(self.mesh.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.mesh.handshake_timeout_ms),
            write_queue_frames: self.mesh.write_queue_frames,
        }
    }
}
