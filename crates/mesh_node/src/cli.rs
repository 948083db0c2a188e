//! Command-line interface of the mesh node binary.
//!
//! Every option overrides the matching setting of the configuration file.

use clap::Parser;
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Cluster node of the game-server mesh", long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// If the file doesn't exist, a default configuration will be created.
    #[arg(short, long, default_value = "mesh_node.toml")]
    pub config: PathBuf,

    /// Node id override (1-255)
    #[arg(short, long)]
    pub node_id: Option<u8>,

    /// Mesh listen port override
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Center address override
    ///
    /// Format: "HOST:PORT" (e.g., "10.0.0.1:7100"). Implies this node is
    /// not the center.
    #[arg(long, value_name = "ADDRESS", conflicts_with = "center")]
    pub center_addr: Option<String>,

    /// Run this node as the cluster center
    #[arg(long)]
    pub center: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("mesh_node.toml"),
            node_id: None,
            port: None,
            center_addr: None,
            center: false,
            log_level: None,
            json_logs: false,
        }
    }
}
