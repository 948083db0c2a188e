//! # Node Mesh
//!
//! Clustering layer for game-server nodes. Nodes host addressable modules and
//! connect to each other through a self-forming TCP mesh. One node, the
//! *center*, runs a directory used for discovery and pub/sub; every other node
//! registers with it at startup and links directly to the peers it needs.
//!
//! ## Layers
//!
//! * [`slot`] - fixed-capacity key to slot mapping
//! * [`codec`] - length-prefixed binary frames
//! * [`control`] - text control commands (REG, ADDR, SUB, PUB, ...)
//! * [`node_table`] - per-node peer records and heartbeat bookkeeping
//! * [`connection`] - link tasks and the connection table
//! * [`directory`] - center-side directory
//! * [`router`] - local versus remote routing decisions
//! * [`mesh`] - the event loop and its [`MeshHandle`]
//!
//! ## Example
//!
//! ```no_run
//! use node_mesh::{ChannelDispatcher, LocalModules, MeshConfig, NodeMesh};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), node_mesh::MeshError> {
//! let (modules, _module_events) = LocalModules::new();
//! let (dispatcher, _deliveries) = ChannelDispatcher::new();
//! let mesh = NodeMesh::start(MeshConfig::default(), Arc::new(modules), Arc::new(dispatcher)).await?;
//! mesh.subscribe("hall").await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod directory;
pub mod error;
pub mod mesh;
pub mod modules;
pub mod node_table;
pub mod router;
pub mod slot;
pub mod types;

pub use codec::{CodecError, Decoded, Frame, FrameCodec};
pub use config::{CenterRole, MeshConfig};
pub use control::{is_valid_name, CenterEntry, ControlCommand, ControlError, NodeAnnounce};
pub use directory::{Directory, DirectorySnapshot};
pub use error::MeshError;
pub use mesh::{MeshHandle, NodeMesh};
pub use modules::{
    ChannelDispatcher, Delivery, LocalDispatcher, LocalModules, ModuleDirectory, ModuleEvent,
};
pub use node_table::{NodeAddr, NodeEntry, PeerState};
pub use slot::{SlotAllocator, SlotError};
pub use types::{Handle, MessageType, NodeId, CENTER_MODULE_ID, CENTER_MODULE_NAME, MESH_MODULE_ID};
