//! Error types for the mesh.

use crate::codec::CodecError;
use crate::slot::SlotError;
use crate::types::NodeId;

/// Errors reported by [`NodeMesh`](crate::NodeMesh) and
/// [`MeshHandle`](crate::MeshHandle).
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Invalid startup configuration.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Listener could not be created or bound.
    #[error("Network error: {0}")]
    Network(String),
    /// Connecting to the center or reading its handshake failed.
    #[error("Center error: {0}")]
    Center(String),
    /// The destination node has no link.
    #[error("Node {0} is not connected")]
    NotConnected(NodeId),
    /// The destination node id is outside the node table.
    #[error("Invalid destination node {0}")]
    InvalidNode(NodeId),
    /// A module name that cannot travel in control commands.
    #[error("Invalid module name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    /// The mesh task has stopped.
    #[error("Mesh is shut down")]
    Closed,
}
