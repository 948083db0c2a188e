//! Cluster addressing primitives.
//!
//! A node is identified by a small integer ([`NodeId`]); a module inside a node
//! by an 8-bit local id. The two are packed into a 16-bit [`Handle`], which is
//! the only address that travels on the wire.

use std::fmt;

/// Identifier of a cluster node.
///
/// `0` is reserved and means "unassigned". Valid ids are bounded by the node
/// table size chosen at startup (at most 256 entries, so ids fit in a byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub u8);

impl NodeId {
    /// The reserved "unassigned" id.
    pub const UNASSIGNED: NodeId = NodeId(0);

    /// Returns `true` unless this is the reserved id `0`.
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    /// Index of this node in the node table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(id: u8) -> Self {
        NodeId(id)
    }
}

/// Cluster-wide module address: `node_id << 8 | local_module_id`.
///
/// A handle whose node id is `0` refers to a module of the local node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(pub u16);

impl Handle {
    /// Packs a node id and a local module id into a handle.
    pub fn new(node: NodeId, module: u8) -> Self {
        Handle(u16::from(node.0) << 8 | u16::from(module))
    }

    /// Node owning the addressed module.
    pub fn node_id(self) -> NodeId {
        NodeId((self.0 >> 8) as u8)
    }

    /// Module id, meaningful only inside the owning node.
    pub fn module_id(self) -> u8 {
        (self.0 & 0x00ff) as u8
    }

    /// Raw 16-bit value as carried on the wire.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Returns this handle with its node id replaced by `node`.
    pub fn with_node(self, node: NodeId) -> Self {
        Handle::new(node, self.module_id())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:04x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Message type tag carried in the high byte of a frame's destination field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u8);

impl MessageType {
    /// Text control sub-protocol (REG, ADDR, SUB, ... and heartbeats).
    pub const TEXT: MessageType = MessageType(1);
}

/// Local module id of the mesh control endpoint on every node.
pub const MESH_MODULE_ID: u8 = 1;

/// Local module id of the directory hosted by the center node.
pub const CENTER_MODULE_ID: u8 = 2;

/// Module name under which the center directory registers itself.
pub const CENTER_MODULE_NAME: &str = "centers";
