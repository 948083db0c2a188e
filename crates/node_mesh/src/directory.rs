//! Rendezvous directory hosted by the center node.
//!
//! The directory is plain state: it consumes control commands addressed to
//! the `centers` module and answers with [`DirectoryEffect`]s that the mesh
//! carries out. It never touches sockets.

use crate::control::{ControlCommand, NodeAnnounce};
use crate::types::{Handle, NodeId};
use std::collections::BTreeMap;

/// Action requested by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEffect {
    /// Link the center to a newly announced node.
    Register(NodeAnnounce),
    /// Introduce `id` to every other established peer.
    Broadcast(NodeId),
    /// Send a control command to the mesh module of node `to`.
    Send { to: NodeId, command: ControlCommand },
    /// A node reported that `id` left the cluster.
    NodeLeft(NodeId),
}

/// Publishers and subscribers per module name.
#[derive(Debug, Default, Clone)]
pub struct Directory {
    publishers: BTreeMap<String, Vec<Handle>>,
    subscribers: BTreeMap<String, Vec<NodeId>>,
}

/// Point-in-time view of the directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    pub publishers: BTreeMap<String, Vec<Handle>>,
    pub subscribers: BTreeMap<String, Vec<NodeId>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one command sent by node `from`.
    pub fn handle(&mut self, from: NodeId, command: ControlCommand) -> Vec<DirectoryEffect> {
        match command {
            ControlCommand::Reg(node) => {
                let id = node.id;
                vec![DirectoryEffect::Register(node), DirectoryEffect::Broadcast(id)]
            }
            ControlCommand::Sub { name } => self.subscribe(from, name),
            ControlCommand::Pub { name, handle } => self.publish(name, handle),
            ControlCommand::Unreg(id) => vec![DirectoryEffect::NodeLeft(id)],
            // Everything else is meant for the mesh module, not the directory.
            _ => Vec::new(),
        }
    }

    fn subscribe(&mut self, from: NodeId, name: String) -> Vec<DirectoryEffect> {
        let subs = self.subscribers.entry(name.clone()).or_default();
        if !subs.contains(&from) {
            subs.push(from);
        }

        let publishers = self.publishers.get(&name).cloned().unwrap_or_default();
        let command = match publishers.as_slice() {
            [only] => ControlCommand::Handle {
                name,
                handle: *only,
            },
            _ => ControlCommand::Handles {
                name,
                handles: publishers,
            },
        };
        vec![DirectoryEffect::Send { to: from, command }]
    }

    fn publish(&mut self, name: String, handle: Handle) -> Vec<DirectoryEffect> {
        let pubs = self.publishers.entry(name.clone()).or_default();
        if pubs.contains(&handle) {
            return Vec::new();
        }
        pubs.push(handle);

        self.subscribers
            .get(&name)
            .into_iter()
            .flatten()
            .map(|&to| DirectoryEffect::Send {
                to,
                command: ControlCommand::Handle {
                    name: name.clone(),
                    handle,
                },
            })
            .collect()
    }

    /// Forgets every publication and subscription of node `id`.
    pub fn remove_node(&mut self, id: NodeId) {
        for pubs in self.publishers.values_mut() {
            pubs.retain(|h| h.node_id() != id);
        }
        self.publishers.retain(|_, pubs| !pubs.is_empty());
        for subs in self.subscribers.values_mut() {
            subs.retain(|s| *s != id);
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            publishers: self.publishers.clone(),
            subscribers: self.subscribers.clone(),
        }
    }
}
