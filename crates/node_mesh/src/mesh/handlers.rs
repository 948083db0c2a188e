//! Control protocol handling: registration, discovery relay and pub/sub.

use super::NodeMesh;
use crate::codec::Frame;
use crate::connection;
use crate::control::{is_valid_name, ControlCommand, NodeAnnounce};
use crate::directory::DirectoryEffect;
use crate::error::MeshError;
use crate::node_table::{NodeEntry, PeerState};
use crate::router::Inbound;
use crate::types::{Handle, NodeId, MESH_MODULE_ID};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

impl NodeMesh {
    /// Handles one frame addressed to this node.
    pub(super) fn route_inbound(&mut self, frame: Frame) {
        match self.router.classify(frame) {
            Inbound::Control { source, command } => self.handle_control(source, command),
            Inbound::Directory { source, command } => {
                self.handle_directory(source.node_id(), command)
            }
            Inbound::Deliver(delivery) => self.router.dispatch(delivery),
            Inbound::Dropped => {}
        }
    }

    fn handle_control(&mut self, source: Handle, command: ControlCommand) {
        trace!("Control from {}: {}", source, command);
        match command {
            ControlCommand::Reg(node) => self.on_reg(node),
            ControlCommand::Addr(node) => self.on_addr(node),
            ControlCommand::Broadcast(id) => self.broadcast(id),
            ControlCommand::Sub { name } => {
                if let Err(e) = self.subscribe(&name) {
                    debug!("Ignoring SUB from {}: {}", source, e);
                }
            }
            ControlCommand::Pub { name, handle } => {
                if let Err(e) = self.publish(&name, handle) {
                    debug!("Ignoring PUB from {}: {}", source, e);
                }
            }
            ControlCommand::Handle { name, handle } => self.connect_module(&name, handle),
            ControlCommand::Handles { name, handles } => {
                debug!("HANDLES {} with {} publisher(s)", name, handles.len());
                self.modules.batch_begin(&name);
                for handle in handles {
                    self.connect_module(&name, handle);
                }
                self.modules.batch_end(&name);
            }
            ControlCommand::Heartbeat => {}
            ControlCommand::Unreg(id) => {
                debug!("Ignoring UNREG {} sent to the mesh endpoint", id);
            }
        }
    }

    /// Center only: runs a directory request from node `from`.
    fn handle_directory(&mut self, from: NodeId, command: ControlCommand) {
        let Some(directory) = self.directory.as_mut() else {
            return;
        };
        let effects = directory.handle(from, command);
        for effect in effects {
            match effect {
                DirectoryEffect::Register(node) => self.on_reg(node),
                DirectoryEffect::Broadcast(id) => self.broadcast(id),
                DirectoryEffect::Send { to, command } => {
                    let dest = Handle::new(to, MESH_MODULE_ID);
                    if let Err(e) = self.send_control(dest, &command) {
                        warn!("Directory reply to node {} failed: {}", to, e);
                    }
                }
                DirectoryEffect::NodeLeft(id) => {
                    let linked = self.table.get(id).is_some_and(NodeEntry::is_linked);
                    if linked {
                        debug!("Keeping directory entries of node {}, still linked", id);
                    } else if let Some(directory) = self.directory.as_mut() {
                        info!("Node {} left, dropping its directory entries", id);
                        directory.remove_node(id);
                    }
                }
            }
        }
    }

    /// A node announced itself: record it and link to it.
    fn on_reg(&mut self, node: NodeAnnounce) {
        let self_id = self.table.self_id();
        if node.id == self_id {
            warn!("Ignoring REG for own node id {}", node.id);
            return;
        }
        let Some(entry) = self.table.get(node.id) else {
            warn!("Ignoring REG for invalid node id {}", node.id);
            return;
        };
        if entry.is_linked() || entry.state == PeerState::Handshaking {
            warn!(
                "Node {} is already {:?} ({:?}), ignoring REG",
                node.id, entry.state, entry.link
            );
            return;
        }
        info!(
            "📝 Node {} registered at {}:{}",
            node.id, node.addr.node_host, node.addr.node_port
        );
        self.table.update(node.id, node.addr, node.handle);
        self.open_peer(node.id);
    }

    /// Routing knowledge only; never opens a link.
    fn on_addr(&mut self, node: NodeAnnounce) {
        if node.id == self.table.self_id() {
            return;
        }
        if !self.table.update(node.id, node.addr, node.handle) {
            debug!("Ignoring ADDR for invalid node id {}", node.id);
        }
    }

    /// Center only: introduce node `id` and every other linked peer to each
    /// other.
    fn broadcast(&mut self, id: NodeId) {
        if self.directory.is_none() {
            return;
        }
        let Some(node) = self.table.get(id).filter(|e| e.is_linked()).cloned() else {
            debug!("BROADCAST {}: node not linked", id);
            return;
        };
        let Some(node_handle) = node.handle else {
            return;
        };
        let others: Vec<NodeEntry> = self
            .table
            .peers()
            .filter(|e| e.id != id && e.is_linked() && e.handle.is_some())
            .cloned()
            .collect();

        for other in others {
            let Some(other_handle) = other.handle else {
                continue;
            };
            let about_node = ControlCommand::Addr(announce_of(&node, node_handle));
            if let Err(e) = self.send_control(other_handle, &about_node) {
                debug!("ADDR {} to node {} failed: {}", id, other.id, e);
            }
            let about_other = ControlCommand::Addr(announce_of(&other, other_handle));
            if let Err(e) = self.send_control(node_handle, &about_other) {
                debug!("ADDR {} to node {} failed: {}", other.id, id, e);
            }
        }
    }

    /// Makes the module `name` at `handle` reachable and reports it.
    fn connect_module(&mut self, name: &str, handle: Handle) {
        let self_id = self.table.self_id();
        let node = match handle.node_id() {
            id if !id.is_assigned() => self_id,
            id => id,
        };
        if !self.table.contains(node) {
            warn!("Cannot connect module {} at {}: invalid node {}", name, handle, node);
            return;
        }
        let handle = handle.with_node(node);
        if node != self_id && !self.open_peer(node) {
            warn!("Cannot connect module {} at {}: node {} unreachable", name, handle, node);
            return;
        }
        if self.table.bind(node, handle) {
            let addr = self
                .table
                .get(node)
                .map(|e| e.addr.clone())
                .unwrap_or_default();
            info!("📦 Module {} available at {}", name, handle);
            self.modules.module_started(name, handle, &addr);
        }
    }

    /// Ensures a link to `id` exists. Returns `false` if none can be opened.
    fn open_peer(&mut self, id: NodeId) -> bool {
        let Some(entry) = self.table.get(id) else {
            return false;
        };
        if entry.is_linked() {
            return true;
        }
        if entry.state == PeerState::Handshaking {
            debug!("Node {} is handshaking, not opening a second link", id);
            return false;
        }
        let Some(endpoint) = entry.addr.node_endpoint() else {
            warn!("No address known for node {}", id);
            return false;
        };
        if !self.conns.has_room() {
            warn!("⚠️ Connection limit reached, cannot connect node {}", id);
            return false;
        }

        let conn = self.conns.next_id();
        let link = connection::spawn_connect(
            conn,
            endpoint.clone(),
            self.link_options,
            self.events_tx.clone(),
        );
        if let Err(e) = self.conns.insert(link, Some(id)) {
            warn!("Cannot track connection to node {}: {}", id, e);
            return false;
        }
        self.table.attach(id, conn, PeerState::Connecting);
        self.table.mark_sent(id, Instant::now());
        debug!("Connecting to node {} at {} ({})", id, endpoint, conn);
        true
    }

    /// Caches `name` and asks the center for its publishers. Repeating a
    /// cached name does nothing.
    pub(super) fn subscribe(&mut self, name: &str) -> Result<(), MeshError> {
        if !is_valid_name(name) {
            return Err(MeshError::InvalidName(name.to_string()));
        }
        if !self.cache.subscribe(name) {
            debug!("Already subscribed to {}", name);
            return Ok(());
        }
        self.request_subscription(name);
        Ok(())
    }

    /// Subscribes without caching: local short-circuit plus `SUB` to the
    /// center.
    pub(super) fn request_subscription(&mut self, name: &str) {
        if let Some(module) = self.modules.query(name) {
            let local = Handle::new(self.table.self_id(), module);
            self.connect_module(name, local);
        }
        let command = ControlCommand::Sub {
            name: name.to_string(),
        };
        if let Err(e) = self.send_to_center(command) {
            warn!("SUB {} not sent, will replay after reconnect: {}", name, e);
        }
    }

    /// Advertises a module of this node under `name` and returns its cluster
    /// handle.
    pub(super) fn publish(&mut self, name: &str, handle: Handle) -> Result<Handle, MeshError> {
        if !is_valid_name(name) {
            return Err(MeshError::InvalidName(name.to_string()));
        }
        let handle = handle.with_node(self.table.self_id());
        if !self.cache.publish(name, handle) {
            debug!("{} already published", name);
            return Ok(self.cache.published(name).unwrap_or(handle));
        }
        let command = ControlCommand::Pub {
            name: name.to_string(),
            handle,
        };
        if let Err(e) = self.send_to_center(command) {
            warn!("PUB {} not sent, will replay after reconnect: {}", name, e);
        }
        Ok(handle)
    }

    /// Sends a directory request, in process when this node is the center.
    pub(super) fn send_to_center(&mut self, command: ControlCommand) -> Result<(), MeshError> {
        if self.directory.is_some() {
            let self_id = self.table.self_id();
            self.handle_directory(self_id, command);
            return Ok(());
        }
        let center = self
            .center
            .ok_or_else(|| MeshError::Center("center is not known".to_string()))?;
        self.send_control(center.directory, &command)
    }
}

fn announce_of(entry: &NodeEntry, handle: Handle) -> NodeAnnounce {
    NodeAnnounce {
        id: entry.id,
        addr: entry.addr.clone(),
        handle,
    }
}
