//! Startup, the event loop and outbound sends.

use super::center::Handshake;
use super::{MeshCommand, MeshHandle, NodeMesh};
use crate::cache::PubSubCache;
use crate::codec::{Frame, FrameCodec};
use crate::config::MeshConfig;
use crate::connection::{self, ConnectionId, ConnectionTable, LinkEvent, LinkOptions};
use crate::control::ControlCommand;
use crate::directory::Directory;
use crate::error::MeshError;
use crate::modules::{LocalDispatcher, ModuleDirectory};
use crate::node_table::{NodeTable, PeerState};
use crate::router::{Destination, Router};
use crate::types::{Handle, MessageType, NodeId, CENTER_MODULE_NAME, MESH_MODULE_ID};
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

const COMMAND_QUEUE: usize = 1024;
const LISTEN_BACKLOG: i32 = 1024;

impl NodeMesh {
    /// Starts a mesh node and returns the handle used to drive it.
    ///
    /// Startup validates the configuration, binds the listener, and unless
    /// this node is the center, connects to the center, reads its handshake
    /// and registers with it. Any failure aborts startup.
    ///
    /// # Arguments
    ///
    /// * `config` - Node configuration
    /// * `modules` - Module registry notified about reachable modules
    /// * `dispatcher` - Receives every frame addressed to a local module
    ///
    /// # Returns
    ///
    /// A [`MeshHandle`] connected to the running event loop.
    pub async fn start(
        config: MeshConfig,
        modules: Arc<dyn ModuleDirectory>,
        dispatcher: Arc<dyn LocalDispatcher>,
    ) -> Result<MeshHandle, MeshError> {
        config.validate()?;
        let node_id = config.node_id;
        let is_center = config.is_center() || modules.query(CENTER_MODULE_NAME).is_some();

        let listener = bind_listener(&config).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::Network(format!("Listener address unavailable: {e}")))?;
        info!("✅ Node {} listening on {}", node_id, local_addr);

        let mut node_addr = config.node_addr.clone();
        node_addr.node_port = local_addr.port();

        let codec = FrameCodec::new(config.max_payload);
        let link_options = LinkOptions {
            codec,
            write_queue_frames: config.write_queue_frames,
            connect_timeout: config.connect_timeout,
        };
        let mut table = NodeTable::new(config.max_nodes, node_id, node_addr);
        table.me_mut().handle = Some(Handle::new(node_id, MESH_MODULE_ID));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handshakes_tx, handshakes_rx) = mpsc::unbounded_channel();
        let mut mesh = NodeMesh {
            codec,
            link_options,
            table,
            conns: ConnectionTable::new(config.max_connections),
            cache: PubSubCache::new(),
            directory: is_center.then(Directory::new),
            center: None,
            router: Router::new(node_id, is_center, dispatcher),
            modules,
            events_tx,
            handshakes_tx,
            config,
        };

        if is_center {
            info!("🏛️ Node {} is the cluster center", node_id);
        } else {
            mesh.connect_center().await?;
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(mesh.run(listener, commands_rx, events_rx, handshakes_rx));

        Ok(MeshHandle::new(commands_tx, node_id, local_addr, is_center))
    }

    /// Event loop. Runs until shutdown is requested or every handle is gone.
    async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::Receiver<MeshCommand>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        mut handshakes: mpsc::UnboundedReceiver<Handshake>,
    ) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                Some(event) = events.recv() => self.on_link_event(event),
                Some(result) = handshakes.recv() => self.on_center_handshake(result),
                command = commands.recv() => match command {
                    Some(MeshCommand::Shutdown { reply }) => {
                        self.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.close_all();
                        break;
                    }
                },
                _ = ticker.tick() => self.tick(),
            }
        }
        info!("Node {} stopped", self.table.self_id());
    }

    fn on_command(&mut self, command: MeshCommand) {
        match command {
            MeshCommand::Send {
                source,
                dest,
                msg_type,
                payload,
                reply,
            } => {
                let result = self.route_outbound(source, dest, msg_type, payload);
                let _ = reply.send(result);
            }
            MeshCommand::Subscribe { name, reply } => {
                let _ = reply.send(self.subscribe(&name));
            }
            MeshCommand::Publish {
                name,
                handle,
                reply,
            } => {
                let _ = reply.send(self.publish(&name, handle));
            }
            MeshCommand::Tick { reply } => {
                self.tick();
                let _ = reply.send(());
            }
            MeshCommand::Peer { id, reply } => {
                let _ = reply.send(self.table.get(id).cloned());
            }
            MeshCommand::Peers { reply } => {
                let peers = self
                    .table
                    .peers()
                    .filter(|e| e.state != PeerState::Empty)
                    .cloned()
                    .collect();
                let _ = reply.send(peers);
            }
            MeshCommand::Directory { reply } => {
                let _ = reply.send(self.directory.as_ref().map(Directory::snapshot));
            }
            // Handled by the loop itself.
            MeshCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if !self.conns.has_room() {
            warn!("⚠️ Connection limit reached, rejecting {}", addr);
            return;
        }
        let _ = stream.set_nodelay(true);
        let conn = self.conns.next_id();
        let link = connection::spawn_stream(
            conn,
            stream,
            BytesMut::new(),
            self.link_options,
            self.events_tx.clone(),
        );
        if self.directory.is_some() {
            self.send_center_entry(&link);
        }
        if let Err(e) = self.conns.insert(link, None) {
            warn!("Dropping connection from {}: {}", addr, e);
            return;
        }
        debug!("Accepted connection {} from {}", conn, addr);
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { conn } => {
                let Some(id) = self.conns.owner(conn) else {
                    return;
                };
                if let Some(entry) = self.table.get_mut(id) {
                    if entry.link == Some(conn) && entry.state == PeerState::Connecting {
                        entry.state = PeerState::Established;
                        info!("🔗 Connected to node {} ({})", id, conn);
                    }
                }
            }
            LinkEvent::Frames { conn, frames } => {
                trace!("{} frame(s) on {}", frames.len(), conn);
                for frame in frames {
                    self.route_inbound(frame);
                }
            }
            LinkEvent::Closed { conn, reason } => self.on_disconnect(conn, &reason.to_string()),
        }
    }

    /// Tears down `conn` and resets the node it served.
    pub(super) fn on_disconnect(&mut self, conn: ConnectionId, reason: &str) {
        let Some(record) = self.conns.remove(conn) else {
            return;
        };
        let Some(id) = record.owner else {
            debug!("Accepted connection {} closed: {}", conn, reason);
            return;
        };
        if self.table.get(id).and_then(|e| e.link) != Some(conn) {
            return;
        }

        let detached = self.table.reset(id);
        warn!(
            "💔 Node {} disconnected ({}, was {:?}): {}",
            id, conn, detached.was, reason
        );
        for handle in detached.bound {
            self.modules.module_exited(handle);
        }

        if let Some(directory) = self.directory.as_mut() {
            directory.remove_node(id);
        } else if self.center.map(|c| c.node) != Some(id) {
            if let Err(e) = self.send_to_center(ControlCommand::Unreg(id)) {
                debug!("UNREG {} not delivered: {}", id, e);
            }
        }
    }

    /// Heartbeats, then center reconnect.
    pub(super) fn tick(&mut self) {
        let now = Instant::now();
        let interval = self.config.heartbeat_interval();
        for (id, handle) in self.table.heartbeats_due(now, interval) {
            trace!("Heartbeat to node {}", id);
            if let Err(e) = self.send_control(handle, &ControlCommand::Heartbeat) {
                debug!("Heartbeat to node {} failed: {}", id, e);
            }
        }

        if self.directory.is_none() {
            self.reconnect_center();
        }
    }

    /// Sends a frame from a module of this node.
    ///
    /// Frames for this node are routed without touching the wire. Remote
    /// frames need a link (connecting or established) to the destination node.
    pub(super) fn route_outbound(
        &mut self,
        source: Handle,
        dest: Handle,
        msg_type: MessageType,
        payload: Bytes,
    ) -> Result<(), MeshError> {
        let self_id = self.table.self_id();
        let source = source.with_node(self_id);
        match self.router.destination(dest) {
            Destination::Local(module) => {
                if payload.len() > self.codec.max_payload() {
                    return Err(crate::codec::CodecError::PayloadTooLarge {
                        size: payload.len(),
                        max: self.codec.max_payload(),
                    }
                    .into());
                }
                self.route_inbound(Frame::new(source, module, msg_type, payload));
                Ok(())
            }
            Destination::Remote(node) => {
                self.send_to_node(node, source, dest.module_id(), msg_type, &payload)
            }
        }
    }

    fn send_to_node(
        &mut self,
        node: NodeId,
        source: Handle,
        dest_module: u8,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<(), MeshError> {
        let entry = self.table.get(node).ok_or(MeshError::InvalidNode(node))?;
        let conn = match entry.link {
            Some(conn) if entry.is_linked() => conn,
            _ => return Err(MeshError::NotConnected(node)),
        };
        let record = self.conns.get(conn).ok_or(MeshError::NotConnected(node))?;

        let bytes = self.codec.encode(source, dest_module, msg_type, payload)?;
        if let Err(reason) = record.link.send(bytes) {
            // Reported like a socket error, through the event queue.
            let _ = self.events_tx.send(LinkEvent::Closed { conn, reason });
            return Ok(());
        }
        self.table.mark_sent(node, Instant::now());
        Ok(())
    }

    /// Sends a control command from this node's mesh endpoint.
    pub(super) fn send_control(
        &mut self,
        dest: Handle,
        command: &ControlCommand,
    ) -> Result<(), MeshError> {
        let source = self.mesh_handle();
        let payload = Bytes::from(command.encode());
        self.route_outbound(source, dest, MessageType::TEXT, payload)
    }

    pub(super) fn mesh_handle(&self) -> Handle {
        Handle::new(self.table.self_id(), MESH_MODULE_ID)
    }

    fn close_all(&mut self) {
        info!("🧹 Closing {} link(s)", self.conns.len());
        self.conns.clear();
    }
}

/// Binds the mesh listener on `node_host:node_port`.
async fn bind_listener(config: &MeshConfig) -> Result<TcpListener, MeshError> {
    let host = match config.node_addr.node_host.as_str() {
        "" => "0.0.0.0",
        host => host,
    };
    let endpoint = format!("{}:{}", host, config.node_addr.node_port);
    let addr = lookup_host(&endpoint)
        .await
        .map_err(|e| MeshError::Network(format!("Cannot resolve {endpoint}: {e}")))?
        .next()
        .ok_or_else(|| MeshError::Network(format!("No address for {endpoint}")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| MeshError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();
    socket
        .bind(&addr.into())
        .map_err(|e| MeshError::Network(format!("Bind {addr} failed: {e}")))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| MeshError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(|e| MeshError::Network(format!("Cannot make listener non-blocking: {e}")))?;
    TcpListener::from_std(std_listener)
        .map_err(|e| MeshError::Network(format!("Tokio listener creation failed: {e}")))
}
