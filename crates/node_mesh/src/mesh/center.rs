//! Center handshake, registration and reconnect.

use super::{CenterLink, NodeMesh};
use crate::codec::{Decoded, Frame, FrameCodec};
use crate::config::CenterRole;
use crate::connection::{self, PeerLink};
use crate::control::{CenterEntry, ControlCommand, NodeAnnounce};
use crate::error::MeshError;
use crate::node_table::{NodeAddr, PeerState};
use crate::types::{Handle, MessageType, CENTER_MODULE_ID, MESH_MODULE_ID};
use bytes::{Buf, BytesMut};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

impl NodeMesh {
    /// Writes the center entry to a freshly accepted link.
    pub(super) fn send_center_entry(&self, link: &PeerLink) {
        let self_id = self.table.self_id();
        let entry = CenterEntry {
            center: Handle::new(self_id, CENTER_MODULE_ID),
            mesh: Handle::new(self_id, MESH_MODULE_ID),
        };
        let frame = self.codec.encode(
            Handle::new(self_id, 0),
            0,
            MessageType::TEXT,
            entry.encode().as_bytes(),
        );
        match frame {
            Ok(bytes) => {
                if let Err(reason) = link.send(bytes) {
                    debug!("Center entry not queued on {}: {}", link.id(), reason);
                }
            }
            Err(e) => warn!("Cannot encode center entry: {}", e),
        }
    }

    /// Connects to the configured center, reads its entry and registers.
    ///
    /// Used at startup, before the event loop runs. The connect and the
    /// handshake read are both bounded by their timeouts.
    pub(super) async fn connect_center(&mut self) -> Result<(), MeshError> {
        let Some(endpoint) = self.center_endpoint() else {
            return Ok(());
        };
        let result = handshake(
            endpoint,
            self.codec,
            self.config.connect_timeout,
            self.config.handshake_timeout,
        )
        .await;
        self.complete_center(result)
    }

    /// Starts a new center handshake when the center slot is empty.
    ///
    /// The handshake runs on its own task; the slot stays in
    /// [`PeerState::Handshaking`] until [`on_center_handshake`] sees the
    /// result, so repeated ticks never start a second attempt.
    ///
    /// [`on_center_handshake`]: NodeMesh::on_center_handshake
    pub(super) fn reconnect_center(&mut self) {
        let Some(center) = self.center else {
            return;
        };
        let Some(endpoint) = self.center_endpoint() else {
            return;
        };
        let Some(entry) = self
            .table
            .get_mut(center.node)
            .filter(|e| e.state == PeerState::Empty)
        else {
            return;
        };
        entry.state = PeerState::Handshaking;
        debug!("Reconnecting to center at {}", endpoint);

        let codec = self.codec;
        let connect_timeout = self.config.connect_timeout;
        let handshake_timeout = self.config.handshake_timeout;
        let results = self.handshakes_tx.clone();
        tokio::spawn(async move {
            let result = handshake(endpoint, codec, connect_timeout, handshake_timeout).await;
            let _ = results.send(result);
        });
    }

    /// Finishes a reconnect started by [`reconnect_center`] and replays the
    /// cached subscriptions and publications.
    ///
    /// [`reconnect_center`]: NodeMesh::reconnect_center
    pub(super) fn on_center_handshake(&mut self, result: Handshake) {
        let handshaking = self
            .center
            .and_then(|c| self.table.get(c.node))
            .is_some_and(|e| e.state == PeerState::Handshaking);
        if !handshaking {
            debug!("Dropping stale center handshake");
            return;
        }

        match self.complete_center(result) {
            Ok(()) => {
                let replay = self.cache.replay();
                info!("🔄 Replaying {} cached name(s) to center", replay.len());
                for command in replay {
                    match command {
                        ControlCommand::Sub { name } => self.request_subscription(&name),
                        command => {
                            if let Err(e) = self.send_to_center(command) {
                                warn!("Replay to center failed: {}", e);
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("⚠️ Center reconnect failed: {}", e),
        }
    }

    /// Validates a handshake result, links the center and sends `REG`.
    /// Any failure leaves the center slot empty.
    fn complete_center(&mut self, result: Handshake) -> Result<(), MeshError> {
        let endpoint = self.center_endpoint().unwrap_or_default();
        let checked = result.and_then(|(stream, entry, pending)| {
            let center_id = entry.center.node_id();
            if !self.table.contains(center_id) || center_id == self.table.self_id() {
                return Err(MeshError::Center(format!(
                    "center at {endpoint} announced invalid node id {center_id}"
                )));
            }
            if !self.conns.has_room() {
                return Err(MeshError::Center("connection limit reached".to_string()));
            }
            Ok((stream, entry, pending))
        });
        let (stream, entry, pending) = match checked {
            Ok(parts) => parts,
            Err(e) => {
                if let Some(center) = self.center {
                    self.table.reset(center.node);
                }
                return Err(e);
            }
        };
        let center_id = entry.center.node_id();

        let conn = self.conns.next_id();
        let link = connection::spawn_stream(
            conn,
            stream,
            pending,
            self.link_options,
            self.events_tx.clone(),
        );
        self.conns.insert(link, Some(center_id))?;

        self.table.update(center_id, endpoint_addr(&endpoint), entry.mesh);
        self.table.attach(center_id, conn, PeerState::Established);
        self.table.mark_sent(center_id, Instant::now());
        self.center = Some(CenterLink {
            node: center_id,
            directory: entry.center,
        });

        let me = self.table.me();
        let announce = NodeAnnounce {
            id: me.id,
            addr: me.addr.clone(),
            handle: self.mesh_handle(),
        };
        self.send_control(entry.center, &ControlCommand::Reg(announce))?;
        info!("🌐 Connected to center (node {}) at {}", center_id, endpoint);
        Ok(())
    }

    fn center_endpoint(&self) -> Option<String> {
        match &self.config.center {
            CenterRole::Remote(endpoint) => Some(endpoint.clone()),
            CenterRole::Host => None,
        }
    }
}

/// Outcome of one center handshake: the connected stream, the center entry
/// and any bytes read past it.
pub(super) type Handshake = Result<(TcpStream, CenterEntry, BytesMut), MeshError>;

/// Connects to `endpoint` and reads exactly one frame, the center entry.
///
/// Bytes read past that frame are returned so the link can decode them.
async fn handshake(
    endpoint: String,
    codec: FrameCodec,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Handshake {
    let mut stream = timeout(connect_timeout, TcpStream::connect(endpoint.as_str()))
        .await
        .map_err(|_| MeshError::Center(format!("connect to {endpoint} timed out")))?
        .map_err(|e| MeshError::Center(format!("connect to {endpoint} failed: {e}")))?;
    let _ = stream.set_nodelay(true);

    let mut buf = BytesMut::with_capacity(256);
    let frame = timeout(handshake_timeout, read_frame(&mut stream, &mut buf, &codec))
        .await
        .map_err(|_| MeshError::Center(format!("no center entry from {endpoint}")))??;
    let entry = CenterEntry::parse(&frame.payload)
        .map_err(|e| MeshError::Center(format!("invalid center entry: {e}")))?;
    Ok((stream, entry, buf))
}

async fn read_frame(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    codec: &FrameCodec,
) -> Result<Frame, MeshError> {
    loop {
        match codec.decode(buf)? {
            Decoded::Frame { frame, consumed } => {
                buf.advance(consumed);
                return Ok(frame);
            }
            Decoded::Incomplete => {
                let n = stream
                    .read_buf(buf)
                    .await
                    .map_err(|e| MeshError::Center(format!("handshake read failed: {e}")))?;
                if n == 0 {
                    return Err(MeshError::Center("center closed during handshake".into()));
                }
            }
        }
    }
}

/// Mesh address of the center as configured.
fn endpoint_addr(endpoint: &str) -> NodeAddr {
    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(0)),
        None => (endpoint, 0),
    };
    NodeAddr {
        node_host: host.to_string(),
        node_port: port,
        ..NodeAddr::default()
    }
}
