//! Peer links and the connection table.
//!
//! Every TCP connection of the mesh is a *link*: a single spawned task that
//! reads and writes one socket. The reader decodes frames and reports them to
//! the mesh as [`LinkEvent`]s. The writer drains a bounded per-link queue.
//! The mesh holds one [`PeerLink`] per live connection in a
//! [`ConnectionTable`], which maps connection ids to dense slots and records
//! the node each link belongs to.

use crate::codec::{CodecError, Frame, FrameCodec};
use crate::slot::{SlotAllocator, SlotError};
use crate::types::NodeId;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a link went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream.
    Eof,
    /// Read or write failure.
    Io(String),
    /// The peer sent a frame the codec rejected.
    Malformed(CodecError),
    /// The outbound connect failed or timed out.
    ConnectFailed(String),
    /// The write queue was full.
    Overflow,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("closed by peer"),
            CloseReason::Io(e) => write!(f, "io error: {e}"),
            CloseReason::Malformed(e) => write!(f, "protocol error: {e}"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            CloseReason::Overflow => f.write_str("write queue full"),
        }
    }
}

/// Notification from a link task to the mesh.
#[derive(Debug)]
pub enum LinkEvent {
    /// An outbound link finished connecting.
    Connected { conn: ConnectionId },
    /// Complete frames read from the socket, in arrival order.
    Frames { conn: ConnectionId, frames: Vec<Frame> },
    /// The link is gone. No further events follow for `conn`.
    Closed {
        conn: ConnectionId,
        reason: CloseReason,
    },
}

/// Settings shared by every link.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub codec: FrameCodec,
    pub write_queue_frames: usize,
    pub connect_timeout: Duration,
}

/// Mesh-side handle of a running link.
#[derive(Debug, Clone)]
pub struct PeerLink {
    id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
}

impl PeerLink {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an encoded frame without waiting.
    ///
    /// A full queue is reported as [`CloseReason::Overflow`]; the caller is
    /// expected to tear the link down.
    pub fn send(&self, frame: Bytes) -> Result<(), CloseReason> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CloseReason::Overflow,
            mpsc::error::TrySendError::Closed(_) => CloseReason::Eof,
        })
    }
}

/// Starts a link over an already connected stream.
///
/// `pending` holds bytes read from the stream before the link took it over
/// (the tail of a handshake read); they are decoded before anything else.
pub fn spawn_stream(
    id: ConnectionId,
    stream: TcpStream,
    pending: BytesMut,
    options: LinkOptions,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> PeerLink {
    let (tx, rx) = mpsc::channel(options.write_queue_frames.max(1));
    tokio::spawn(async move {
        if let Some(reason) = run_link(id, stream, pending, rx, options.codec, &events).await {
            let _ = events.send(LinkEvent::Closed { conn: id, reason });
        }
    });
    PeerLink { id, tx }
}

/// Starts a link that first connects to `endpoint`.
///
/// Frames may be queued right away; they are written once the connect
/// completes. Success is reported as [`LinkEvent::Connected`], failure as
/// [`LinkEvent::Closed`] with [`CloseReason::ConnectFailed`].
pub fn spawn_connect(
    id: ConnectionId,
    endpoint: String,
    options: LinkOptions,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> PeerLink {
    let (tx, rx) = mpsc::channel(options.write_queue_frames.max(1));
    tokio::spawn(async move {
        let connect = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&endpoint));
        let stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let reason = CloseReason::ConnectFailed(format!("{endpoint}: {e}"));
                let _ = events.send(LinkEvent::Closed { conn: id, reason });
                return;
            }
            Err(_) => {
                let reason = CloseReason::ConnectFailed(format!("{endpoint}: timed out"));
                let _ = events.send(LinkEvent::Closed { conn: id, reason });
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let _ = events.send(LinkEvent::Connected { conn: id });

        let pending = BytesMut::new();
        if let Some(reason) = run_link(id, stream, pending, rx, options.codec, &events).await {
            let _ = events.send(LinkEvent::Closed { conn: id, reason });
        }
    });
    PeerLink { id, tx }
}

/// Drives one socket until it fails or the mesh drops the link.
///
/// Returns the close reason, or `None` when the mesh released the link itself.
async fn run_link(
    id: ConnectionId,
    stream: TcpStream,
    mut buf: BytesMut,
    mut rx: mpsc::Receiver<Bytes>,
    codec: FrameCodec,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> Option<CloseReason> {
    let (mut reader, mut writer) = stream.into_split();
    buf.reserve(READ_BUFFER_SIZE);

    if !buf.is_empty() {
        if let Err(reason) = drain_frames(id, &mut buf, &codec, events) {
            return Some(reason);
        }
    }

    let mut out = BytesMut::new();
    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => return Some(CloseReason::Eof),
                Ok(n) => {
                    trace!("Link {} read {} bytes", id, n);
                    if let Err(reason) = drain_frames(id, &mut buf, &codec, events) {
                        return Some(reason);
                    }
                }
                Err(e) => return Some(CloseReason::Io(e.to_string())),
            },
            queued = rx.recv() => {
                let Some(first) = queued else {
                    debug!("Link {} released", id);
                    return None;
                };
                // Coalesce whatever else is already queued into one write.
                out.clear();
                out.extend_from_slice(&first);
                while let Ok(more) = rx.try_recv() {
                    out.extend_from_slice(&more);
                }
                if let Err(e) = writer.write_all(&out).await {
                    return Some(CloseReason::Io(e.to_string()));
                }
            }
        }
    }
}

/// Decodes every complete frame in `buf`, reports them and drops exactly the
/// consumed bytes.
fn drain_frames(
    id: ConnectionId,
    buf: &mut BytesMut,
    codec: &FrameCodec,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> Result<(), CloseReason> {
    let batch = codec.decode_batch(buf);
    buf.advance(batch.consumed);
    if !batch.frames.is_empty() {
        let _ = events.send(LinkEvent::Frames {
            conn: id,
            frames: batch.frames,
        });
    }
    match batch.error {
        Some(e) => Err(CloseReason::Malformed(e)),
        None => Ok(()),
    }
}

/// One live connection as tracked by the mesh.
#[derive(Debug)]
pub struct LinkRecord {
    pub link: PeerLink,
    /// Node this link carries traffic to; `None` for accepted links.
    pub owner: Option<NodeId>,
}

/// Live links keyed by connection id.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: SlotAllocator<ConnectionId>,
    records: Vec<Option<LinkRecord>>,
    next_id: u64,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: SlotAllocator::new(capacity),
            records: (0..capacity).map(|_| None).collect(),
            next_id: 1,
        }
    }

    /// Mints a fresh connection id. Ids are never reused.
    pub fn next_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Whether a new link can be admitted.
    pub fn has_room(&self) -> bool {
        self.slots.len() < self.slots.capacity()
    }

    pub fn insert(&mut self, link: PeerLink, owner: Option<NodeId>) -> Result<usize, SlotError> {
        let slot = self.slots.allocate(link.id())?;
        self.records[slot] = Some(LinkRecord { link, owner });
        Ok(slot)
    }

    pub fn get(&self, conn: ConnectionId) -> Option<&LinkRecord> {
        let slot = self.slots.find(conn).ok()?;
        self.records[slot].as_ref()
    }

    /// Node that owns `conn`.
    pub fn owner(&self, conn: ConnectionId) -> Option<NodeId> {
        self.get(conn).and_then(|r| r.owner)
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<LinkRecord> {
        let slot = self.slots.free(conn).ok()?;
        self.records[slot].take()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drops every link, which stops their tasks.
    pub fn clear(&mut self) {
        let ids: Vec<ConnectionId> = self.slots.iter().map(|(_, id)| id).collect();
        for id in ids {
            self.remove(id);
        }
    }
}
