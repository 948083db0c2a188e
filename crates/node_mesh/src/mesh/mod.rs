//! The mesh event loop.
//!
//! A [`NodeMesh`] owns every piece of mutable mesh state: the node table,
//! the connection table, the pub/sub caches and, on the center, the
//! directory. It runs as one tokio task that multiplexes listener accepts,
//! link events, API commands and the periodic tick. Callers talk to it only
//! through a cloneable [`MeshHandle`].

mod center;
mod core;
mod handle;
mod handlers;

pub use handle::MeshHandle;

use crate::cache::PubSubCache;
use crate::codec::FrameCodec;
use crate::config::MeshConfig;
use crate::connection::{ConnectionTable, LinkEvent, LinkOptions};
use crate::directory::{Directory, DirectorySnapshot};
use crate::error::MeshError;
use crate::modules::ModuleDirectory;
use crate::node_table::{NodeEntry, NodeTable};
use crate::router::Router;
use crate::types::{Handle, MessageType, NodeId};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Where the cluster directory of a client node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CenterLink {
    node: NodeId,
    /// Handle of the remote `centers` module.
    directory: Handle,
}

/// Requests accepted by the mesh task.
#[derive(Debug)]
enum MeshCommand {
    Send {
        source: Handle,
        dest: Handle,
        msg_type: MessageType,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Subscribe {
        name: String,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Publish {
        name: String,
        handle: Handle,
        reply: oneshot::Sender<Result<Handle, MeshError>>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
    Peer {
        id: NodeId,
        reply: oneshot::Sender<Option<NodeEntry>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<NodeEntry>>,
    },
    Directory {
        reply: oneshot::Sender<Option<DirectorySnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// State of one mesh node, owned by its event loop task.
pub struct NodeMesh {
    config: MeshConfig,
    codec: FrameCodec,
    link_options: LinkOptions,
    table: NodeTable,
    conns: ConnectionTable,
    cache: PubSubCache,
    /// Present on the center only.
    directory: Option<Directory>,
    /// Present on client nodes once the center is known.
    center: Option<CenterLink>,
    router: Router,
    modules: Arc<dyn ModuleDirectory>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    /// Results of center reconnect handshakes running off the loop.
    handshakes_tx: mpsc::UnboundedSender<center::Handshake>,
}
