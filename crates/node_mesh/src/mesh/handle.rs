use super::MeshCommand;
use crate::directory::DirectorySnapshot;
use crate::error::MeshError;
use crate::node_table::NodeEntry;
use crate::types::{Handle, MessageType, NodeId};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};

/// Cloneable handle to a running mesh node.
///
/// Every call is forwarded to the mesh task over a channel. Once the mesh has
/// shut down all calls fail with [`MeshError::Closed`].
#[derive(Debug, Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<MeshCommand>,
    node_id: NodeId,
    local_addr: SocketAddr,
    is_center: bool,
}

impl MeshHandle {
    pub(super) fn new(
        commands: mpsc::Sender<MeshCommand>,
        node_id: NodeId,
        local_addr: SocketAddr,
        is_center: bool,
    ) -> Self {
        Self {
            commands,
            node_id,
            local_addr,
            is_center,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Address the mesh listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether this node hosts the cluster directory.
    pub fn is_center(&self) -> bool {
        self.is_center
    }

    /// Sends `payload` from the local module `source` to `dest`.
    ///
    /// Frames for this node are delivered to the local dispatcher directly.
    /// Frames for another node are queued on its link; delivery failures past
    /// that point show up as a disconnect of that node, not as an error here.
    ///
    /// # Errors
    ///
    /// * [`MeshError::NotConnected`] if the destination node has no link
    /// * [`MeshError::InvalidNode`] if the node id is outside the table
    /// * [`MeshError::Codec`] if the payload is too large
    pub async fn send(
        &self,
        source: Handle,
        dest: Handle,
        msg_type: MessageType,
        payload: impl Into<Bytes>,
    ) -> Result<(), MeshError> {
        let payload = payload.into();
        self.request(|reply| MeshCommand::Send {
            source,
            dest,
            msg_type,
            payload,
            reply,
        })
        .await?
    }

    /// Subscribes to the module `name`.
    ///
    /// The name is cached and resent after every center reconnect. A local
    /// module with that name is reported right away.
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidName`] if `name` is empty or contains whitespace,
    /// `:` or `,`.
    pub async fn subscribe(&self, name: &str) -> Result<(), MeshError> {
        let name = name.to_string();
        self.request(|reply| MeshCommand::Subscribe { name, reply })
            .await?
    }

    /// Publishes the local module `handle` under `name` and returns its
    /// cluster-wide handle. Names follow the same rules as
    /// [`subscribe`](Self::subscribe).
    pub async fn publish(&self, name: &str, handle: Handle) -> Result<Handle, MeshError> {
        let name = name.to_string();
        self.request(|reply| MeshCommand::Publish {
            name,
            handle,
            reply,
        })
        .await?
    }

    /// Runs the heartbeat and reconnect pass now instead of waiting for the
    /// next timer tick.
    ///
    /// A center reconnect only starts here: the center slot reads
    /// [`PeerState::Handshaking`](crate::PeerState::Handshaking) until the
    /// handshake finishes in the background.
    pub async fn tick(&self) -> Result<(), MeshError> {
        self.request(|reply| MeshCommand::Tick { reply }).await
    }

    /// Snapshot of the table entry of node `id`.
    pub async fn peer(&self, id: NodeId) -> Result<Option<NodeEntry>, MeshError> {
        self.request(|reply| MeshCommand::Peer { id, reply }).await
    }

    /// Snapshots of every peer that is not empty.
    pub async fn peers(&self) -> Result<Vec<NodeEntry>, MeshError> {
        self.request(|reply| MeshCommand::Peers { reply }).await
    }

    /// Directory contents; `None` unless this node is the center.
    pub async fn directory(&self) -> Result<Option<DirectorySnapshot>, MeshError> {
        self.request(|reply| MeshCommand::Directory { reply }).await
    }

    /// Stops the mesh task and closes every link.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(|reply| MeshCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MeshCommand,
    ) -> Result<T, MeshError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MeshError::Closed)?;
        response.await.map_err(|_| MeshError::Closed)
    }
}
