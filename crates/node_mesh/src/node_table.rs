//! Fixed-size table of cluster peers.
//!
//! One [`NodeEntry`] exists for every node id from the moment the mesh starts.
//! Entries are updated and reset in place and never removed, so iterating the
//! table while handling an event always sees a stable layout.

use crate::connection::ConnectionId;
use crate::types::{Handle, NodeId};
use std::time::{Duration, Instant};

/// Addresses a node advertises about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAddr {
    /// Internal mesh host.
    pub node_host: String,
    /// Internal mesh port.
    pub node_port: u16,
    /// Client gateway host.
    pub gate_host: String,
    /// Client gateway port.
    pub gate_port: u16,
    /// Public (WAN) host handed out to clients.
    pub wan_host: String,
}

impl NodeAddr {
    /// `host:port` of the mesh listener, if the address is usable for a
    /// connect.
    pub fn node_endpoint(&self) -> Option<String> {
        if self.node_host.is_empty() || self.node_port == 0 {
            return None;
        }
        Some(format!("{}:{}", self.node_host, self.node_port))
    }
}

/// Connection state of one peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No link.
    #[default]
    Empty,
    /// Center only: connect + handshake read in progress.
    Handshaking,
    /// Link created, TCP connect still pending. Frames are queued.
    Connecting,
    /// Link is up.
    Established,
}

/// Everything known about one node id.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub state: PeerState,
    /// Link carrying traffic to this node.
    pub link: Option<ConnectionId>,
    /// Handle of the node's mesh control module.
    pub handle: Option<Handle>,
    pub addr: NodeAddr,
    /// When the last frame was queued to this node.
    pub last_send: Option<Instant>,
    /// Module handles that became reachable through this node.
    pub bound: Vec<Handle>,
}

impl NodeEntry {
    fn empty(id: NodeId) -> Self {
        Self {
            id,
            state: PeerState::Empty,
            link: None,
            handle: None,
            addr: NodeAddr::default(),
            last_send: None,
            bound: Vec::new(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == PeerState::Established
    }

    /// `true` while the node has a link that accepts frames.
    pub fn is_linked(&self) -> bool {
        self.link.is_some()
            && matches!(self.state, PeerState::Connecting | PeerState::Established)
    }
}

/// What was attached to an entry before it was reset.
#[derive(Debug, Default)]
pub struct Detached {
    pub link: Option<ConnectionId>,
    pub bound: Vec<Handle>,
    pub was: PeerState,
}

/// Dense node table indexed by [`NodeId`].
#[derive(Debug)]
pub struct NodeTable {
    self_id: NodeId,
    entries: Vec<NodeEntry>,
}

impl NodeTable {
    /// Creates a table with `capacity` entries and records this node's own
    /// addresses in its slot.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of slots, at most 256
    /// * `self_id` - Id of this node, must be below `capacity`
    /// * `self_addr` - Addresses of this node
    pub fn new(capacity: usize, self_id: NodeId, self_addr: NodeAddr) -> Self {
        let capacity = capacity.min(256);
        let mut entries: Vec<NodeEntry> = (0..capacity)
            .map(|i| NodeEntry::empty(NodeId(i as u8)))
            .collect();
        if let Some(me) = entries.get_mut(self_id.index()) {
            me.addr = self_addr;
        }
        Self { self_id, entries }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Whether `id` addresses a usable slot.
    pub fn contains(&self, id: NodeId) -> bool {
        id.is_assigned() && id.index() < self.entries.len()
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeEntry> {
        if !self.contains(id) {
            return None;
        }
        self.entries.get(id.index())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        if !self.contains(id) {
            return None;
        }
        self.entries.get_mut(id.index())
    }

    /// This node's own entry.
    pub fn me(&self) -> &NodeEntry {
        &self.entries[self.self_id.index()]
    }

    pub fn me_mut(&mut self) -> &mut NodeEntry {
        let idx = self.self_id.index();
        &mut self.entries[idx]
    }

    /// Records addresses and control handle of `id` without touching its link.
    pub fn update(&mut self, id: NodeId, addr: NodeAddr, handle: Handle) -> bool {
        match self.get_mut(id) {
            Some(entry) => {
                entry.addr = addr;
                entry.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    /// Binds `link` to `id` in the given state.
    pub fn attach(&mut self, id: NodeId, link: ConnectionId, state: PeerState) {
        if let Some(entry) = self.get_mut(id) {
            entry.link = Some(link);
            entry.state = state;
        }
    }

    /// Resets `id` to [`PeerState::Empty`].
    ///
    /// Link and control handle are cleared together; addresses are kept so the
    /// node can be reached again later.
    pub fn reset(&mut self, id: NodeId) -> Detached {
        let Some(entry) = self.get_mut(id) else {
            return Detached::default();
        };
        let detached = Detached {
            link: entry.link.take(),
            bound: std::mem::take(&mut entry.bound),
            was: entry.state,
        };
        entry.handle = None;
        entry.state = PeerState::Empty;
        entry.last_send = None;
        detached
    }

    /// Records that `handle` is reachable through node `id`.
    ///
    /// Returns `false` if the handle was already bound (or `id` is invalid).
    pub fn bind(&mut self, id: NodeId, handle: Handle) -> bool {
        match self.get_mut(id) {
            Some(entry) if !entry.bound.contains(&handle) => {
                entry.bound.push(handle);
                true
            }
            _ => false,
        }
    }

    pub fn mark_sent(&mut self, id: NodeId, now: Instant) {
        if let Some(entry) = self.get_mut(id) {
            entry.last_send = Some(now);
        }
    }

    /// Peers owed a heartbeat at `now`.
    ///
    /// A peer qualifies when it is established, has a known control handle and
    /// nothing was sent to it for at least `interval`.
    pub fn heartbeats_due(&self, now: Instant, interval: Duration) -> Vec<(NodeId, Handle)> {
        self.peers()
            .filter(|e| e.is_established())
            .filter_map(|e| {
                let handle = e.handle?;
                let idle = match e.last_send {
                    Some(at) => now.saturating_duration_since(at) >= interval,
                    None => true,
                };
                idle.then_some((e.id, handle))
            })
            .collect()
    }

    /// Every slot except the reserved id `0` and this node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeEntry> + '_ {
        let me = self.self_id;
        self.entries
            .iter()
            .skip(1)
            .filter(move |e| e.id != me)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddr {
        NodeAddr {
            node_host: "127.0.0.1".to_string(),
            node_port: port,
            ..NodeAddr::default()
        }
    }

    #[test]
    fn test_table_has_fixed_slots() {
        let table = NodeTable::new(16, NodeId(2), addr(7002));
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.me().addr.node_port, 7002);
        assert!(table.get(NodeId(0)).is_none());
        assert!(table.get(NodeId(16)).is_none());
        assert_eq!(table.peers().count(), 14);
    }

    #[test]
    fn test_reset_clears_link_and_handle_together() {
        let mut table = NodeTable::new(8, NodeId(1), addr(7001));
        table.update(NodeId(3), addr(7003), Handle(0x0301));
        table.attach(NodeId(3), ConnectionId(9), PeerState::Established);
        assert!(table.bind(NodeId(3), Handle(0x0305)));
        assert!(!table.bind(NodeId(3), Handle(0x0305)));

        let detached = table.reset(NodeId(3));
        assert_eq!(detached.link, Some(ConnectionId(9)));
        assert_eq!(detached.bound, vec![Handle(0x0305)]);
        assert_eq!(detached.was, PeerState::Established);

        let entry = table.get(NodeId(3)).unwrap();
        assert_eq!(entry.state, PeerState::Empty);
        assert!(entry.link.is_none());
        assert!(entry.handle.is_none());
        assert!(entry.bound.is_empty());
        assert_eq!(entry.addr.node_port, 7003);
    }

    #[test]
    fn test_update_does_not_touch_link() {
        let mut table = NodeTable::new(8, NodeId(1), addr(7001));
        table.attach(NodeId(4), ConnectionId(1), PeerState::Established);
        table.update(NodeId(4), addr(7104), Handle(0x0401));
        let entry = table.get(NodeId(4)).unwrap();
        assert_eq!(entry.link, Some(ConnectionId(1)));
        assert!(entry.is_established());
        assert!(!table.update(NodeId(0), addr(1), Handle(1)));
    }

    #[test]
    fn test_heartbeat_requires_established_and_handle() {
        let mut table = NodeTable::new(8, NodeId(1), addr(7001));
        let now = Instant::now();
        table.attach(NodeId(2), ConnectionId(1), PeerState::Established);
        table.attach(NodeId(3), ConnectionId(2), PeerState::Connecting);
        table.update(NodeId(3), addr(7003), Handle(0x0301));
        assert!(table.heartbeats_due(now, Duration::from_secs(3)).is_empty());

        table.update(NodeId(2), addr(7002), Handle(0x0201));
        assert_eq!(
            table.heartbeats_due(now, Duration::from_secs(3)),
            vec![(NodeId(2), Handle(0x0201))]
        );
    }

    #[test]
    fn test_heartbeat_cadence_over_window() {
        let mut table = NodeTable::new(4, NodeId(1), addr(7001));
        table.update(NodeId(2), addr(7002), Handle(0x0201));
        table.attach(NodeId(2), ConnectionId(1), PeerState::Established);

        let interval = Duration::from_secs(3);
        let start = Instant::now();
        table.mark_sent(NodeId(2), start);

        let window = 31u64;
        let mut sent = 0u64;
        for second in 1..=window {
            let now = start + Duration::from_secs(second);
            for (id, _) in table.heartbeats_due(now, interval) {
                table.mark_sent(id, now);
                sent += 1;
            }
        }
        assert_eq!(sent, window / 3);
        assert!(sent <= window.div_ceil(3));
    }

    #[test]
    fn test_other_traffic_postpones_heartbeat() {
        let mut table = NodeTable::new(4, NodeId(1), addr(7001));
        table.update(NodeId(2), addr(7002), Handle(0x0201));
        table.attach(NodeId(2), ConnectionId(1), PeerState::Established);
        let start = Instant::now();
        table.mark_sent(NodeId(2), start + Duration::from_secs(2));
        assert!(table
            .heartbeats_due(start + Duration::from_secs(4), Duration::from_secs(3))
            .is_empty());
    }

    #[test]
    fn test_node_endpoint() {
        assert_eq!(addr(7000).node_endpoint().as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(addr(0).node_endpoint(), None);
        assert_eq!(NodeAddr::default().node_endpoint(), None);
    }
}
