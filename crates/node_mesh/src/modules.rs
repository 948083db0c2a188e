//! Seams between the mesh and the modules hosted by a node.
//!
//! The mesh never interprets payloads. It hands deliveries to a
//! [`LocalDispatcher`] and reports module reachability to a
//! [`ModuleDirectory`]. [`LocalModules`] and [`ChannelDispatcher`] are
//! channel-backed implementations suitable for a standalone node and tests.

use crate::node_table::NodeAddr;
use crate::types::{Handle, MessageType};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

/// A frame handed to a local module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: Handle,
    /// Local module id on this node.
    pub dest: u8,
    pub msg_type: MessageType,
    pub payload: Bytes,
}

/// Receives every frame addressed to a local module.
pub trait LocalDispatcher: Send + Sync + 'static {
    fn dispatch(&self, delivery: Delivery);
}

/// Name lookup and lifecycle notifications for modules.
pub trait ModuleDirectory: Send + Sync + 'static {
    /// Local module id registered under `name`, if any.
    fn query(&self, name: &str) -> Option<u8>;

    /// `name` became reachable at `handle`, hosted by the node at `addr`.
    fn module_started(&self, name: &str, handle: Handle, addr: &NodeAddr);

    /// Start of a bulk `HANDLES` batch for `name`.
    fn batch_begin(&self, name: &str);

    /// End of a bulk `HANDLES` batch for `name`.
    fn batch_end(&self, name: &str);

    /// The module at `handle` is no longer reachable.
    fn module_exited(&self, handle: Handle);
}

/// Lifecycle notification emitted by [`LocalModules`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleEvent {
    Started {
        name: String,
        handle: Handle,
        addr: NodeAddr,
    },
    BatchBegin {
        name: String,
    },
    BatchEnd {
        name: String,
    },
    Exited {
        handle: Handle,
    },
}

/// Registry of in-process modules that forwards lifecycle notifications to a
/// channel.
#[derive(Debug)]
pub struct LocalModules {
    names: DashMap<String, u8>,
    events: mpsc::UnboundedSender<ModuleEvent>,
}

impl LocalModules {
    /// Creates an empty registry and the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ModuleEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                names: DashMap::new(),
                events,
            },
            rx,
        )
    }

    /// Registers a local module. Returns the id previously bound to `name`.
    pub fn register(&self, name: impl Into<String>, module_id: u8) -> Option<u8> {
        self.names.insert(name.into(), module_id)
    }

    pub fn unregister(&self, name: &str) -> Option<u8> {
        self.names.remove(name).map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn emit(&self, event: ModuleEvent) {
        if self.events.send(event).is_err() {
            trace!("Module event dropped, no listener");
        }
    }
}

impl ModuleDirectory for LocalModules {
    fn query(&self, name: &str) -> Option<u8> {
        self.names.get(name).map(|id| *id)
    }

    fn module_started(&self, name: &str, handle: Handle, addr: &NodeAddr) {
        self.emit(ModuleEvent::Started {
            name: name.to_string(),
            handle,
            addr: addr.clone(),
        });
    }

    fn batch_begin(&self, name: &str) {
        self.emit(ModuleEvent::BatchBegin {
            name: name.to_string(),
        });
    }

    fn batch_end(&self, name: &str) {
        self.emit(ModuleEvent::BatchEnd {
            name: name.to_string(),
        });
    }

    fn module_exited(&self, handle: Handle) {
        self.emit(ModuleEvent::Exited { handle });
    }
}

/// Dispatcher that pushes every delivery onto an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LocalDispatcher for ChannelDispatcher {
    fn dispatch(&self, delivery: Delivery) {
        if let Err(e) = self.tx.send(delivery) {
            trace!("Delivery to module {} dropped, no listener", e.0.dest);
        }
    }
}
