//! Frame routing decisions.
//!
//! The router decides where a frame goes; the mesh loop carries the decision
//! out. Outbound, a destination handle either stays on this node or names the
//! peer whose link must carry it. Inbound, the destination module id selects
//! between the mesh control endpoint, the center directory and ordinary local
//! modules.

use crate::codec::Frame;
use crate::control::{ControlCommand, ControlError};
use crate::modules::{Delivery, LocalDispatcher};
use crate::types::{Handle, MessageType, NodeId, CENTER_MODULE_ID, MESH_MODULE_ID};
use std::sync::Arc;
use tracing::{debug, trace};

/// Where an outbound frame has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Module on this node.
    Local(u8),
    /// Module hosted by another node.
    Remote(NodeId),
}

/// Classification of a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Control command for the mesh endpoint.
    Control { source: Handle, command: ControlCommand },
    /// Request for the center directory.
    Directory { source: Handle, command: ControlCommand },
    /// Frame for a local module.
    Deliver(Delivery),
    /// Nothing to do.
    Dropped,
}

/// Routes frames for one node.
pub struct Router {
    self_id: NodeId,
    is_center: bool,
    dispatcher: Arc<dyn LocalDispatcher>,
}

impl Router {
    pub fn new(self_id: NodeId, is_center: bool, dispatcher: Arc<dyn LocalDispatcher>) -> Self {
        Self {
            self_id,
            is_center,
            dispatcher,
        }
    }

    /// Resolves the node that hosts `dest`.
    ///
    /// Handles with node id `0` or this node's id are local.
    pub fn destination(&self, dest: Handle) -> Destination {
        let node = dest.node_id();
        if !node.is_assigned() || node == self.self_id {
            Destination::Local(dest.module_id())
        } else {
            Destination::Remote(node)
        }
    }

    /// Decides what to do with a frame addressed to this node.
    pub fn classify(&self, frame: Frame) -> Inbound {
        if frame.msg_type != MessageType::TEXT {
            return Inbound::Deliver(into_delivery(frame));
        }
        match frame.dest {
            MESH_MODULE_ID => match ControlCommand::parse(&frame.payload) {
                Ok(command) => Inbound::Control {
                    source: frame.source,
                    command,
                },
                Err(e) => {
                    log_ignored(frame.source, &e);
                    Inbound::Dropped
                }
            },
            CENTER_MODULE_ID if self.is_center => match ControlCommand::parse(&frame.payload) {
                Ok(command) => Inbound::Directory {
                    source: frame.source,
                    command,
                },
                Err(e) => {
                    log_ignored(frame.source, &e);
                    Inbound::Dropped
                }
            },
            // Center entry replayed on a plain peer link.
            0 => {
                trace!("Dropping text frame for module 0 from {}", frame.source);
                Inbound::Dropped
            }
            _ => Inbound::Deliver(into_delivery(frame)),
        }
    }

    /// Hands a frame to the local dispatcher.
    pub fn dispatch(&self, delivery: Delivery) {
        trace!(
            "Delivering {} bytes from {} to local module {}",
            delivery.payload.len(),
            delivery.source,
            delivery.dest
        );
        self.dispatcher.dispatch(delivery);
    }
}

fn into_delivery(frame: Frame) -> Delivery {
    Delivery {
        source: frame.source,
        dest: frame.dest,
        msg_type: frame.msg_type,
        payload: frame.payload,
    }
}

fn log_ignored(source: Handle, error: &ControlError) {
    debug!("Ignoring control message from {}: {}", source, error);
}
