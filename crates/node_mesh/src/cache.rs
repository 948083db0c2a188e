//! Subscription and publication caches replayed after a center reconnect.

use crate::control::ControlCommand;
use crate::types::Handle;

/// Names this node subscribed to and published, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct PubSubCache {
    subs: Vec<String>,
    pubs: Vec<(String, Handle)>,
}

impl PubSubCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches a subscription. Returns `false` if `name` was already cached.
    pub fn subscribe(&mut self, name: &str) -> bool {
        if self.subs.iter().any(|s| s == name) {
            return false;
        }
        self.subs.push(name.to_string());
        true
    }

    /// Caches a publication. Returns `false` if `name` was already published;
    /// the first handle wins.
    pub fn publish(&mut self, name: &str, handle: Handle) -> bool {
        if self.pubs.iter().any(|(n, _)| n == name) {
            return false;
        }
        self.pubs.push((name.to_string(), handle));
        true
    }

    /// Handle cached for the publication `name`.
    pub fn published(&self, name: &str) -> Option<Handle> {
        self.pubs.iter().find(|(n, _)| n == name).map(|(_, h)| *h)
    }

    /// Commands to resend to a fresh center: every `SUB` then every `PUB`.
    pub fn replay(&self) -> Vec<ControlCommand> {
        let subs = self
            .subs
            .iter()
            .map(|name| ControlCommand::Sub { name: name.clone() });
        let pubs = self.pubs.iter().map(|(name, handle)| ControlCommand::Pub {
            name: name.clone(),
            handle: *handle,
        });
        subs.chain(pubs).collect()
    }
}
