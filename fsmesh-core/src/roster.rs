//! Configured server roster: every known server and whether we hold a live link to it.

use std::collections::BTreeMap;

use crate::identity::NodeId;

/// One configured peer server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Dialable `host:port`.
    pub addr: String,
    /// Liveness flag driven by the connect/accept/teardown paths.
    pub connected: bool,
}

/// The known server set: this node plus the configured peers.
#[derive(Debug, Clone)]
pub struct Roster {
    local: NodeId,
    peers: BTreeMap<NodeId, PeerRecord>,
}

impl Roster {
    /// Build from the configured peer list. The local node is never stored as a peer.
    pub fn new(local: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let peers = peers
            .into_iter()
            .filter(|p| *p != local)
            .map(|p| {
                let record = PeerRecord {
                    addr: p.addr(),
                    connected: false,
                };
                (p, record)
            })
            .collect();
        Self { local, peers }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// All known servers, local node included, in id order.
    pub fn servers(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self.peers.keys().cloned().collect();
        out.push(self.local.clone());
        out.sort();
        out
    }

    pub fn server_count(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn is_server(&self, node: &NodeId) -> bool {
        *node == self.local || self.peers.contains_key(node)
    }

    pub fn is_peer(&self, node: &NodeId) -> bool {
        self.peers.contains_key(node)
    }

    /// Local node, or a peer we currently hold a connection to.
    pub fn is_live(&self, node: &NodeId) -> bool {
        *node == self.local || self.peers.get(node).is_some_and(|p| p.connected)
    }

    /// Set a peer's liveness flag. Returns false for ids that are not configured peers.
    pub fn set_connected(&mut self, node: &NodeId, connected: bool) -> bool {
        match self.peers.get_mut(node) {
            Some(record) => {
                record.connected = connected;
                true
            }
            None => false,
        }
    }

    /// Peers the reconnect loop should dial.
    pub fn disconnected(&self) -> Vec<(NodeId, String)> {
        self.peers
            .iter()
            .filter(|(_, r)| !r.connected)
            .map(|(id, r)| (id.clone(), r.addr.clone()))
            .collect()
    }
}
