//! Peer registry — every remote node we know about and what state its
//! session is in.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use portage_core::id::{FileId, NodeId, PeerAddress};

/// Connection lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Seen in discovery, no session attempted.
    Discovered,
    Connecting,
    Handshaking,
    KeyExchanging,
    Authenticated,
    Failed,
    Disconnected,
}

/// Tracked state for one remote node.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub address: PeerAddress,
    pub state: PeerState,
    /// Whether the session key has been derived. A peer is authenticated
    /// exactly when this is true.
    pub has_key: bool,
    /// Session connection attempts so far.
    pub attempts: u32,
    /// Files this peer advertises.
    pub advertised: HashSet<FileId>,
    pub protocol_version: String,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn new(node_id: NodeId, address: PeerAddress) -> Self {
        Self {
            node_id,
            address,
            state: PeerState::Discovered,
            has_key: false,
            attempts: 0,
            advertised: HashSet::new(),
            protocol_version: String::new(),
            last_seen: Instant::now(),
        }
    }

    /// Move to Authenticated. The key flag and the state change together,
    /// never separately.
    pub fn mark_authenticated(&mut self) {
        self.state = PeerState::Authenticated;
        self.has_key = true;
        self.last_seen = Instant::now();
    }

    /// Leave Authenticated; the key is forgotten at the same time.
    pub fn mark_disconnected(&mut self, state: PeerState) {
        debug_assert!(matches!(
            state,
            PeerState::Failed | PeerState::Disconnected
        ));
        self.state = state;
        self.has_key = false;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == PeerState::Authenticated
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// The peer registry — shared between discovery, sessions, and the
/// dispatcher. Keyed on node id.
pub type PeerRegistry = Arc<DashMap<NodeId, PeerRecord>>;

/// Create a new empty peer registry.
pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}

/// Is this node currently authenticated?
pub fn is_authenticated(registry: &PeerRegistry, node: &NodeId) -> bool {
    registry
        .get(node)
        .map(|p| p.is_authenticated())
        .unwrap_or(false)
}
