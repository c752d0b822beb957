//! Availability index — which peers advertise which files.
//!
//! Updated by availability broadcasts and queried when choosing a transfer
//! counterparty. Peer removal cascades so the index never names a node the
//! registry has forgotten.

use dashmap::DashMap;
use std::collections::HashSet;

use portage_core::id::{FileId, NodeId};

/// `FileId → set<NodeId>` with the reverse mapping kept alongside so
/// peer removal is a single cascade, not a full scan.
#[derive(Default)]
pub struct AvailabilityIndex {
    by_file: DashMap<FileId, HashSet<NodeId>>,
    by_peer: DashMap<NodeId, HashSet<FileId>>,
}

impl AvailabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` offers `file`.
    pub fn advertise(&self, file: FileId, node: NodeId) {
        self.by_file.entry(file).or_default().insert(node);
        self.by_peer.entry(node).or_default().insert(file);
    }

    /// Remove one `(file, node)` entry.
    pub fn retract(&self, file: &FileId, node: &NodeId) {
        if let Some(mut peers) = self.by_file.get_mut(file) {
            peers.remove(node);
        }
        self.by_file.remove_if(file, |_, peers| peers.is_empty());
        if let Some(mut files) = self.by_peer.get_mut(node) {
            files.remove(file);
        }
        self.by_peer.remove_if(node, |_, files| files.is_empty());
    }

    /// Peers offering `file` that pass `filter` (callers pass an
    /// is-authenticated check against the peer registry).
    pub fn peers_with(&self, file: &FileId, filter: impl Fn(&NodeId) -> bool) -> Vec<NodeId> {
        self.by_file
            .get(file)
            .map(|peers| peers.iter().copied().filter(|n| filter(n)).collect())
            .unwrap_or_default()
    }

    /// Everything a node advertises.
    pub fn files_of(&self, node: &NodeId) -> Vec<FileId> {
        self.by_peer
            .get(node)
            .map(|files| files.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Cascade for a removed peer: drop every `(file, node)` entry.
    pub fn remove_peer(&self, node: &NodeId) {
        if let Some((_, files)) = self.by_peer.remove(node) {
            for file in files {
                if let Some(mut peers) = self.by_file.get_mut(&file) {
                    peers.remove(node);
                }
                self.by_file.remove_if(&file, |_, peers| peers.is_empty());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (FileId, NodeId, NodeId) {
        (FileId::derive(b"f"), NodeId::generate(), NodeId::generate())
    }

    #[test]
    fn advertise_then_query() {
        let index = AvailabilityIndex::new();
        let (file, a, b) = ids();
        index.advertise(file, a);
        index.advertise(file, b);

        let mut peers = index.peers_with(&file, |_| true);
        peers.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(peers, expected);
        assert_eq!(index.files_of(&a), vec![file]);
    }

    #[test]
    fn retract_removes_single_entry() {
        let index = AvailabilityIndex::new();
        let (file, a, b) = ids();
        index.advertise(file, a);
        index.advertise(file, b);

        index.retract(&file, &a);
        assert_eq!(index.peers_with(&file, |_| true), vec![b]);
        assert!(index.files_of(&a).is_empty());
    }

    #[test]
    fn advertise_retract_leaves_no_trace() {
        let index = AvailabilityIndex::new();
        let (file, a, _) = ids();
        index.advertise(file, a);
        index.retract(&file, &a);
        assert!(!index.peers_with(&file, |_| true).contains(&a));
        assert!(index.is_empty());
    }

    #[test]
    fn filter_excludes_peers() {
        let index = AvailabilityIndex::new();
        let (file, a, b) = ids();
        index.advertise(file, a);
        index.advertise(file, b);

        // only `a` passes the (stand-in) authentication filter
        let peers = index.peers_with(&file, |n| *n == a);
        assert_eq!(peers, vec![a]);
    }

    #[test]
    fn remove_peer_cascades_across_files() {
        let index = AvailabilityIndex::new();
        let (f1, a, b) = ids();
        let f2 = FileId::derive(b"g");
        index.advertise(f1, a);
        index.advertise(f2, a);
        index.advertise(f1, b);

        index.remove_peer(&a);
        assert_eq!(index.peers_with(&f1, |_| true), vec![b]);
        assert!(index.peers_with(&f2, |_| true).is_empty());
        assert!(index.files_of(&a).is_empty());
    }

    #[test]
    fn advertise_is_idempotent() {
        let index = AvailabilityIndex::new();
        let (file, a, _) = ids();
        index.advertise(file, a);
        index.advertise(file, a);
        assert_eq!(index.peers_with(&file, |_| true).len(), 1);
    }
}
