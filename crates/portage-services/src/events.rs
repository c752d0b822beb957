//! Observer interface for node-level events.
//!
//! Components take an `Arc<dyn NodeObserver>` at construction instead of
//! publishing through any process-wide channel. Every hook has an empty
//! default body, so observers implement only what they care about.

use portage_core::id::{FileId, NodeId};

use crate::descriptor::TransferKey;

/// Receives domain events from sessions, transfers, and storage.
///
/// Called from async tasks; implementations must be cheap and non-blocking.
#[allow(unused_variables)]
pub trait NodeObserver: Send + Sync {
    fn peer_discovered(&self, node: NodeId, endpoint: &str) {}

    fn peer_authenticated(&self, node: NodeId) {}

    fn peer_disconnected(&self, node: NodeId, reason: &str) {}

    fn transfer_started(&self, key: &TransferKey) {}

    fn transfer_progress(&self, key: &TransferKey, bytes_acked: u64, total_bytes: u64) {}

    fn transfer_completed(&self, key: &TransferKey) {}

    fn transfer_failed(&self, key: &TransferKey, reason: &str) {}

    fn file_available(&self, file: FileId, node: NodeId) {}

    fn protocol_error(&self, node: Option<NodeId>, code: u16, detail: &str) {}

    fn storage_error(&self, detail: &str) {}
}

/// Observer that ignores everything. The default when a caller does not
/// care about events.
pub struct NullObserver;

impl NodeObserver for NullObserver {}

/// Observer that forwards everything to `tracing`. What the daemon installs.
pub struct LogObserver;

impl NodeObserver for LogObserver {
    fn peer_discovered(&self, node: NodeId, endpoint: &str) {
        tracing::debug!(%node, endpoint, "peer discovered");
    }

    fn peer_authenticated(&self, node: NodeId) {
        tracing::info!(%node, "peer authenticated");
    }

    fn peer_disconnected(&self, node: NodeId, reason: &str) {
        tracing::info!(%node, reason, "peer disconnected");
    }

    fn transfer_started(&self, key: &TransferKey) {
        tracing::info!(transfer = %key, "transfer started");
    }

    fn transfer_progress(&self, key: &TransferKey, bytes_acked: u64, total_bytes: u64) {
        tracing::debug!(transfer = %key, bytes_acked, total_bytes, "transfer progress");
    }

    fn transfer_completed(&self, key: &TransferKey) {
        tracing::info!(transfer = %key, "transfer completed");
    }

    fn transfer_failed(&self, key: &TransferKey, reason: &str) {
        tracing::warn!(transfer = %key, reason, "transfer failed");
    }

    fn file_available(&self, file: FileId, node: NodeId) {
        tracing::debug!(%file, %node, "file availability learned");
    }

    fn protocol_error(&self, node: Option<NodeId>, code: u16, detail: &str) {
        tracing::warn!(?node, code, detail, "protocol error");
    }

    fn storage_error(&self, detail: &str) {
        tracing::error!(detail, "storage error");
    }
}
