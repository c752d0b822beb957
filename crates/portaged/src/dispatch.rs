//! The dispatcher — root of the node's supervision tree.
//!
//! Owns the listening socket, the peer/session/transfer tables, and the
//! availability index. Spawns a session actor per peer and an engine actor
//! per transfer, reaps them when they finish, and routes every inbound
//! message to the right child. Parent-to-child links are owning handles;
//! child-to-parent communication goes through the event channel, so there
//! are no reference cycles anywhere in the tree.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use portage_core::config::NodeConfig;
use portage_core::crypto::Keypair;
use portage_core::error::{ErrorCode, WireError};
use portage_core::id::{FileId, NodeId, PeerAddress};
use portage_core::message::{ChecksumResponse, Message, TransferRequest, TransferResponse};
use portage_services::{
    peer, AvailabilityIndex, ChunkStore, Direction, NodeObserver, PeerRecord, PeerRegistry,
    PeerState, TransferKey,
};

use crate::session::{self, SessionContext, SessionHandle};
use crate::transfer::{receiver, sender, EngineContext, TransferHandle};

/// Events flowing up from session and engine actors.
pub enum NodeEvent {
    SessionEstablished {
        node: NodeId,
        handle: SessionHandle,
    },
    SessionClosed {
        node: NodeId,
        reason: String,
    },
    Inbound {
        from: NodeId,
        message_id: String,
        correlation: String,
        message: Message,
    },
    TransferFinished {
        key: TransferKey,
    },
}

// ── Broadcast policy ──────────────────────────────────────────────────────────

/// Chooses which peers an availability broadcast goes to. Swap in a
/// gossip-style implementation for large meshes without touching the
/// dispatcher.
pub trait BroadcastPolicy: Send + Sync {
    fn targets(&self, peers: &PeerRegistry) -> Vec<NodeId>;
}

/// Default policy: every authenticated peer, no suppression.
pub struct FloodPolicy;

impl BroadcastPolicy for FloodPolicy {
    fn targets(&self, peers: &PeerRegistry) -> Vec<NodeId> {
        peers
            .iter()
            .filter(|e| e.value().is_authenticated())
            .map(|e| *e.key())
            .collect()
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    config: Arc<NodeConfig>,
    node_id: NodeId,
    keypair: Arc<Keypair>,
    peers: PeerRegistry,
    index: Arc<AvailabilityIndex>,
    store: Arc<ChunkStore>,
    observer: Arc<dyn NodeObserver>,
    sessions: Arc<DashMap<NodeId, SessionHandle>>,
    transfers: Arc<DashMap<TransferKey, TransferHandle>>,
    events_tx: mpsc::Sender<NodeEvent>,
    policy: Arc<dyn BroadcastPolicy>,
    shutdown_tx: broadcast::Sender<()>,
    listen_addr: SocketAddr,
}

impl Dispatcher {
    /// Bring up a node: identity, store, listener, event router, cleanup,
    /// and (unless disabled) discovery.
    pub async fn start(
        config: NodeConfig,
        observer: Arc<dyn NodeObserver>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::start_with_policy(config, observer, Arc::new(FloodPolicy)).await
    }

    pub async fn start_with_policy(
        config: NodeConfig,
        observer: Arc<dyn NodeObserver>,
        policy: Arc<dyn BroadcastPolicy>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let keypair = Arc::new(load_or_create_keypair(&config.identity.keypair_path)?);
        // the node id is bound to the identity key, so it survives restarts
        let node_id = node_id_for(&keypair);

        let store = Arc::new(
            ChunkStore::with_threshold(
                &config.storage.data_dir,
                &config.storage.temp_dir,
                config.storage.compress_threshold,
            )
            .context("opening chunk store")?,
        );

        let listener = TcpListener::bind(config.network.listen_addr.as_str())
            .await
            .with_context(|| format!("binding {}", config.network.listen_addr))?;
        let listen_addr = listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);

        let dispatcher = Arc::new(Self {
            config: config.clone(),
            node_id,
            keypair,
            peers: peer::new_registry(),
            index: Arc::new(AvailabilityIndex::new()),
            store,
            observer,
            sessions: Arc::new(DashMap::new()),
            transfers: Arc::new(DashMap::new()),
            events_tx,
            policy,
            shutdown_tx,
            listen_addr,
        });

        tracing::info!(node = %node_id, addr = %listen_addr, "node starting");

        tokio::spawn(Self::accept_loop(
            dispatcher.clone(),
            listener,
            dispatcher.shutdown_tx.subscribe(),
        ));
        tokio::spawn(Self::event_loop(
            dispatcher.clone(),
            events_rx,
            dispatcher.shutdown_tx.subscribe(),
        ));
        tokio::spawn(Self::cleanup_loop(
            dispatcher.clone(),
            dispatcher.shutdown_tx.subscribe(),
        ));

        if config.network.discovery_port != 0 {
            crate::discovery::spawn(
                dispatcher.config.clone(),
                dispatcher.node_id,
                dispatcher.listen_addr.port(),
                dispatcher.peers.clone(),
                dispatcher.index.clone(),
                dispatcher.observer.clone(),
                dispatcher.shutdown_tx.subscribe(),
            )?;
        }

        Ok(dispatcher)
    }

    // ── Public operations ────────────────────────────────────────────────────

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Open a session to a peer. A no-op if one already exists.
    pub async fn connect(&self, node: NodeId, address: PeerAddress) -> Result<(), DispatchError> {
        if self.sessions.contains_key(&node) {
            return Ok(());
        }

        self.peers
            .entry(node)
            .or_insert_with(|| PeerRecord::new(node, address.clone()))
            .state = PeerState::Connecting;
        if let Some(mut record) = self.peers.get_mut(&node) {
            record.attempts += 1;
            record.address = address.clone();
        }

        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| {
                if let Some(mut record) = self.peers.get_mut(&node) {
                    record.mark_disconnected(PeerState::Failed);
                }
                DispatchError::Io(e)
            })?;

        let handle = session::spawn_initiator(self.session_context(), node, stream);
        self.sessions.insert(node, handle);
        Ok(())
    }

    /// Tear down the session to a peer.
    pub fn disconnect(&self, node: &NodeId) -> Result<(), DispatchError> {
        match self.sessions.remove(node) {
            Some((_, handle)) => {
                handle.close("disconnect requested");
                Ok(())
            }
            None => Err(DispatchError::NotConnected(*node)),
        }
    }

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Peers known to offer a file, restricted to authenticated ones.
    pub fn query_availability(&self, file: &FileId) -> Vec<NodeId> {
        self.index
            .peers_with(file, |n| peer::is_authenticated(&self.peers, n))
    }

    /// Broadcast a locally stored file's manifest to peers chosen by the
    /// broadcast policy. Returns how many peers were told.
    pub fn advertise_file(&self, file: &FileId) -> Result<usize, DispatchError> {
        let manifest = self
            .store
            .load_manifest(file)
            .map_err(|e| DispatchError::Storage(e.to_string()))?
            .ok_or(DispatchError::UnknownFile(*file))?;

        let mut told = 0;
        for node in self.policy.targets(&self.peers) {
            let Some(session) = self.sessions.get(&node) else {
                continue;
            };
            match session.try_send(Message::FileMetadata(manifest.clone()), "") {
                Ok(()) => told += 1,
                Err(e) => {
                    tracing::debug!(%node, error = %e, "availability broadcast skipped");
                }
            }
        }
        Ok(told)
    }

    /// Begin sending a locally imported file to a peer. Returns the
    /// transfer id.
    pub fn start_send(&self, file: FileId, peer_node: NodeId) -> Result<String, DispatchError> {
        if !peer::is_authenticated(&self.peers, &peer_node) {
            return Err(DispatchError::NotAuthenticated(peer_node));
        }
        let session = self
            .sessions
            .get(&peer_node)
            .ok_or(DispatchError::NotConnected(peer_node))?
            .value()
            .clone();

        let manifest = self
            .store
            .load_manifest(&file)
            .map_err(|e| DispatchError::Storage(e.to_string()))?
            .ok_or(DispatchError::UnknownFile(file))?;

        let key = TransferKey::new(file, peer_node, Direction::Send);
        if self.transfers.contains_key(&key) {
            return Err(DispatchError::DuplicateTransfer);
        }

        let handle = sender::spawn(self.engine_context(session), key, manifest);
        self.transfers.insert(key, handle);
        Ok(key.to_string())
    }

    /// Rotate the session key with a peer. Both sides re-derive from fresh
    /// ephemerals without leaving the authenticated state.
    pub fn rotate_key(&self, node: &NodeId) -> Result<(), DispatchError> {
        match self.sessions.get(node) {
            Some(session) => session
                .rotate_key()
                .map_err(|_| DispatchError::NotConnected(*node)),
            None => Err(DispatchError::NotConnected(*node)),
        }
    }

    pub fn cancel_transfer(&self, id: &str) -> Result<(), DispatchError> {
        self.with_transfer(id, |t| t.cancel())
    }

    pub fn pause_transfer(&self, id: &str) -> Result<(), DispatchError> {
        self.with_transfer(id, |t| t.pause())
    }

    pub fn resume_transfer(&self, id: &str) -> Result<(), DispatchError> {
        self.with_transfer(id, |t| t.resume())
    }

    /// Stop everything: sessions say goodbye, loops wind down.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().close("node shutting down");
        }
        let _ = self.shutdown_tx.send(());
    }

    fn with_transfer(
        &self,
        id: &str,
        f: impl FnOnce(&TransferHandle),
    ) -> Result<(), DispatchError> {
        let key: TransferKey = id.parse().map_err(|_| DispatchError::BadTransferId)?;
        match self.transfers.get(&key) {
            Some(handle) => {
                f(&handle);
                Ok(())
            }
            None => Err(DispatchError::UnknownTransfer(id.to_string())),
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            config: self.config.clone(),
            keypair: self.keypair.clone(),
            local: self.node_id,
            peers: self.peers.clone(),
            events: self.events_tx.clone(),
            observer: self.observer.clone(),
        }
    }

    fn engine_context(&self, session: SessionHandle) -> EngineContext {
        EngineContext {
            config: self.config.clone(),
            store: self.store.clone(),
            observer: self.observer.clone(),
            events: self.events_tx.clone(),
            session,
        }
    }

    // ── Background loops ─────────────────────────────────────────────────────

    async fn accept_loop(
        this: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("accept loop shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "inbound connection");
                            session::spawn_responder(this.session_context(), stream);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn event_loop(
        this: Arc<Self>,
        mut events: mpsc::Receiver<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("event loop shutting down");
                    return;
                }
                event = events.recv() => {
                    match event {
                        None => return,
                        Some(event) => this.handle_event(event).await,
                    }
                }
            }
        }
    }

    async fn cleanup_loop(this: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let referenced: HashSet<FileId> =
                        this.transfers.iter().map(|e| e.key().file).collect();
                    let max_age = Duration::from_secs(this.config.storage.max_age_secs);
                    match this.store.cleanup_orphans(&referenced, max_age) {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, "orphaned chunk trees removed"),
                        Err(e) => this.observer.storage_error(&e.to_string()),
                    }
                }
            }
        }
    }

    // ── Event handling ───────────────────────────────────────────────────────

    async fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::SessionEstablished { node, handle } => {
                self.sessions.insert(node, handle);
            }

            NodeEvent::SessionClosed { node, reason } => {
                self.sessions.remove(&node);
                // transfers with this peer cannot make progress
                let affected: Vec<TransferKey> = self
                    .transfers
                    .iter()
                    .filter(|e| e.key().peer == node)
                    .map(|e| *e.key())
                    .collect();
                for key in affected {
                    if let Some(handle) = self.transfers.get(&key) {
                        handle.abort("peer unreachable");
                    }
                }
                // the record dies with the session; availability follows
                self.peers.remove(&node);
                self.index.remove_peer(&node);
                tracing::info!(%node, reason, "peer session reaped");
            }

            NodeEvent::TransferFinished { key } => {
                self.transfers.remove(&key);
            }

            NodeEvent::Inbound {
                from,
                message_id,
                correlation,
                message,
            } => {
                self.route_inbound(from, message_id, correlation, message)
                    .await;
            }
        }
    }

    /// Route one decoded, decrypted message from a session.
    async fn route_inbound(
        &self,
        from: NodeId,
        message_id: String,
        correlation: String,
        message: Message,
    ) {
        match message {
            // discovery messages can also arrive over a session
            Message::PeerAnnouncement(a) => {
                if let Some(mut record) = self.peers.get_mut(&from) {
                    record.touch();
                }
                self.observer.peer_discovered(from, &a.endpoint);
            }
            Message::PeerLeave(_) => {
                let _ = self.disconnect(&from);
            }
            Message::PeerDiscovery(_) | Message::PeerDiscoveryResponse(_) => {
                tracing::debug!(%from, "discovery probe over session ignored");
            }

            // bare FileMetadata is an availability advertisement
            Message::FileMetadata(manifest) if correlation.is_empty() => {
                let file = manifest.file_id;
                self.index.advertise(file, from);
                if let Some(mut record) = self.peers.get_mut(&from) {
                    record.advertised.insert(file);
                }
                self.observer.file_available(file, from);
            }

            Message::TransferRequest(request) => {
                self.handle_transfer_request(from, correlation, request)
                    .await;
            }

            Message::ChecksumRequest(request) => {
                self.answer_checksum_request(from, correlation, request.file_id);
            }
            Message::ChecksumResponse(_) | Message::ChunkChecksum(_) => {
                tracing::debug!(%from, "checksum report received");
            }

            // everything else in the transfer family routes by correlation
            msg @ (Message::TransferResponse(_)
            | Message::FileMetadata(_)
            | Message::FileChunk(_)
            | Message::ChunkAck(_)
            | Message::ChunkResendRequest(_)
            | Message::TransferProgress(_)
            | Message::TransferComplete(_)
            | Message::TransferCancel(_)
            | Message::Ack(_)
            | Message::Error(_)) => {
                self.route_to_transfer(from, message_id, correlation, msg);
            }

            other => {
                tracing::debug!(%from, message = other.message_type(), "unroutable message");
            }
        }
    }

    /// Find the engine a transfer-family message belongs to. The
    /// correlation carries the originator's transfer key; our local key is
    /// either that exact key (they echoed ours back) or its mirror image.
    fn route_to_transfer(
        &self,
        from: NodeId,
        message_id: String,
        correlation: String,
        message: Message,
    ) {
        let Ok(key) = correlation.parse::<TransferKey>() else {
            if let Message::Error(e) = &message {
                self.observer.protocol_error(Some(from), e.code, &e.message);
            } else {
                tracing::debug!(
                    %from,
                    message = message.message_type(),
                    "transfer message without usable correlation"
                );
            }
            return;
        };

        let mirrored = TransferKey::new(
            key.file,
            from,
            match key.direction {
                Direction::Send => Direction::Receive,
                Direction::Receive => Direction::Send,
            },
        );

        let handle = self
            .transfers
            .get(&key)
            .or_else(|| self.transfers.get(&mirrored));
        match handle {
            Some(handle) => {
                if !handle.deliver(message, message_id) {
                    tracing::warn!(transfer = %handle.key, "engine inbox full, message dropped");
                }
            }
            None => {
                tracing::debug!(
                    %from,
                    correlation,
                    message = message.message_type(),
                    "no engine for transfer message"
                );
            }
        }
    }

    /// Inbound TransferRequest: validate limits, then either spawn a
    /// receive engine (which answers accept) or refuse in place.
    async fn handle_transfer_request(
        &self,
        from: NodeId,
        correlation: String,
        request: TransferRequest,
    ) {
        let Some(session) = self.sessions.get(&from).map(|s| s.value().clone()) else {
            return;
        };

        let reject = |reason: &str| {
            Message::TransferResponse(TransferResponse {
                file_id: request.file_id,
                accept: false,
                reason: Some(reason.to_string()),
            })
        };

        if request.manifest.file_size > self.config.transfer.max_file_size {
            let _ = session.try_send(reject("SizeExceeded"), correlation);
            return;
        }

        let key = TransferKey::new(request.file_id, from, Direction::Receive);
        if self.transfers.contains_key(&key) {
            let _ = session.try_send(reject("transfer already active"), correlation);
            return;
        }

        tracing::info!(
            %from,
            file = %request.file_id,
            bytes = request.manifest.file_size,
            chunks = request.manifest.chunk_count,
            "accepting inbound transfer"
        );
        let handle = receiver::spawn(
            self.engine_context(session),
            key,
            request.manifest,
            correlation,
        );
        self.transfers.insert(key, handle);
    }

    fn answer_checksum_request(&self, from: NodeId, correlation: String, file: FileId) {
        let Some(session) = self.sessions.get(&from) else {
            return;
        };
        let reply = match self.store.load_manifest(&file) {
            Ok(Some(manifest)) => Message::ChecksumResponse(ChecksumResponse {
                file_id: file,
                checksum: manifest.checksum,
                checksum_algorithm: manifest.checksum_algorithm,
            }),
            Ok(None) => Message::Error(WireError::new(ErrorCode::NotFound, "file not known")),
            Err(e) => Message::Error(WireError::new(ErrorCode::StorageIo, e.to_string())),
        };
        let _ = session.try_send(reply, correlation);
    }
}

// ── Identity helpers ──────────────────────────────────────────────────────────

/// A node's identity is its static keypair; the node id is derived from
/// the public key so it is stable across restarts.
fn node_id_for(keypair: &Keypair) -> NodeId {
    let hash = blake3::hash(&keypair.public);
    let mut id = [0u8; 16];
    id.copy_from_slice(&hash.as_bytes()[..16]);
    NodeId(id)
}

fn load_or_create_keypair(path: &Path) -> anyhow::Result<Keypair> {
    if path.exists() {
        let bytes = std::fs::read(path).context("reading keypair")?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("keypair file is not 32 bytes"))?;
        return Ok(Keypair::from_private(bytes));
    }

    let keypair = Keypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("creating keypair dir")?;
    }
    std::fs::write(path, *keypair.private_bytes()).context("writing keypair")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(keypair)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("peer {0} is not connected")]
    NotConnected(NodeId),

    #[error("peer {0} is not authenticated")]
    NotAuthenticated(NodeId),

    #[error("no manifest stored for file {0}")]
    UnknownFile(FileId),

    #[error("transfer {0} not found")]
    UnknownTransfer(String),

    #[error("transfer id is malformed")]
    BadTransferId,

    #[error("a transfer for this file and peer is already active")]
    DuplicateTransfer,

    #[error("storage: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_per_keypair() {
        let kp = Keypair::generate();
        let restored = Keypair::from_private(*kp.private_bytes());
        assert_eq!(node_id_for(&kp), node_id_for(&restored));
        assert_ne!(node_id_for(&kp), node_id_for(&Keypair::generate()));
    }

    #[test]
    fn flood_policy_targets_only_authenticated() {
        let peers = peer::new_registry();
        let mut a = PeerRecord::new(NodeId::generate(), PeerAddress::new("h", 1));
        a.mark_authenticated();
        let b = PeerRecord::new(NodeId::generate(), PeerAddress::new("h", 2));
        let a_id = a.node_id;
        peers.insert(a.node_id, a);
        peers.insert(b.node_id, b);

        let targets = FloodPolicy.targets(&peers);
        assert_eq!(targets, vec![a_id]);
    }

    #[tokio::test]
    async fn keypair_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("keypair");
        let first = load_or_create_keypair(&path).unwrap();
        let second = load_or_create_keypair(&path).unwrap();
        assert_eq!(first.public, second.public);
    }
}
