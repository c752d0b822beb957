//! Local-network discovery.
//!
//! Periodically multicasts a PeerAnnouncement envelope and ingests the
//! announcements of others into the peer registry. Peers answer
//! PeerDiscovery probes with a unicast PeerDiscoveryResponse, and say
//! goodbye with PeerLeave. Announcements only carry the session port — the
//! peer's host is taken from the datagram source address, which is the
//! only address we know can actually reach us.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use portage_core::config::NodeConfig;
use portage_core::envelope::{ticks_now, Envelope};
use portage_core::id::{new_message_id, NodeId, PeerAddress};
use portage_core::message::{
    Message, PeerAnnouncement, PeerDiscoveryResponse, PeerLeave, PeerSummary,
};
use portage_core::PROTOCOL_VERSION;
use portage_services::{AvailabilityIndex, NodeObserver, PeerRecord, PeerRegistry, PeerState};

/// Administratively-scoped IPv4 multicast group for announcements.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 80);

/// Start the announce and listen loops. A discovery port of 0 disables
/// discovery entirely (the dispatcher checks before calling).
pub fn spawn(
    config: Arc<NodeConfig>,
    node_id: NodeId,
    session_port: u16,
    peers: PeerRegistry,
    index: Arc<AvailabilityIndex>,
    observer: Arc<dyn NodeObserver>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let port = config.network.discovery_port;
    let group = SocketAddr::from((MULTICAST_GROUP, port));

    let announce_socket = make_announce_socket()?;
    let listen_socket = make_listen_socket(port)?;

    tokio::spawn(announce_loop(
        config.clone(),
        node_id,
        session_port,
        announce_socket,
        group,
        shutdown.resubscribe(),
    ));
    tokio::spawn(listen_loop(
        config,
        node_id,
        listen_socket,
        peers,
        index,
        observer,
        shutdown,
    ));
    Ok(())
}

/// Socket for sending multicast datagrams.
fn make_announce_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    // TTL 1 — stay on the local network
    socket.set_multicast_ttl_v4(1).context("IP_MULTICAST_TTL")?;
    socket
        .set_multicast_loop_v4(true)
        .context("IP_MULTICAST_LOOP")?;
    socket
        .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())
        .context("bind announce socket")?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into()).context("announce socket into tokio")
}

/// Socket bound to the discovery port, joined to the group.
fn make_listen_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket
        .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())
        .with_context(|| format!("bind discovery port {port}"))?;
    socket
        .join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into()).context("listen socket into tokio")
}

/// Multicast a fresh announcement every interval; say goodbye with a
/// PeerLeave when the node shuts down.
async fn announce_loop(
    config: Arc<NodeConfig>,
    node_id: NodeId,
    session_port: u16,
    socket: UdpSocket,
    group: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.network.announce_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        %group,
        interval_secs = config.network.announce_interval_secs,
        "discovery announce starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let leave = Message::PeerLeave(PeerLeave {
                    reason: "shutdown".to_string(),
                    grace_period_seconds: 5,
                    leave_id: new_message_id(),
                    time_to_live: 1,
                });
                if let Ok(envelope) = leave.into_envelope(&node_id, None, "") {
                    if let Ok(bytes) = envelope.encode() {
                        let _ = socket.send_to(&bytes, group).await;
                    }
                }
                tracing::info!("discovery announce shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("protocolVersion".to_string(), PROTOCOL_VERSION.to_string());
        let announcement = Message::PeerAnnouncement(PeerAnnouncement {
            // receivers take the host from the datagram source address
            endpoint: format!("0.0.0.0:{session_port}"),
            metadata,
            announcement_id: new_message_id(),
            time_to_live: 1,
        });

        let envelope = match announcement.into_envelope(&node_id, None, "") {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "announcement build failed");
                continue;
            }
        };
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "announcement encode failed");
                continue;
            }
        };
        match socket.send_to(&bytes, group).await {
            Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
            Err(e) => tracing::warn!(error = %e, "announcement send failed"),
        }
    }
}

/// Ingest discovery datagrams and expire silent peers.
async fn listen_loop(
    config: Arc<NodeConfig>,
    node_id: NodeId,
    socket: UdpSocket,
    peers: PeerRegistry,
    index: Arc<AvailabilityIndex>,
    observer: Arc<dyn NodeObserver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let ttl = Duration::from_secs(config.network.peer_ttl_secs);
    let mut prune = tokio::time::interval(ttl / 2);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("discovery listener shutting down");
                return;
            }

            _ = prune.tick() => {
                // only discovery-state peers age out here; live sessions
                // have their own heartbeat timeout
                let expired: Vec<NodeId> = peers
                    .iter()
                    .filter(|e| {
                        e.value().state == PeerState::Discovered
                            && e.value().last_seen.elapsed() > ttl
                    })
                    .map(|e| *e.key())
                    .collect();
                for node in expired {
                    peers.remove(&node);
                    index.remove_peer(&node);
                    tracing::debug!(%node, "discovered peer expired");
                }
            }

            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery recv failed");
                        continue;
                    }
                };
                // peek is enough to drop our own and irrelevant datagrams
                // without a payload decode
                let Ok(head) = Envelope::peek(&buf[..len]) else {
                    continue;
                };
                if head.source == node_id.to_hex() {
                    continue;
                }
                let Ok(envelope) = Envelope::decode(&buf[..len]) else {
                    continue;
                };
                let Ok(message) = Message::from_envelope(&envelope) else {
                    continue;
                };
                handle_datagram(
                    &node_id, &socket, &peers, &index, &observer, src, envelope, message,
                )
                .await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    node_id: &NodeId,
    socket: &UdpSocket,
    peers: &PeerRegistry,
    index: &Arc<AvailabilityIndex>,
    observer: &Arc<dyn NodeObserver>,
    src: SocketAddr,
    envelope: Envelope,
    message: Message,
) {
    match message {
        Message::PeerAnnouncement(announcement) => {
            let Ok(node) = envelope.source.parse::<NodeId>() else {
                return;
            };
            let port = PeerAddress::parse(&announcement.endpoint)
                .map(|a| a.port)
                .unwrap_or(0);
            let address = PeerAddress::new(src.ip().to_string(), port);

            let mut newly = false;
            peers
                .entry(node)
                .and_modify(|record| {
                    record.touch();
                    if record.state == PeerState::Discovered {
                        record.address = address.clone();
                    }
                })
                .or_insert_with(|| {
                    newly = true;
                    PeerRecord::new(node, address.clone())
                });
            if newly {
                tracing::info!(%node, %address, "peer discovered");
                observer.peer_discovered(node, &address.to_string());
            }
        }

        Message::PeerDiscovery(probe) => {
            let summaries: Vec<PeerSummary> = peers
                .iter()
                .map(|e| {
                    let record = e.value();
                    PeerSummary {
                        peer_id: record.node_id,
                        endpoint: record.address.to_string(),
                        protocol_version: record.protocol_version.clone(),
                        last_seen: ticks_now(),
                        metadata: BTreeMap::new(),
                    }
                })
                .collect();
            let response = Message::PeerDiscoveryResponse(PeerDiscoveryResponse {
                peers: summaries,
                response_id: new_message_id(),
                is_success: true,
                error_code: None,
                error_message: None,
            });
            let Ok(reply) = response.into_envelope(node_id, None, &probe.discovery_id) else {
                return;
            };
            if let Ok(bytes) = reply.encode() {
                if let Err(e) = socket.send_to(&bytes, src).await {
                    tracing::debug!(error = %e, "discovery response send failed");
                }
            }
        }

        Message::PeerDiscoveryResponse(response) => {
            for summary in response.peers {
                if summary.peer_id == *node_id {
                    continue;
                }
                if let Ok(address) = PeerAddress::parse(&summary.endpoint) {
                    peers
                        .entry(summary.peer_id)
                        .or_insert_with(|| PeerRecord::new(summary.peer_id, address));
                }
            }
        }

        Message::PeerLeave(leave) => {
            let Ok(node) = envelope.source.parse::<NodeId>() else {
                return;
            };
            // a live session notices the TCP close on its own; this only
            // retires peers we never connected to
            if let Some(record) = peers.get(&node) {
                if record.state != PeerState::Discovered {
                    return;
                }
            }
            peers.remove(&node);
            index.remove_peer(&node);
            tracing::debug!(%node, reason = %leave.reason, "peer left");
        }

        other => {
            tracing::trace!(message = other.message_type(), "non-discovery datagram ignored");
        }
    }
}
