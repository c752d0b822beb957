//! Transfer engines — one actor per active file transfer.
//!
//! The sender drives a sliding window of chunks toward the peer; the
//! receiver verifies, stores, acknowledges, and finally assembles. Both
//! own their TransferDescriptor exclusively and communicate with the rest
//! of the node only through messages.

pub mod receiver;
pub mod sender;

use std::sync::Arc;

use tokio::sync::mpsc;

use portage_core::config::NodeConfig;
use portage_core::message::Message;
use portage_services::{ChunkStore, NodeObserver, TransferKey};

use crate::dispatch::NodeEvent;
use crate::session::SessionHandle;

/// Engine inbox depth. Deep enough for a full window of acks plus control
/// traffic; past this the dispatcher drops and the timeout machinery
/// recovers.
const ENGINE_INBOX: usize = 256;

pub enum TransferCommand {
    /// A routed wire message for this transfer, with its envelope id
    /// (needed to Ack a TransferComplete).
    Inbound { message: Message, message_id: String },
    Pause,
    Resume,
    /// User-requested cancel: notify the peer, then fail.
    Cancel,
    /// The session died: fail in place, nothing can be sent.
    Abort { reason: String },
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct TransferHandle {
    pub key: TransferKey,
    tx: mpsc::Sender<TransferCommand>,
}

impl TransferHandle {
    /// Route an inbound message to the engine. Returns false if the engine
    /// is gone or saturated (the sender's timeout machinery will retry).
    pub fn deliver(&self, message: Message, message_id: String) -> bool {
        self.tx
            .try_send(TransferCommand::Inbound {
                message,
                message_id,
            })
            .is_ok()
    }

    pub fn pause(&self) {
        let _ = self.tx.try_send(TransferCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.try_send(TransferCommand::Resume);
    }

    pub fn cancel(&self) {
        let _ = self.tx.try_send(TransferCommand::Cancel);
    }

    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.tx.try_send(TransferCommand::Abort {
            reason: reason.into(),
        });
    }
}

/// Everything an engine needs from its parent.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<NodeConfig>,
    pub store: Arc<ChunkStore>,
    pub observer: Arc<dyn NodeObserver>,
    pub events: mpsc::Sender<NodeEvent>,
    pub session: SessionHandle,
}

fn engine_channel() -> (
    mpsc::Sender<TransferCommand>,
    mpsc::Receiver<TransferCommand>,
) {
    mpsc::channel(ENGINE_INBOX)
}
