//! Receiving side of a transfer.
//!
//! Verify every chunk against its own checksum before it touches the
//! store, acknowledge what lands, chase gaps with resend requests, and
//! assemble + verify the whole file when the sender says it is done.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use portage_core::checksum::digest;
use portage_core::error::{ErrorCode, WireError};
use portage_core::id::ChunkId;
use portage_core::manifest::FileManifest;
use portage_core::message::{
    Ack, ChunkAck, ChunkResendRequest, FileChunk, Message, TransferCancel, TransferComplete,
    TransferResponse,
};
use portage_services::{StoreError, TransferDescriptor, TransferKey, TransferStatus};

use super::{engine_channel, EngineContext, TransferCommand, TransferHandle};
use crate::dispatch::NodeEvent;
use crate::session::SessionError;

/// Spawn a receive engine for an accepted TransferRequest. `correlation`
/// is echoed on every reply so the sender's dispatcher can route them.
pub fn spawn(
    ctx: EngineContext,
    key: TransferKey,
    manifest: FileManifest,
    correlation: String,
) -> TransferHandle {
    let (tx, rx) = engine_channel();
    let handle = TransferHandle { key, tx };
    let engine = ReceiveEngine {
        descriptor: TransferDescriptor::new(key, manifest),
        correlation,
        highest_seen: 0,
        resend_requested: HashMap::new(),
        pending_complete: None,
        last_report: Instant::now(),
        ctx,
        cmd_rx: rx,
    };
    tokio::spawn(engine.run());
    handle
}

struct ReceiveEngine {
    ctx: EngineContext,
    cmd_rx: mpsc::Receiver<TransferCommand>,
    descriptor: TransferDescriptor,
    correlation: String,
    /// Highest sequence seen on the wire, for gap detection.
    highest_seen: u64,
    /// Sequences we have asked to be resent, and when.
    resend_requested: HashMap<u64, Instant>,
    /// Set when TransferComplete arrives before every chunk has landed:
    /// (declared checksum, envelope id to Ack).
    pending_complete: Option<(Vec<u8>, String)>,
    last_report: Instant,
}

impl ReceiveEngine {
    async fn run(mut self) {
        self.ctx.observer.transfer_started(&self.descriptor.key);

        let outcome = self.run_inner().await;
        match outcome {
            Ok(()) => {
                self.descriptor.status = TransferStatus::Completed;
                self.ctx.observer.transfer_completed(&self.descriptor.key);
            }
            Err(reason) => {
                self.descriptor.fail(reason.clone());
                self.ctx
                    .observer
                    .transfer_failed(&self.descriptor.key, &reason);
            }
        }

        let _ = self
            .ctx
            .events
            .send(NodeEvent::TransferFinished {
                key: self.descriptor.key,
            })
            .await;
    }

    async fn run_inner(&mut self) -> Result<(), String> {
        // keep the manifest on disk so assembly and orphan accounting can
        // see it even if this node restarts mid-receive
        self.ctx
            .store
            .save_manifest(&self.descriptor.manifest)
            .map_err(|e| format!("chunk store: {e}"))?;

        self.send(Message::TransferResponse(TransferResponse {
            file_id: self.descriptor.key.file,
            accept: true,
            reason: None,
        }))
        .await?;
        self.descriptor.status = TransferStatus::InProgress;

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Err("engine handle dropped".into());
                    };
                    if let Some(done) = self.handle_command(cmd).await? {
                        return done;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(done) = self.tick().await? {
                        return done;
                    }
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: TransferCommand,
    ) -> Result<Option<Result<(), String>>, String> {
        match cmd {
            TransferCommand::Inbound {
                message,
                message_id,
            } => self.handle_message(message, message_id).await,
            TransferCommand::Pause => {
                if self.descriptor.status == TransferStatus::InProgress {
                    self.descriptor.status = TransferStatus::Paused;
                }
                Ok(None)
            }
            TransferCommand::Resume => {
                if self.descriptor.status == TransferStatus::Paused {
                    self.descriptor.status = TransferStatus::InProgress;
                }
                Ok(None)
            }
            TransferCommand::Cancel => {
                let _ = self
                    .send(Message::TransferCancel(TransferCancel {
                        file_id: self.descriptor.key.file,
                        reason: "cancelled".into(),
                    }))
                    .await;
                self.discard_partial();
                Ok(Some(Err("cancelled".into())))
            }
            // Session gone. Received chunks stay on disk — orphan cleanup
            // reclaims them if no retry ever comes.
            TransferCommand::Abort { reason } => Ok(Some(Err(reason))),
        }
    }

    async fn handle_message(
        &mut self,
        message: Message,
        message_id: String,
    ) -> Result<Option<Result<(), String>>, String> {
        match message {
            Message::FileChunk(chunk) => self.handle_chunk(chunk).await,

            Message::TransferComplete(TransferComplete { file_checksum, .. }) => {
                self.pending_complete = Some((file_checksum, message_id));
                if self.descriptor.all_acked() {
                    self.try_complete().await
                } else {
                    self.request_missing().await?;
                    Ok(None)
                }
            }

            Message::TransferCancel(c) => {
                self.discard_partial();
                Ok(Some(Err(format!("cancelled: {}", c.reason))))
            }

            Message::Error(e) => Ok(Some(Err(format!("peer error {}: {}", e.code, e.message)))),

            other => {
                tracing::debug!(
                    transfer = %self.descriptor.key,
                    message = other.message_type(),
                    "ignoring unexpected message"
                );
                Ok(None)
            }
        }
    }

    async fn handle_chunk(
        &mut self,
        chunk: FileChunk,
    ) -> Result<Option<Result<(), String>>, String> {
        let sequence = chunk.sequence;
        if sequence >= self.descriptor.manifest.chunk_count {
            tracing::warn!(
                transfer = %self.descriptor.key,
                sequence,
                "chunk sequence beyond manifest, discarding"
            );
            return Ok(None);
        }

        // duplicate delivery — the ack must have been lost, repeat it
        if self.descriptor.acked.contains(sequence) {
            self.send(Message::ChunkAck(ChunkAck {
                file_id: self.descriptor.key.file,
                sequence,
            }))
            .await?;
            return Ok(None);
        }

        let algo = self.descriptor.manifest.checksum_algorithm;
        if digest(algo, &chunk.bytes) != chunk.chunk_checksum {
            tracing::warn!(
                transfer = %self.descriptor.key,
                sequence,
                "chunk failed checksum, requesting resend"
            );
            self.resend_requested.insert(sequence, Instant::now());
            self.send(Message::ChunkResendRequest(ChunkResendRequest {
                file_id: self.descriptor.key.file,
                sequence,
            }))
            .await?;
            return Ok(None);
        }

        let id = ChunkId::new(self.descriptor.key.file, sequence, chunk.chunk_checksum);
        if let Err(e) = self.ctx.store.put(&id, algo, &chunk.bytes) {
            let (code, fatal) = match &e {
                StoreError::Integrity(_) => (ErrorCode::IntegrityError, true),
                _ => (ErrorCode::StorageIo, true),
            };
            let _ = self
                .send(Message::Error(WireError::new(code, e.to_string())))
                .await;
            self.ctx.observer.storage_error(&e.to_string());
            if fatal {
                return Ok(Some(Err(format!("storage failure: {e}"))));
            }
            return Ok(None);
        }

        self.descriptor.mark_acked(sequence);
        self.resend_requested.remove(&sequence);
        self.highest_seen = self.highest_seen.max(sequence);

        self.send(Message::ChunkAck(ChunkAck {
            file_id: self.descriptor.key.file,
            sequence,
        }))
        .await?;

        // a sequence far ahead of the cursor means something in between
        // went missing on the wire
        let window = self.ctx.config.transfer.max_concurrent_chunks as u64;
        if self.highest_seen > self.descriptor.cursor.saturating_add(window) {
            self.request_missing_below(self.highest_seen).await?;
        }

        if self.pending_complete.is_some() && self.descriptor.all_acked() {
            return self.try_complete().await;
        }
        Ok(None)
    }

    /// Ask for every still-missing sequence below `limit`, skipping ones
    /// asked for recently.
    async fn request_missing_below(&mut self, limit: u64) -> Result<(), String> {
        let recent = Duration::from_secs(self.ctx.config.transfer.chunk_timeout_secs);
        let missing: Vec<u64> = (0..limit)
            .filter(|s| !self.descriptor.acked.contains(*s))
            .filter(|s| {
                self.resend_requested
                    .get(s)
                    .map(|at| at.elapsed() >= recent)
                    .unwrap_or(true)
            })
            .collect();
        for sequence in missing {
            self.resend_requested.insert(sequence, Instant::now());
            self.send(Message::ChunkResendRequest(ChunkResendRequest {
                file_id: self.descriptor.key.file,
                sequence,
            }))
            .await?;
        }
        Ok(())
    }

    async fn request_missing(&mut self) -> Result<(), String> {
        self.request_missing_below(self.descriptor.manifest.chunk_count)
            .await
    }

    /// All chunks stored and the sender has declared completion: check the
    /// declared checksum, assemble, verify, and Ack.
    async fn try_complete(&mut self) -> Result<Option<Result<(), String>>, String> {
        let Some((declared, complete_id)) = self.pending_complete.clone() else {
            return Ok(None);
        };

        if declared != self.descriptor.manifest.checksum {
            let _ = self
                .send(Message::Error(WireError::new(
                    ErrorCode::IntegrityError,
                    "declared file checksum disagrees with manifest",
                )))
                .await;
            return Ok(Some(Err("file checksum mismatch".into())));
        }

        let target = self.ctx.store.assembled_path(&self.descriptor.manifest);
        match self.ctx.store.assemble(&self.descriptor.manifest, &target) {
            Ok(()) => {
                self.send(Message::Ack(Ack {
                    ack_of: complete_id,
                }))
                .await?;
                Ok(Some(Ok(())))
            }
            Err(StoreError::MissingChunk(sequence)) => {
                // raced with a late resend — ask again and keep waiting
                self.resend_requested.insert(sequence, Instant::now());
                self.send(Message::ChunkResendRequest(ChunkResendRequest {
                    file_id: self.descriptor.key.file,
                    sequence,
                }))
                .await?;
                Ok(None)
            }
            Err(e @ StoreError::Integrity(_)) => {
                let _ = self
                    .send(Message::Error(WireError::new(
                        ErrorCode::IntegrityError,
                        e.to_string(),
                    )))
                    .await;
                Ok(Some(Err(format!("assembly failed verification: {e}"))))
            }
            Err(e) => {
                self.ctx.observer.storage_error(&e.to_string());
                let _ = self
                    .send(Message::Error(WireError::new(
                        ErrorCode::StorageIo,
                        e.to_string(),
                    )))
                    .await;
                Ok(Some(Err(format!("assembly failed: {e}"))))
            }
        }
    }

    async fn tick(&mut self) -> Result<Option<Result<(), String>>, String> {
        let cfg = &self.ctx.config.transfer;

        if self.descriptor.started_at.elapsed() >= Duration::from_secs(cfg.transfer_timeout_secs) {
            return Ok(Some(Err("transfer timed out".into())));
        }

        if self.descriptor.status == TransferStatus::InProgress {
            // stalled while waiting for the tail of the file — nudge the
            // sender, bounded by the per-sequence retry budget
            let stalled = self.descriptor.last_progress.elapsed()
                >= Duration::from_secs(cfg.chunk_timeout_secs);
            if stalled && (self.pending_complete.is_some() || self.descriptor.acked.count() > 0) {
                let missing: Vec<u64> = self.descriptor.acked.missing().collect();
                for sequence in missing {
                    match self.descriptor.bump_retry(sequence, cfg.max_retries) {
                        Err(_) => {
                            return Ok(Some(Err(format!(
                                "sequence {sequence} exceeded retry limit"
                            ))))
                        }
                        Ok(_) => {
                            self.resend_requested.insert(sequence, Instant::now());
                            self.send(Message::ChunkResendRequest(ChunkResendRequest {
                                file_id: self.descriptor.key.file,
                                sequence,
                            }))
                            .await?;
                        }
                    }
                }
                self.descriptor.last_progress = Instant::now();
            }

            if self.last_report.elapsed() >= Duration::from_secs(cfg.progress_interval_secs) {
                self.last_report = Instant::now();
                self.ctx.observer.transfer_progress(
                    &self.descriptor.key,
                    self.descriptor.bytes_acked(),
                    self.descriptor.manifest.file_size,
                );
            }
        }

        Ok(None)
    }

    /// Remove everything received so far (cancel paths only).
    fn discard_partial(&self) {
        if let Err(e) = self
            .ctx
            .store
            .delete_file_chunks(&self.descriptor.key.file)
        {
            self.ctx.observer.storage_error(&e.to_string());
        }
    }

    async fn send(&self, message: Message) -> Result<(), String> {
        match self.ctx.session.send(message, self.correlation.clone()).await {
            Ok(()) => Ok(()),
            Err(SessionError::Gone) => Err("peer unreachable".into()),
            Err(e) => Err(e.to_string()),
        }
    }
}
