//! Sending side of a transfer.
//!
//! Request → metadata → windowed chunks → completion. Chunks are read back
//! from the store at send time, so resends never depend on anything held
//! in memory.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use portage_core::id::ChunkId;
use portage_core::manifest::FileManifest;
use portage_core::message::{
    ChunkAck, ChunkResendRequest, FileChunk, Message, TransferCancel, TransferComplete,
    TransferRequest, TransferResponse,
};
use portage_services::{TransferDescriptor, TransferKey, TransferStatus};

use super::{engine_channel, EngineContext, TransferCommand, TransferHandle};
use crate::dispatch::NodeEvent;
use crate::session::SessionError;

/// Spawn a send engine. The manifest must already be imported into the
/// chunk store.
pub fn spawn(ctx: EngineContext, key: TransferKey, manifest: FileManifest) -> TransferHandle {
    let (tx, rx) = engine_channel();
    let handle = TransferHandle { key, tx };
    let engine = SendEngine {
        correlation: key.to_string(),
        descriptor: TransferDescriptor::new(key, manifest),
        chunk_ids: Vec::new(),
        awaiting_final_ack: false,
        request_deadline: Instant::now()
            + Duration::from_secs(ctx.config.transfer.request_timeout_secs),
        last_report: Instant::now(),
        ctx,
        cmd_rx: rx,
    };
    tokio::spawn(engine.run());
    handle
}

struct SendEngine {
    ctx: EngineContext,
    cmd_rx: mpsc::Receiver<TransferCommand>,
    descriptor: TransferDescriptor,
    /// Chunk ids by sequence, loaded from the store at startup.
    chunk_ids: Vec<ChunkId>,
    correlation: String,
    awaiting_final_ack: bool,
    request_deadline: Instant,
    last_report: Instant,
}

impl SendEngine {
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
        // Every chunk must already be present locally.
        self.chunk_ids = self
            .ctx
            .store
            .list_for_file(&self.descriptor.key.file)
            .map_err(|e| format!("chunk store: {e}"))?;
        if self.chunk_ids.len() as u64 != self.descriptor.manifest.chunk_count {
            return Err(format!(
                "file has {} chunks in store, manifest says {}",
                self.chunk_ids.len(),
                self.descriptor.manifest.chunk_count
            ));
        }

        self.send(Message::TransferRequest(TransferRequest {
            file_id: self.descriptor.key.file,
            manifest: self.descriptor.manifest.clone(),
        }))
        .await?;

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

    /// `Ok(Some(result))` ends the engine with that result.
    async fn handle_command(
        &mut self,
        cmd: TransferCommand,
    ) -> Result<Option<Result<(), String>>, String> {
        match cmd {
            TransferCommand::Inbound { message, .. } => self.handle_message(message).await,
            TransferCommand::Pause => {
                if self.descriptor.status == TransferStatus::InProgress {
                    self.descriptor.status = TransferStatus::Paused;
                    tracing::info!(transfer = %self.descriptor.key, "transfer paused");
                }
                Ok(None)
            }
            TransferCommand::Resume => {
                if self.descriptor.status == TransferStatus::Paused {
                    self.descriptor.status = TransferStatus::InProgress;
                    tracing::info!(transfer = %self.descriptor.key, "transfer resumed");
                    // re-send the outstanding window, then refill
                    let outstanding: Vec<u64> =
                        self.descriptor.outstanding.keys().copied().collect();
                    for sequence in outstanding {
                        self.send_chunk(sequence).await?;
                    }
                    self.fill_window().await?;
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
                Ok(Some(Err("cancelled".into())))
            }
            TransferCommand::Abort { reason } => Ok(Some(Err(reason))),
        }
    }

    async fn handle_message(
        &mut self,
        message: Message,
    ) -> Result<Option<Result<(), String>>, String> {
        match message {
            Message::TransferResponse(TransferResponse { accept, reason, .. }) => {
                if self.descriptor.status != TransferStatus::Pending {
                    return Ok(None);
                }
                if !accept {
                    return Ok(Some(Err(format!(
                        "rejected by peer: {}",
                        reason.unwrap_or_else(|| "no reason given".into())
                    ))));
                }
                self.descriptor.status = TransferStatus::InProgress;
                self.send(Message::FileMetadata(self.descriptor.manifest.clone()))
                    .await?;
                // an empty file has nothing to window — complete right away
                if self.descriptor.all_acked() {
                    self.awaiting_final_ack = true;
                    self.send(Message::TransferComplete(TransferComplete {
                        file_id: self.descriptor.key.file,
                        file_checksum: self.descriptor.manifest.checksum.clone(),
                    }))
                    .await?;
                } else {
                    self.fill_window().await?;
                }
                Ok(None)
            }

            Message::ChunkAck(ChunkAck { sequence, .. }) => {
                if sequence >= self.descriptor.manifest.chunk_count {
                    return Ok(None);
                }
                self.descriptor.mark_acked(sequence);
                if self.descriptor.all_acked() && !self.awaiting_final_ack {
                    self.awaiting_final_ack = true;
                    self.send(Message::TransferComplete(TransferComplete {
                        file_id: self.descriptor.key.file,
                        file_checksum: self.descriptor.manifest.checksum.clone(),
                    }))
                    .await?;
                } else if self.descriptor.status == TransferStatus::InProgress {
                    self.fill_window().await?;
                }
                Ok(None)
            }

            Message::ChunkResendRequest(ChunkResendRequest { sequence, .. }) => {
                if sequence >= self.descriptor.manifest.chunk_count {
                    return Ok(None);
                }
                match self.resend(sequence).await? {
                    true => Ok(None),
                    false => Ok(Some(Err(format!(
                        "sequence {sequence} exceeded retry limit"
                    )))),
                }
            }

            Message::Ack(_) => {
                if self.awaiting_final_ack {
                    Ok(Some(Ok(())))
                } else {
                    Ok(None)
                }
            }

            Message::Error(e) => Ok(Some(Err(format!("peer error {}: {}", e.code, e.message)))),

            Message::TransferCancel(c) => {
                Ok(Some(Err(format!("cancelled by peer: {}", c.reason))))
            }

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

    async fn tick(&mut self) -> Result<Option<Result<(), String>>, String> {
        let transfer_timeout_secs = self.ctx.config.transfer.transfer_timeout_secs;
        let chunk_timeout_secs = self.ctx.config.transfer.chunk_timeout_secs;
        let progress_interval_secs = self.ctx.config.transfer.progress_interval_secs;

        if self.descriptor.status == TransferStatus::Pending
            && Instant::now() >= self.request_deadline
        {
            return Ok(Some(Err("transfer request timed out".into())));
        }

        if self.descriptor.started_at.elapsed() >= Duration::from_secs(transfer_timeout_secs) {
            let _ = self
                .send(Message::TransferCancel(TransferCancel {
                    file_id: self.descriptor.key.file,
                    reason: "transfer timed out".into(),
                }))
                .await;
            return Ok(Some(Err("transfer timed out".into())));
        }

        if self.descriptor.status == TransferStatus::InProgress {
            // chunks unacknowledged past the per-chunk timeout go again
            let timeout = Duration::from_secs(chunk_timeout_secs);
            let stale: Vec<u64> = self
                .descriptor
                .outstanding
                .iter()
                .filter(|(_, sent)| sent.elapsed() >= timeout)
                .map(|(seq, _)| *seq)
                .collect();
            for sequence in stale {
                if !self.resend(sequence).await? {
                    return Ok(Some(Err(format!(
                        "sequence {sequence} exceeded retry limit"
                    ))));
                }
            }

            if self.last_report.elapsed() >= Duration::from_secs(progress_interval_secs) {
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

    /// Keep up to `max_concurrent_chunks` sequences in flight.
    async fn fill_window(&mut self) -> Result<(), String> {
        let window = self.ctx.config.transfer.max_concurrent_chunks;
        while self.descriptor.outstanding.len() < window {
            let mut sequence = self.descriptor.cursor;
            while sequence < self.descriptor.manifest.chunk_count
                && (self.descriptor.acked.contains(sequence)
                    || self.descriptor.outstanding.contains_key(&sequence))
            {
                sequence += 1;
            }
            if sequence >= self.descriptor.manifest.chunk_count {
                break;
            }
            self.send_chunk(sequence).await?;
        }
        Ok(())
    }

    /// Re-send one sequence, bumping its retry counter. `false` once the
    /// retry limit is exhausted.
    async fn resend(&mut self, sequence: u64) -> Result<bool, String> {
        let max = self.ctx.config.transfer.max_retries;
        match self.descriptor.bump_retry(sequence, max) {
            Err(count) => {
                tracing::warn!(
                    transfer = %self.descriptor.key,
                    sequence,
                    attempts = count,
                    "retry limit exceeded"
                );
                Ok(false)
            }
            Ok(attempt) => {
                tracing::debug!(transfer = %self.descriptor.key, sequence, attempt, "resending chunk");
                self.send_chunk(sequence).await?;
                Ok(true)
            }
        }
    }

    async fn send_chunk(&mut self, sequence: u64) -> Result<(), String> {
        let id = &self.chunk_ids[sequence as usize];
        let bytes = self
            .ctx
            .store
            .get(id)
            .map_err(|e| format!("chunk store: {e}"))?
            .ok_or_else(|| format!("chunk {sequence} vanished from store"))?;

        self.send(Message::FileChunk(FileChunk {
            file_id: self.descriptor.key.file,
            sequence,
            bytes,
            chunk_checksum: id.content_hash.clone(),
        }))
        .await?;
        self.descriptor.outstanding.insert(sequence, Instant::now());
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), String> {
        match self.ctx.session.send(message, self.correlation.clone()).await {
            Ok(()) => Ok(()),
            Err(SessionError::Gone) => Err("peer unreachable".into()),
            Err(e) => Err(e.to_string()),
        }
    }
}
