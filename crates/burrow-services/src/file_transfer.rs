//! File transfer — header negotiation, chunk streaming, and reassembly.
//!
//! Both halves of the protocol live here. The sender announces a file with a
//! FileHeader, waits for the receiver to accept it, then streams
//! FILE_CHUNK_SIZE chunks with at most one unacknowledged chunk in flight. The
//! receiver stages each verified chunk in its own file and concatenates them
//! once every chunk has arrived.
//!
//! Transfer state is keyed by file id and outlives any single channel, so a
//! transfer interrupted by a lost connection resumes where it stopped.
//! Nothing here touches the connection: every operation returns a
//! [`TransferStep`] describing the packets to send and the events to report.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;

use burrow_core::config::TransferSettings;
use burrow_core::crypto::{self, Hasher};
use burrow_core::wire::{
    chunk_count_for, ChunkId, ContentHash, Direction, FileChunk, FileChunkAck, FileHeader,
    FileHeaderAck, FileId, FilePacket, HeaderRejectReason, FILE_CHUNK_SIZE,
};

use crate::peer::PeerId;

/// Finished incoming transfers remembered per peer.
const FINISHED_MEMORY: usize = 64;

/// Something the application should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The peer has every chunk of an outgoing file.
    Delivered { file_id: FileId },
    /// An outgoing transfer was refused or gave up.
    SendFailed { file_id: FileId, reason: String },
    /// An incoming file was reassembled and verified.
    Received {
        file_id: FileId,
        path: PathBuf,
        size: u64,
    },
    /// An incoming transfer could not be completed.
    ReceiveFailed { file_id: FileId, reason: String },
    Progress {
        file_id: FileId,
        direction: Direction,
        bytes_done: u64,
        bytes_total: u64,
    },
}

/// Result of feeding one input to [`FileTransfers`].
#[derive(Debug, Default)]
pub struct TransferStep {
    /// Packets to send. Replies to an inbound packet go back on the channel it
    /// arrived on; sweep resends go on the outbound file channel.
    pub packets: Vec<FilePacket>,
    pub events: Vec<TransferEvent>,
}

impl TransferStep {
    fn packet(packet: FilePacket) -> Self {
        Self {
            packets: vec![packet],
            events: Vec::new(),
        }
    }

    fn event(event: TransferEvent) -> Self {
        Self {
            packets: Vec::new(),
            events: vec![event],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("{0} is a symlink to another symlink")]
    SymlinkChain(PathBuf),
    #[error("{0} is not a regular file")]
    NotARegularFile(PathBuf),
    #[error("file of {0} bytes needs more chunks than the protocol can number")]
    TooLarge(u64),
    #[error("chunk {chunk} of file {file_id} starts beyond end of file")]
    ChunkBeyondEof { file_id: FileId, chunk: ChunkId },
    #[error("unexpected {packet} on {direction:?} file channel")]
    UnexpectedPacket {
        packet: &'static str,
        direction: Direction,
    },
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl TransferError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

struct OutgoingTransfer {
    path: PathBuf,
    size: u64,
    chunk_count: u32,
    content_hash: ContentHash,
    name: Option<String>,
    /// Next chunk the peer has not acknowledged.
    cur_chunk: u32,
    /// Sends of the current header or chunk.
    attempts: u8,
    sent_at: Instant,
}

struct IncomingTransfer {
    staging: PathBuf,
    size: u64,
    chunk_count: u32,
    missing: u32,
    received: HashSet<ChunkId>,
    bytes_done: u64,
    expected_hash: ContentHash,
    name: Option<String>,
    last_activity: Instant,
}

/// Outcome of an incoming transfer that has been retired.
struct FinishedTransfer {
    size: u64,
    chunk_count: u32,
    content_hash: ContentHash,
    received: bool,
    at: Instant,
}

impl FinishedTransfer {
    fn same_file(&self, size: u64, chunk_count: u32, content_hash: &ContentHash) -> bool {
        self.size == size && self.chunk_count == chunk_count && &self.content_hash == content_hash
    }
}

/// Per-peer file transfer state.
pub struct FileTransfers {
    peer: PeerId,
    settings: TransferSettings,
    /// Header sent, waiting for FileHeaderAck.
    pending_headers: HashMap<FileId, OutgoingTransfer>,
    /// Header accepted, chunks streaming.
    active: HashMap<FileId, OutgoingTransfer>,
    incoming: HashMap<FileId, IncomingTransfer>,
    finished: HashMap<FileId, FinishedTransfer>,
}

impl FileTransfers {
    pub fn new(peer: PeerId, settings: TransferSettings) -> Self {
        Self {
            peer,
            settings,
            pending_headers: HashMap::new(),
            active: HashMap::new(),
            incoming: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    pub fn has_outgoing(&self, file_id: FileId) -> bool {
        self.pending_headers.contains_key(&file_id) || self.active.contains_key(&file_id)
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    /// Staging directory for an incoming transfer from this peer.
    pub fn staging_dir(&self, file_id: FileId) -> PathBuf {
        self.settings
            .staging_root
            .join(format!("burrow-{}-{}", self.peer.service_id(), file_id))
    }

    // ── Sender ───────────────────────────────────────────────────────────────

    /// Start, or resume, sending `path` as `file_id`.
    ///
    /// Calling this again for a transfer that is already known resends the
    /// packet the peer is waiting for instead of starting over.
    pub fn send_file_with_id(
        &mut self,
        file_id: FileId,
        path: &Path,
        now: Instant,
    ) -> Result<FilePacket, TransferError> {
        if let Some(transfer) = self.active.get_mut(&file_id) {
            tracing::debug!(
                peer = self.peer.short(),
                file_id,
                chunk = transfer.cur_chunk,
                "resuming file transfer"
            );
            transfer.sent_at = now;
            return chunk_packet(file_id, transfer);
        }
        if let Some(transfer) = self.pending_headers.get_mut(&file_id) {
            tracing::debug!(peer = self.peer.short(), file_id, "resending file header");
            transfer.sent_at = now;
            return Ok(header_packet(file_id, transfer));
        }

        let path = resolve_regular_file(path)?;
        let file = File::open(&path).map_err(|e| TransferError::io(&path, e))?;
        let (content_hash, size) =
            crypto::hash_reader(file).map_err(|e| TransferError::io(&path, e))?;
        let chunk_count =
            u32::try_from(chunk_count_for(size)).map_err(|_| TransferError::TooLarge(size))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let transfer = OutgoingTransfer {
            path,
            size,
            chunk_count,
            content_hash,
            name,
            cur_chunk: 0,
            attempts: 1,
            sent_at: now,
        };
        tracing::info!(
            peer = self.peer.short(),
            file_id,
            size,
            chunk_count,
            content_hash = hex::encode(&content_hash[..8]),
            "announcing file"
        );
        let packet = header_packet(file_id, &transfer);
        self.pending_headers.insert(file_id, transfer);
        Ok(packet)
    }

    fn handle_header_ack(&mut self, ack: FileHeaderAck, now: Instant) -> TransferStep {
        let Some(mut transfer) = self.pending_headers.remove(&ack.file_id) else {
            tracing::debug!(file_id = ack.file_id, "header ack for unknown transfer");
            return TransferStep::default();
        };

        if !ack.accepted {
            tracing::info!(
                peer = self.peer.short(),
                file_id = ack.file_id,
                reason = ?ack.reason,
                "peer refused file"
            );
            let reason = match ack.reason {
                Some(r) => format!("refused by peer: {r:?}"),
                None => "refused by peer".to_string(),
            };
            return TransferStep::event(TransferEvent::SendFailed {
                file_id: ack.file_id,
                reason,
            });
        }

        if transfer.chunk_count == 0 {
            tracing::info!(file_id = ack.file_id, "empty file delivered");
            return TransferStep::event(TransferEvent::Delivered {
                file_id: ack.file_id,
            });
        }

        transfer.attempts = 1;
        transfer.sent_at = now;
        let step = self.send_current_chunk(ack.file_id, &transfer);
        if !step.packets.is_empty() {
            self.active.insert(ack.file_id, transfer);
        }
        step
    }

    fn handle_chunk_ack(&mut self, ack: FileChunkAck, now: Instant) -> TransferStep {
        let file_id = ack.file_id;
        let Some(mut transfer) = self.active.remove(&file_id) else {
            tracing::debug!(file_id, "chunk ack for unknown transfer");
            return TransferStep::default();
        };
        if ack.file_chunk_id != transfer.cur_chunk {
            tracing::debug!(
                file_id,
                acked = ack.file_chunk_id,
                expected = transfer.cur_chunk,
                "stale chunk ack"
            );
            self.active.insert(file_id, transfer);
            return TransferStep::default();
        }

        if ack.accepted {
            transfer.cur_chunk += 1;
            transfer.attempts = 1;
            transfer.sent_at = now;
            let done = (transfer.cur_chunk as u64 * FILE_CHUNK_SIZE as u64).min(transfer.size);
            let progress = TransferEvent::Progress {
                file_id,
                direction: Direction::Outbound,
                bytes_done: done,
                bytes_total: transfer.size,
            };
            if transfer.cur_chunk as u64 * FILE_CHUNK_SIZE as u64 >= transfer.size {
                tracing::info!(peer = self.peer.short(), file_id, "file delivered");
                return TransferStep {
                    packets: Vec::new(),
                    events: vec![progress, TransferEvent::Delivered { file_id }],
                };
            }
            let mut step = self.send_current_chunk(file_id, &transfer);
            step.events.insert(0, progress);
            if !step.packets.is_empty() {
                self.active.insert(file_id, transfer);
            }
            return step;
        }

        if transfer.attempts >= self.settings.max_chunk_attempts {
            tracing::warn!(
                peer = self.peer.short(),
                file_id,
                chunk = transfer.cur_chunk,
                attempts = transfer.attempts,
                "peer keeps rejecting chunk, giving up"
            );
            return TransferStep::event(TransferEvent::SendFailed {
                file_id,
                reason: format!("chunk {} rejected too many times", transfer.cur_chunk),
            });
        }
        transfer.attempts += 1;
        transfer.sent_at = now;
        tracing::debug!(
            file_id,
            chunk = transfer.cur_chunk,
            attempt = transfer.attempts,
            "peer rejected chunk, resending"
        );
        let step = self.send_current_chunk(file_id, &transfer);
        if !step.packets.is_empty() {
            self.active.insert(file_id, transfer);
        }
        step
    }

    /// Packet for the current chunk, or a SendFailed event when the file
    /// can no longer be read.
    fn send_current_chunk(&self, file_id: FileId, transfer: &OutgoingTransfer) -> TransferStep {
        match chunk_packet(file_id, transfer) {
            Ok(packet) => TransferStep::packet(packet),
            Err(e) => {
                tracing::warn!(
                    peer = self.peer.short(),
                    file_id,
                    chunk = transfer.cur_chunk,
                    error = %e,
                    "cannot read chunk, abandoning transfer"
                );
                TransferStep::event(TransferEvent::SendFailed {
                    file_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    // ── Receiver ─────────────────────────────────────────────────────────────

    fn handle_header(
        &mut self,
        direction: Direction,
        header: FileHeader,
        now: Instant,
    ) -> TransferStep {
        let file_id = header.file_id.unwrap_or(0);
        let reject = |reason: HeaderRejectReason| {
            tracing::info!(file_id, ?reason, "rejecting file header");
            TransferStep::packet(FilePacket::FileHeaderAck(FileHeaderAck {
                file_id,
                accepted: false,
                reason: Some(reason),
            }))
        };

        if direction != Direction::Inbound {
            return reject(HeaderRejectReason::WrongDirection);
        }
        if header.file_id.is_none() {
            return reject(HeaderRejectReason::MissingFileId);
        }
        let Some(size) = header.size else {
            return reject(HeaderRejectReason::MissingSize);
        };
        let Some(chunk_count) = header.chunk_count else {
            return reject(HeaderRejectReason::MissingChunkCount);
        };
        let Some(expected_hash) = header.content_hash else {
            return reject(HeaderRejectReason::MissingHash);
        };
        if chunk_count_for(size) != chunk_count as u64 {
            return reject(HeaderRejectReason::InconsistentSize);
        }
        if self.settings.max_file_size > 0 && size > self.settings.max_file_size {
            return reject(HeaderRejectReason::TooLarge);
        }

        let accept = TransferStep::packet(FilePacket::FileHeaderAck(FileHeaderAck {
            file_id,
            accepted: true,
            reason: None,
        }));

        if let Some(done) = self.finished.get(&file_id) {
            if done.same_file(size, chunk_count, &expected_hash) {
                if done.received {
                    tracing::debug!(file_id, "header for a file already received");
                    return accept;
                }
                return reject(HeaderRejectReason::ReassemblyFailed);
            }
            self.finished.remove(&file_id);
        }

        if let Some(existing) = self.incoming.get_mut(&file_id) {
            if existing.size == size
                && existing.chunk_count == chunk_count
                && existing.expected_hash == expected_hash
            {
                tracing::debug!(file_id, missing = existing.missing, "header resent, keeping progress");
                existing.last_activity = now;
                return accept;
            }
            tracing::info!(file_id, "header replaced with different file, restarting");
            if let Some(old) = self.incoming.remove(&file_id) {
                remove_staging(&old.staging);
            }
        }

        let limit = self.settings.max_incoming_transfers;
        if limit > 0 && self.incoming.len() >= limit {
            tracing::warn!(
                peer = self.peer.short(),
                file_id,
                in_progress = self.incoming.len(),
                "too many incoming transfers"
            );
            return reject(HeaderRejectReason::TooManyTransfers);
        }

        let staging = self.staging_dir(file_id);
        if let Err(e) = fs::create_dir_all(&staging) {
            tracing::warn!(
                file_id,
                staging = %staging.display(),
                error = %e,
                "cannot create staging directory"
            );
            return reject(HeaderRejectReason::StagingFailed);
        }

        tracing::info!(
            peer = self.peer.short(),
            file_id,
            size,
            chunk_count,
            name = header.name.as_deref().unwrap_or(""),
            "accepted incoming file"
        );
        self.incoming.insert(
            file_id,
            IncomingTransfer {
                staging,
                size,
                chunk_count,
                missing: chunk_count,
                received: HashSet::new(),
                bytes_done: 0,
                expected_hash,
                name: header.name,
                last_activity: now,
            },
        );

        let mut step = accept;
        if chunk_count == 0 {
            step.events.push(self.finish_incoming(file_id, now));
        }
        step
    }

    fn handle_chunk(&mut self, chunk: FileChunk, now: Instant) -> TransferStep {
        let file_id = chunk.file_id;
        let Some(transfer) = self.incoming.get_mut(&file_id) else {
            return self.answer_finished_chunk(&chunk);
        };

        if chunk.chunk_size as usize > FILE_CHUNK_SIZE
            || chunk.chunk_size as usize != chunk.chunk_data.len()
        {
            tracing::warn!(
                file_id,
                chunk = chunk.chunk_id,
                declared = chunk.chunk_size,
                actual = chunk.chunk_data.len(),
                "chunk size mismatch, dropping"
            );
            return TransferStep::default();
        }
        if crypto::hash(&chunk.chunk_data) != chunk.content_hash {
            tracing::warn!(file_id, chunk = chunk.chunk_id, "chunk hash mismatch, dropping");
            return TransferStep::default();
        }

        let reply = |accepted: bool| {
            FilePacket::FileChunkAck(FileChunkAck {
                file_id,
                file_chunk_id: chunk.chunk_id,
                accepted,
            })
        };

        if chunk.chunk_id >= transfer.chunk_count {
            tracing::warn!(
                file_id,
                chunk = chunk.chunk_id,
                chunk_count = transfer.chunk_count,
                "chunk id out of range"
            );
            return TransferStep::packet(reply(false));
        }

        let chunk_path = transfer.staging.join(chunk.chunk_id.to_string());
        if let Err(e) = write_chunk(&chunk_path, &chunk.chunk_data) {
            tracing::warn!(file_id, chunk = chunk.chunk_id, error = %e, "cannot persist chunk");
            return TransferStep::packet(reply(false));
        }

        transfer.last_activity = now;
        if transfer.received.insert(chunk.chunk_id) {
            transfer.missing -= 1;
            transfer.bytes_done += chunk.chunk_data.len() as u64;
        }
        tracing::trace!(file_id, chunk = chunk.chunk_id, missing = transfer.missing, "chunk stored");

        let progress = TransferEvent::Progress {
            file_id,
            direction: Direction::Inbound,
            bytes_done: transfer.bytes_done,
            bytes_total: transfer.size,
        };
        if transfer.missing > 0 {
            return TransferStep {
                packets: vec![reply(true)],
                events: vec![progress],
            };
        }

        let outcome = self.finish_incoming(file_id, now);
        let accepted = matches!(outcome, TransferEvent::Received { .. });
        TransferStep {
            packets: vec![reply(accepted)],
            events: vec![progress, outcome],
        }
    }

    /// A chunk for a transfer that is no longer in progress. If we finished
    /// it, the sender lost our last ack: repeat the outcome.
    fn answer_finished_chunk(&self, chunk: &FileChunk) -> TransferStep {
        let file_id = chunk.file_id;
        match self.finished.get(&file_id) {
            Some(done) if chunk.chunk_id < done.chunk_count => {
                tracing::debug!(
                    file_id,
                    chunk = chunk.chunk_id,
                    received = done.received,
                    "chunk for finished transfer, repeating outcome"
                );
                TransferStep::packet(FilePacket::FileChunkAck(FileChunkAck {
                    file_id,
                    file_chunk_id: chunk.chunk_id,
                    accepted: done.received,
                }))
            }
            _ => {
                tracing::debug!(file_id, chunk = chunk.chunk_id, "chunk for unknown transfer, dropping");
                TransferStep::default()
            }
        }
    }

    fn remember_finished(&mut self, file_id: FileId, finished: FinishedTransfer) {
        if self.finished.len() >= FINISHED_MEMORY && !self.finished.contains_key(&file_id) {
            let oldest = self
                .finished
                .iter()
                .min_by_key(|(_, f)| f.at)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                self.finished.remove(&oldest);
            }
        }
        self.finished.insert(file_id, finished);
    }

    /// Reassemble a transfer whose chunks have all arrived, then retire it.
    fn finish_incoming(&mut self, file_id: FileId, now: Instant) -> TransferEvent {
        let Some(transfer) = self.incoming.remove(&file_id) else {
            return TransferEvent::ReceiveFailed {
                file_id,
                reason: "transfer vanished".to_string(),
            };
        };
        let result = reassemble(&transfer, &self.settings.downloads_dir, file_id);
        remove_staging(&transfer.staging);
        self.remember_finished(
            file_id,
            FinishedTransfer {
                size: transfer.size,
                chunk_count: transfer.chunk_count,
                content_hash: transfer.expected_hash,
                received: result.is_ok(),
                at: now,
            },
        );
        match result {
            Ok(path) => {
                tracing::info!(
                    peer = self.peer.short(),
                    file_id,
                    size = transfer.size,
                    path = %path.display(),
                    "file received"
                );
                TransferEvent::Received {
                    file_id,
                    path,
                    size: transfer.size,
                }
            }
            Err(e) => {
                tracing::warn!(peer = self.peer.short(), file_id, error = %e, "file reassembly failed");
                TransferEvent::ReceiveFailed {
                    file_id,
                    reason: format!("{e:#}"),
                }
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Handle a decoded packet from a file channel of `direction`.
    ///
    /// Headers and chunks belong on inbound channels and acks on outbound
    /// ones. A header on the wrong channel is refused with a reason; any other
    /// misdirected packet is a protocol violation.
    pub fn handle_inbound(
        &mut self,
        direction: Direction,
        packet: FilePacket,
        now: Instant,
    ) -> Result<TransferStep, TransferError> {
        match (direction, packet) {
            (_, FilePacket::FileHeader(header)) => Ok(self.handle_header(direction, header, now)),
            (Direction::Inbound, FilePacket::FileChunk(chunk)) => Ok(self.handle_chunk(chunk, now)),
            (Direction::Outbound, FilePacket::FileHeaderAck(ack)) => {
                Ok(self.handle_header_ack(ack, now))
            }
            (Direction::Outbound, FilePacket::FileChunkAck(ack)) => {
                Ok(self.handle_chunk_ack(ack, now))
            }
            (direction, packet) => Err(TransferError::UnexpectedPacket {
                packet: packet_name(&packet),
                direction,
            }),
        }
    }

    /// Deal with transfers that have gone quiet.
    ///
    /// Outgoing headers and chunks unacknowledged for longer than the stall
    /// timeout are resent when `can_send` is set; each resend counts as an
    /// attempt. Incoming transfers idle past the incoming timeout are dropped
    /// along with their staging directory.
    /// Finished transfers are forgotten after the same timeout.
    pub fn sweep(&mut self, now: Instant, can_send: bool) -> TransferStep {
        let mut step = TransferStep::default();
        let stall = self.settings.chunk_stall();
        let max_attempts = self.settings.max_chunk_attempts;

        if can_send {
            let stalled_headers: Vec<FileId> = self
                .pending_headers
                .iter()
                .filter(|(_, t)| now.saturating_duration_since(t.sent_at) >= stall)
                .map(|(id, _)| *id)
                .collect();
            for file_id in stalled_headers {
                let Some(mut transfer) = self.pending_headers.remove(&file_id) else {
                    continue;
                };
                if transfer.attempts >= max_attempts {
                    tracing::warn!(file_id, "no answer to file header, giving up");
                    step.events.push(TransferEvent::SendFailed {
                        file_id,
                        reason: "peer never answered the file header".to_string(),
                    });
                    continue;
                }
                transfer.attempts += 1;
                transfer.sent_at = now;
                tracing::debug!(file_id, attempt = transfer.attempts, "resending stalled header");
                step.packets.push(header_packet(file_id, &transfer));
                self.pending_headers.insert(file_id, transfer);
            }

            let stalled_chunks: Vec<FileId> = self
                .active
                .iter()
                .filter(|(_, t)| now.saturating_duration_since(t.sent_at) >= stall)
                .map(|(id, _)| *id)
                .collect();
            for file_id in stalled_chunks {
                let Some(mut transfer) = self.active.remove(&file_id) else {
                    continue;
                };
                if transfer.attempts >= max_attempts {
                    tracing::warn!(
                        file_id,
                        chunk = transfer.cur_chunk,
                        "chunk never acknowledged, giving up"
                    );
                    step.events.push(TransferEvent::SendFailed {
                        file_id,
                        reason: format!("chunk {} never acknowledged", transfer.cur_chunk),
                    });
                    continue;
                }
                transfer.attempts += 1;
                transfer.sent_at = now;
                tracing::debug!(
                    file_id,
                    chunk = transfer.cur_chunk,
                    attempt = transfer.attempts,
                    "resending stalled chunk"
                );
                let resend = self.send_current_chunk(file_id, &transfer);
                if !resend.packets.is_empty() {
                    self.active.insert(file_id, transfer);
                }
                step.packets.extend(resend.packets);
                step.events.extend(resend.events);
            }
        }

        let timeout = self.settings.incoming_timeout();
        self.finished
            .retain(|_, f| now.saturating_duration_since(f.at) < timeout);
        let idle: Vec<FileId> = self
            .incoming
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for file_id in idle {
            if let Some(transfer) = self.incoming.remove(&file_id) {
                tracing::info!(
                    peer = self.peer.short(),
                    file_id,
                    missing = transfer.missing,
                    "abandoning idle incoming transfer"
                );
                remove_staging(&transfer.staging);
                step.events.push(TransferEvent::ReceiveFailed {
                    file_id,
                    reason: "transfer timed out".to_string(),
                });
            }
        }

        step
    }

    /// Forget an outgoing transfer, e.g. after its message was given up on.
    pub fn cancel_outgoing(&mut self, file_id: FileId) {
        self.pending_headers.remove(&file_id);
        self.active.remove(&file_id);
    }

    /// Forget outgoing transfers whose message is no longer pending.
    pub fn retain_outgoing(&mut self, keep: &[FileId]) {
        self.pending_headers.retain(|id, _| keep.contains(id));
        self.active.retain(|id, _| keep.contains(id));
    }

    /// Drop every incoming transfer and its staging directory.
    pub fn abandon_incoming(&mut self) {
        for (_, transfer) in self.incoming.drain() {
            remove_staging(&transfer.staging);
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn packet_name(packet: &FilePacket) -> &'static str {
    match packet {
        FilePacket::FileHeader(_) => "file header",
        FilePacket::FileHeaderAck(_) => "file header ack",
        FilePacket::FileChunk(_) => "file chunk",
        FilePacket::FileChunkAck(_) => "file chunk ack",
    }
}

fn header_packet(file_id: FileId, transfer: &OutgoingTransfer) -> FilePacket {
    FilePacket::FileHeader(FileHeader {
        file_id: Some(file_id),
        size: Some(transfer.size),
        chunk_count: Some(transfer.chunk_count),
        content_hash: Some(transfer.content_hash),
        name: transfer.name.clone(),
    })
}

fn chunk_packet(file_id: FileId, transfer: &OutgoingTransfer) -> Result<FilePacket, TransferError> {
    let data = read_chunk(&transfer.path, file_id, transfer.cur_chunk)?;
    Ok(FilePacket::FileChunk(FileChunk {
        file_id,
        chunk_id: transfer.cur_chunk,
        chunk_size: data.len() as u32,
        content_hash: crypto::hash(&data),
        chunk_data: data,
    }))
}

/// Resolve `path` to a canonical regular file, following at most one symlink.
fn resolve_regular_file(path: &Path) -> Result<PathBuf, TransferError> {
    let meta = fs::symlink_metadata(path).map_err(|e| TransferError::io(path, e))?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(path).map_err(|e| TransferError::io(path, e))?;
        let target = match path.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
        let target_meta =
            fs::symlink_metadata(&target).map_err(|e| TransferError::io(&target, e))?;
        if target_meta.file_type().is_symlink() {
            return Err(TransferError::SymlinkChain(path.to_path_buf()));
        }
    }
    let canonical = fs::canonicalize(path).map_err(|e| TransferError::io(path, e))?;
    let meta = fs::metadata(&canonical).map_err(|e| TransferError::io(&canonical, e))?;
    if !meta.is_file() {
        return Err(TransferError::NotARegularFile(canonical));
    }
    Ok(canonical)
}

/// Read chunk `index`, bounded by the file's size on disk right now.
fn read_chunk(path: &Path, file_id: FileId, index: ChunkId) -> Result<Vec<u8>, TransferError> {
    let mut file = File::open(path).map_err(|e| TransferError::io(path, e))?;
    let actual = file
        .metadata()
        .map_err(|e| TransferError::io(path, e))?
        .len();
    let offset = index as u64 * FILE_CHUNK_SIZE as u64;
    if offset >= actual {
        return Err(TransferError::ChunkBeyondEof {
            file_id,
            chunk: index,
        });
    }
    let len = (actual - offset).min(FILE_CHUNK_SIZE as u64) as usize;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| TransferError::io(path, e))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)
        .map_err(|e| TransferError::io(path, e))?;
    Ok(data)
}

fn write_chunk(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.flush()
}

fn remove_staging(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::debug!(staging = %dir.display(), error = %e, "failed to remove staging directory");
        }
    }
}

/// Final path component of an advertised name, if it is usable.
fn sanitized_name(name: Option<&str>) -> Option<String> {
    let name = Path::new(name?).file_name()?.to_str()?;
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return None;
    }
    Some(name.to_string())
}

/// `dir/name`, or `dir/stem (n).ext` for the first n that does not exist.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = as_path.extension().and_then(|e| e.to_str());
    let mut n: u32 = 1;
    loop {
        let file_name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Concatenate staged chunks in order into the downloads directory and check
/// the result against the advertised size and hash.
fn reassemble(
    transfer: &IncomingTransfer,
    downloads_dir: &Path,
    file_id: FileId,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(downloads_dir)
        .with_context(|| format!("failed to create {}", downloads_dir.display()))?;
    let name = sanitized_name(transfer.name.as_deref()).unwrap_or_else(|| file_id.to_string());
    let output_path = unique_path(downloads_dir, &name);

    let result = write_output(transfer, &output_path);
    if result.is_err() {
        let _ = fs::remove_file(&output_path);
    }
    result.map(|_| output_path)
}

fn write_output(transfer: &IncomingTransfer, output_path: &Path) -> anyhow::Result<()> {
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;

    let mut hasher = Hasher::new();
    let mut written: u64 = 0;
    for chunk_id in 0..transfer.chunk_count {
        let chunk_path = transfer.staging.join(chunk_id.to_string());
        let data = fs::read(&chunk_path)
            .with_context(|| format!("failed to read staged chunk {}", chunk_path.display()))?;
        hasher.update(&data);
        output
            .write_all(&data)
            .with_context(|| format!("failed to write {}", output_path.display()))?;
        written += data.len() as u64;
    }
    output
        .flush()
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    if written != transfer.size {
        anyhow::bail!(
            "reassembled {} bytes, header announced {}",
            written,
            transfer.size
        );
    }
    if hasher.finalize() != transfer.expected_hash {
        anyhow::bail!("reassembled file does not match the announced hash");
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
