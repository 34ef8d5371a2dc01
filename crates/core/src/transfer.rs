//! Chunked transfer engine.
//!
//! Owns the FIFO send queue, the single receive-side assembly, and the
//! cancelled-id set. Exactly one file is in flight at a time: a pump task
//! drains the queue sequentially, throttling itself against the
//! channel's outbound buffer, while inbound payloads are dispatched from
//! the data-channel callback.

use crate::source::FileSource;
use crate::state::{
    ChatMessage, ChatSender, Direction, FileTransfer, StateHub, TransferStatus, epoch_ms,
};
use crate::transport::DataTransport;
use crate::wake::WakeLock;
use bytes::Bytes;
use courier_protocol::{
    BACKPRESSURE_POLL_MS, CHUNK_SIZE, ChannelMessage, HIGH_WATER_MARK, INTER_FILE_PAUSE_MS,
    PROGRESS_THROTTLE_MS, chunk_count,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A file received in full, handed to the UI so it can offer a save
/// action. The bytes live in memory until the collaborator persists them.
#[derive(Debug)]
pub struct ReceivedFile {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

struct QueueEntry {
    id: String,
    name: String,
    size: u64,
    source: Arc<dyn FileSource>,
}

/// Receive-side reassembly buffer. At most one exists at a time; created
/// on `file-meta`, destroyed on `file-complete` or `file-cancel`.
struct IncomingAssembly {
    id: String,
    name: String,
    size: u64,
    chunks: Vec<Bytes>,
    received_bytes: u64,
    started: Instant,
    last_update: Instant,
}

enum SendOutcome {
    Done,
    Cancelled,
    Failed,
    PeerGone,
}

pub(crate) struct TransferEngine {
    hub: Arc<StateHub>,
    wake: Arc<dyn WakeLock>,
    queue: Mutex<VecDeque<QueueEntry>>,
    cancelled: Mutex<HashSet<String>>,
    incoming: Mutex<Option<IncomingAssembly>>,
    is_sending: AtomicBool,
    wake_held: AtomicBool,
    received_tx: mpsc::UnboundedSender<ReceivedFile>,
}

impl TransferEngine {
    pub(crate) fn new(
        hub: Arc<StateHub>,
        wake: Arc<dyn WakeLock>,
        received_tx: mpsc::UnboundedSender<ReceivedFile>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            wake,
            queue: Mutex::new(VecDeque::new()),
            cancelled: Mutex::new(HashSet::new()),
            incoming: Mutex::new(None),
            is_sending: AtomicBool::new(false),
            wake_held: AtomicBool::new(false),
            received_tx,
        })
    }

    /// Append files to the send queue and start the pump unless one is
    /// already running.
    pub(crate) fn enqueue_files(
        self: &Arc<Self>,
        transport: Arc<dyn DataTransport>,
        sources: Vec<Arc<dyn FileSource>>,
    ) {
        for source in sources {
            let id = Uuid::new_v4().to_string();
            let name = source.name().to_string();
            let size = source.size();
            self.hub.update(|s| {
                s.transfers.push(FileTransfer::new(
                    id.clone(),
                    name.clone(),
                    size,
                    Direction::Send,
                ));
            });
            self.queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(QueueEntry {
                    id,
                    name,
                    size,
                    source,
                });
        }
        self.kick(transport);
    }

    /// Start the pump if there is queued work and no pump is active.
    pub(crate) fn kick(self: &Arc<Self>, transport: Arc<dyn DataTransport>) {
        if self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
        {
            return;
        }
        if self
            .is_sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.sync_wake();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_send_loop(transport).await;
        });
    }

    async fn run_send_loop(self: Arc<Self>, transport: Arc<dyn DataTransport>) {
        loop {
            // A closed channel leaves the queue intact; the open event
            // kicks the pump again.
            if !transport.is_open() {
                break;
            }
            let entry = self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(entry) = entry else { break };

            match self.send_one(&transport, entry).await {
                SendOutcome::PeerGone => break,
                SendOutcome::Done | SendOutcome::Cancelled | SendOutcome::Failed => {}
            }

            tokio::time::sleep(Duration::from_millis(INTER_FILE_PAUSE_MS)).await;
        }
        self.is_sending.store(false, Ordering::SeqCst);
        self.sync_wake();
        // Files enqueued while the loop was winding down restart it.
        if transport.is_open() {
            self.kick(transport);
        }
    }

    async fn send_one(&self, transport: &Arc<dyn DataTransport>, entry: QueueEntry) -> SendOutcome {
        let QueueEntry {
            id,
            name,
            size,
            source,
        } = entry;

        // A cancel may have raced the dequeue.
        if self.take_cancelled(&id) {
            self.finish_transfer(&id, TransferStatus::Cancelled);
            return SendOutcome::Cancelled;
        }

        let total_chunks = chunk_count(size);
        let started_ms = epoch_ms();
        if !self.hub.update_transfer(&id, |t| {
            t.status = TransferStatus::Transferring;
            t.start_time = Some(started_ms);
        }) {
            return SendOutcome::Cancelled;
        }

        let meta = ChannelMessage::FileMeta {
            id: id.clone(),
            name: name.clone(),
            size,
            total_chunks,
        };
        if let Err(e) = send_control(transport, &meta).await {
            warn!(id = %id, "Failed to announce file: {e:#}");
            self.finish_transfer(&id, TransferStatus::Error);
            return SendOutcome::Failed;
        }
        info!(id = %id, name = %name, size, total_chunks, "File send started");

        let started = Instant::now();
        let mut sent: u64 = 0;
        let mut last_update = started;

        for i in 0..total_chunks {
            if self.take_cancelled(&id) {
                let cancel = ChannelMessage::FileCancel { id: id.clone() };
                let _ = send_control(transport, &cancel).await;
                self.finish_transfer(&id, TransferStatus::Cancelled);
                info!(id = %id, "Send cancelled locally");
                return SendOutcome::Cancelled;
            }
            if self.remotely_cancelled(&id) {
                // The peer already knows; stop without echoing file-cancel.
                debug!(id = %id, "Send stopped after remote cancel");
                return SendOutcome::Cancelled;
            }
            if !transport.is_open() {
                self.finish_transfer(&id, TransferStatus::Error);
                return SendOutcome::PeerGone;
            }

            let offset = i * CHUNK_SIZE as u64;
            let end = (offset + CHUNK_SIZE as u64).min(size);
            let reader = Arc::clone(&source);
            let chunk = match tokio::task::spawn_blocking(move || reader.slice(offset, end)).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    warn!(id = %id, "Chunk read failed: {e}");
                    self.finish_transfer(&id, TransferStatus::Error);
                    return SendOutcome::Failed;
                }
                Err(e) => {
                    warn!(id = %id, "Chunk read task failed: {e}");
                    self.finish_transfer(&id, TransferStatus::Error);
                    return SendOutcome::Failed;
                }
            };

            // Back-pressure: yield until the channel drains below the
            // high-water mark. State may change during every suspension,
            // so liveness and cancellation are re-checked each pass.
            while transport.buffered_amount().await > HIGH_WATER_MARK {
                if !transport.is_open() {
                    self.finish_transfer(&id, TransferStatus::Error);
                    return SendOutcome::PeerGone;
                }
                if self.take_cancelled(&id) {
                    let cancel = ChannelMessage::FileCancel { id: id.clone() };
                    let _ = send_control(transport, &cancel).await;
                    self.finish_transfer(&id, TransferStatus::Cancelled);
                    info!(id = %id, "Send cancelled locally");
                    return SendOutcome::Cancelled;
                }
                tokio::time::sleep(Duration::from_millis(BACKPRESSURE_POLL_MS)).await;
            }

            if let Err(e) = transport.send_binary(Bytes::from(chunk)).await {
                warn!(id = %id, "Chunk send failed: {e:#}");
                self.finish_transfer(&id, TransferStatus::Error);
                return SendOutcome::Failed;
            }
            sent += end - offset;

            let is_last = i + 1 == total_chunks;
            if is_last || last_update.elapsed().as_millis() as u64 >= PROGRESS_THROTTLE_MS {
                last_update = Instant::now();
                self.publish_progress(&id, sent, size, started.elapsed());
            }
        }

        let complete = ChannelMessage::FileComplete {
            id: Some(id.clone()),
        };
        if let Err(e) = send_control(transport, &complete).await {
            warn!(id = %id, "Failed to finalize file: {e:#}");
            self.finish_transfer(&id, TransferStatus::Error);
            return SendOutcome::Failed;
        }
        self.finish_transfer(&id, TransferStatus::Completed);
        info!(id = %id, name = %name, size, "File send complete");
        SendOutcome::Done
    }

    /// Cancel a transfer in either direction; see the per-case rules in
    /// the match arms. Terminal transfers are untouched.
    pub(crate) async fn cancel(&self, transport: Option<&Arc<dyn DataTransport>>, id: &str) {
        let Some((direction, status)) = self.hub.transfer_info(id) else {
            return;
        };
        if status.is_terminal() {
            return;
        }

        match direction {
            // Queued: the peer never learned about it, no wire traffic.
            Direction::Send if status == TransferStatus::Queued => {
                self.queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|e| e.id != id);
                self.finish_transfer(id, TransferStatus::Cancelled);
                info!(id, "Queued send cancelled");
            }
            // In flight: the pump observes the flag before its next chunk
            // and emits the file-cancel itself.
            Direction::Send => {
                self.cancelled
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.to_string());
            }
            Direction::Receive => {
                self.cancelled
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.to_string());
                self.discard_assembly_if(id);
                self.finish_transfer(id, TransferStatus::Cancelled);
                if let Some(transport) = transport {
                    let cancel = ChannelMessage::FileCancel { id: id.to_string() };
                    if let Err(e) = send_control(transport, &cancel).await {
                        warn!(id, "Failed to send cancel: {e:#}");
                    }
                }
                info!(id, "Receive cancelled locally");
                self.sync_wake();
            }
        }
    }

    /// Append a local chat message and put it on the wire.
    pub(crate) async fn send_chat(
        &self,
        transport: &Arc<dyn DataTransport>,
        text: String,
    ) -> anyhow::Result<()> {
        let timestamp = epoch_ms();
        let msg = ChannelMessage::Chat {
            text: text.clone(),
            timestamp,
        };
        send_control(transport, &msg).await?;
        self.hub.update(|s| {
            s.messages.push(ChatMessage {
                id: Uuid::new_v4().to_string(),
                text,
                sender: ChatSender::Me,
                timestamp,
            });
        });
        Ok(())
    }

    /// Dispatch one inbound data-channel payload.
    pub(crate) fn handle_inbound(&self, is_text: bool, data: Bytes) {
        match courier_protocol::parse_control(is_text, &data) {
            Some(msg) => self.handle_control(msg),
            None => self.handle_chunk(data),
        }
    }

    fn handle_control(&self, msg: ChannelMessage) {
        match msg {
            ChannelMessage::FileMeta {
                id,
                name,
                size,
                total_chunks,
            } => self.handle_file_meta(id, name, size, total_chunks),
            ChannelMessage::FileComplete { id } => self.handle_file_complete(id),
            ChannelMessage::FileCancel { id } => self.handle_file_cancel(id),
            ChannelMessage::Chat { text, timestamp } => {
                self.hub.update(|s| {
                    s.messages.push(ChatMessage {
                        id: Uuid::new_v4().to_string(),
                        text,
                        sender: ChatSender::Peer,
                        timestamp,
                    });
                });
            }
        }
    }

    fn handle_file_meta(&self, id: String, name: String, size: u64, total_chunks: u64) {
        {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = incoming.take() {
                // The sender must not interleave files; a fresh meta means
                // the previous transfer was truncated.
                warn!(prev = %prev.id, "New file announced over an unfinished one");
                drop(incoming);
                self.finish_transfer(&prev.id, TransferStatus::Error);
                incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            }
            *incoming = Some(IncomingAssembly {
                id: id.clone(),
                name: name.clone(),
                size,
                chunks: Vec::with_capacity(total_chunks as usize),
                received_bytes: 0,
                started: Instant::now(),
                last_update: Instant::now(),
            });
        }
        let mut record = FileTransfer::new(id.clone(), name.clone(), size, Direction::Receive);
        record.status = TransferStatus::Transferring;
        record.start_time = Some(epoch_ms());
        self.hub.update(|s| s.transfers.push(record));
        self.sync_wake();
        info!(id = %id, name = %name, size, total_chunks, "File receive started");
    }

    fn handle_chunk(&self, data: Bytes) {
        let mut guard = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
        let Some(assembly) = guard.as_mut() else {
            debug!(len = data.len(), "Chunk with no transfer in progress, dropped");
            return;
        };
        assembly.received_bytes += data.len() as u64;
        assembly.chunks.push(data);

        let publish = assembly.received_bytes >= assembly.size
            || assembly.last_update.elapsed().as_millis() as u64 >= PROGRESS_THROTTLE_MS;
        if publish {
            assembly.last_update = Instant::now();
            let (id, received, size, elapsed) = (
                assembly.id.clone(),
                assembly.received_bytes,
                assembly.size,
                assembly.started.elapsed(),
            );
            drop(guard);
            self.publish_progress(&id, received.min(size), size, elapsed);
        }
    }

    fn handle_file_complete(&self, id: Option<String>) {
        let Some(assembly) = self
            .incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("file-complete with no transfer in progress");
            return;
        };
        if let Some(wire_id) = id
            && wire_id != assembly.id
        {
            warn!(wire = %wire_id, local = %assembly.id, "file-complete id mismatch, using current assembly");
        }
        if self.take_cancelled(&assembly.id) {
            debug!(id = %assembly.id, "Discarding completed-but-cancelled assembly");
            self.sync_wake();
            return;
        }

        let mut bytes = Vec::with_capacity(assembly.received_bytes as usize);
        for chunk in &assembly.chunks {
            bytes.extend_from_slice(chunk);
        }
        self.finish_transfer(&assembly.id, TransferStatus::Completed);
        info!(
            id = %assembly.id,
            name = %assembly.name,
            size = assembly.received_bytes,
            "File receive complete"
        );
        let _ = self.received_tx.send(ReceivedFile {
            id: assembly.id,
            name: assembly.name,
            bytes,
        });
        self.sync_wake();
    }

    fn handle_file_cancel(&self, id: String) {
        self.discard_assembly_if(&id);
        if self.hub.transfer_info(&id).is_some() {
            self.finish_transfer(&id, TransferStatus::Cancelled);
            info!(id = %id, "Transfer cancelled by peer");
        } else {
            debug!(id = %id, "Cancel for unknown transfer ignored");
        }
        self.sync_wake();
    }

    /// Drop all queued and in-progress work; called on disconnect.
    pub(crate) fn clear(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.incoming.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.sync_wake();
    }

    fn discard_assembly_if(&self, id: &str) {
        let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
        if incoming.as_ref().is_some_and(|a| a.id == id) {
            *incoming = None;
        }
    }

    fn take_cancelled(&self, id: &str) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    fn remotely_cancelled(&self, id: &str) -> bool {
        matches!(
            self.hub.transfer_info(id),
            Some((_, TransferStatus::Cancelled))
        )
    }

    fn finish_transfer(&self, id: &str, status: TransferStatus) {
        let now = epoch_ms();
        self.hub.update_transfer(id, |t| {
            t.status = status;
            if status == TransferStatus::Completed {
                t.progress = 100;
                t.eta = None;
            }
            t.end_time = Some(now);
        });
    }

    fn publish_progress(&self, id: &str, done: u64, size: u64, elapsed: Duration) {
        // 100 is reserved for completion; a transferring file caps at 99.
        let progress = if size == 0 {
            99
        } else {
            (((done as f64 / size as f64) * 100.0).round() as u8).min(99)
        };
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { done as f64 / secs } else { 0.0 };
        let eta = if speed > 0.0 {
            Some((size.saturating_sub(done)) as f64 / speed)
        } else {
            None
        };
        self.hub.update_transfer(id, |t| {
            t.progress = t.progress.max(progress);
            t.speed = speed;
            t.eta = eta;
        });
    }

    /// Hold the wake lock exactly while a pump is running or an assembly
    /// is open.
    fn sync_wake(&self) {
        let active = self.is_sending.load(Ordering::SeqCst)
            || self
                .incoming
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some();
        if active {
            if !self.wake_held.swap(true, Ordering::SeqCst) {
                self.wake.acquire();
            }
        } else if self.wake_held.swap(false, Ordering::SeqCst) {
            self.wake.release();
        }
    }
}

async fn send_control(
    transport: &Arc<dyn DataTransport>,
    msg: &ChannelMessage,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(msg)?;
    transport.send_text(json).await
}
