//! View-model state shared between the connection controller and the
//! transfer engine, published to UI collaborators through a watch
//! channel. All mutation funnels through [`StateHub`] so every change is
//! observable as a fresh snapshot.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Connection lifecycle as shown to the UI. Recoverable errors return to
/// `Idle` only via an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Idle,
    WaitingForPeer,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Progress of producing the local signal string, distinct from the
/// connection state so the UI can show "generating" vs "waiting for the
/// peer to paste it back".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalStatus {
    Gathering,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Queued,
    Transferring,
    Completed,
    Cancelled,
    Error,
}

impl TransferStatus {
    /// Terminal statuses freeze the transfer record; only `end_time` may
    /// still be written in the same transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Error
        )
    }
}

/// One file transfer, in either direction. `progress` reaches 100 exactly
/// when the status becomes `Completed` and never decreases in between.
#[derive(Debug, Clone, Serialize)]
pub struct FileTransfer {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub direction: Direction,
    pub status: TransferStatus,
    pub progress: u8,
    /// Cumulative average bytes/second since the transfer started.
    pub speed: f64,
    /// Seconds remaining, absent while the speed is zero.
    pub eta: Option<f64>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
}

impl FileTransfer {
    pub(crate) fn new(id: String, name: String, size: u64, direction: Direction) -> Self {
        Self {
            id,
            name,
            size,
            direction,
            status: TransferStatus::Queued,
            progress: 0,
            speed: 0.0,
            eta: None,
            start_time: None,
            end_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatSender {
    Me,
    Peer,
}

/// Append-only chat entry; never mutated after insertion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: ChatSender,
    pub timestamp: u64,
}

/// Complete reactive surface consumed by UI collaborators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewState {
    pub connection: ConnectionState,
    pub signal_status: Option<SignalStatus>,
    /// Encoded local offer or answer, ready to be rendered as a QR code.
    pub local_signal: Option<String>,
    /// Error key for i18n, or a raw message passed through verbatim.
    pub error: Option<String>,
    /// Ordered by insertion.
    pub transfers: Vec<FileTransfer>,
    /// Ordered by receipt.
    pub messages: Vec<ChatMessage>,
    /// Set while the host is backgrounded during the handshake; candidate
    /// gathering tends to stall in background tabs.
    pub background_warning: bool,
}

impl ViewState {
    pub fn transfer(&self, id: &str) -> Option<&FileTransfer> {
        self.transfers.iter().find(|t| t.id == id)
    }
}

/// Single owner of the mutable view state. Every `update` publishes the
/// new snapshot on the watch channel.
pub(crate) struct StateHub {
    state: Mutex<ViewState>,
    tx: watch::Sender<ViewState>,
}

impl StateHub {
    pub(crate) fn new() -> (Arc<Self>, watch::Receiver<ViewState>) {
        let (tx, rx) = watch::channel(ViewState::default());
        (
            Arc::new(Self {
                state: Mutex::new(ViewState::default()),
                tx,
            }),
            rx,
        )
    }

    pub(crate) fn snapshot(&self) -> ViewState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut ViewState)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
        let _ = self.tx.send(state.clone());
    }

    /// Mutate one transfer record. Returns false when the transfer is
    /// missing or already terminal, which keeps finished records frozen.
    pub(crate) fn update_transfer(&self, id: &str, f: impl FnOnce(&mut FileTransfer)) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(transfer) = state.transfers.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if transfer.status.is_terminal() {
            return false;
        }
        f(transfer);
        let _ = self.tx.send(state.clone());
        true
    }

    pub(crate) fn transfer_info(&self, id: &str) -> Option<(Direction, TransferStatus)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.transfer(id).map(|t| (t.direction, t.status))
    }
}

/// Milliseconds since the Unix epoch, for transfer and chat timestamps.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
