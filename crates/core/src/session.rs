//! Connection controller and view-model adapter.
//!
//! A `Session` owns exactly one peer at a time (destroy-and-replace on
//! every new handshake), drives it through the out-of-band offer/answer
//! exchange, and routes data-channel payloads into the transfer engine.
//! All state reaches UI collaborators through the watch channel; command
//! failures land in `ViewState::error` and are never returned.

use crate::error::{ErrorKey, classify_peer_error};
use crate::peer::{DataChannelTransport, WebRtcPeer};
use crate::source::FileSource;
use crate::state::{ConnectionState, SignalStatus, StateHub, ViewState};
use crate::transfer::{ReceivedFile, TransferEngine};
use crate::transport::DataTransport;
use crate::wake::{NoopWakeLock, WakeLock};
use courier_protocol::{
    CONNECT_TIMEOUT_SECS, IceConfig, SignalBlob, SignalKind, decode_signal, encode_signal,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// The aggregated core behind one reactive surface. Cloning is cheap and
/// every clone shares the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    hub: Arc<StateHub>,
    engine: Arc<TransferEngine>,
    peer: tokio::sync::Mutex<Option<Arc<WebRtcPeer>>>,
    transport: std::sync::Mutex<Option<Arc<dyn DataTransport>>>,
    state_rx: watch::Receiver<ViewState>,
    received_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ReceivedFile>>>,
    stun_urls: Vec<String>,
}

impl Session {
    pub fn new(ice: IceConfig) -> Self {
        Self::with_wake_lock(ice, Arc::new(NoopWakeLock))
    }

    pub fn with_wake_lock(ice: IceConfig, wake: Arc<dyn WakeLock>) -> Self {
        let (hub, state_rx) = StateHub::new();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(Arc::clone(&hub), wake, received_tx);
        Self {
            inner: Arc::new(SessionInner {
                hub,
                engine,
                peer: tokio::sync::Mutex::new(None),
                transport: std::sync::Mutex::new(None),
                state_rx,
                received_rx: std::sync::Mutex::new(Some(received_rx)),
                stun_urls: ice.stun_urls,
            }),
        }
    }

    /// Watch every state change. The receiver always holds the latest
    /// snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.inner.state_rx.clone()
    }

    /// Current snapshot of the reactive surface.
    pub fn state(&self) -> ViewState {
        self.inner.hub.snapshot()
    }

    /// Stream of fully received files, for the UI to offer save actions.
    /// Can be taken once.
    pub fn received_files(&self) -> Option<mpsc::UnboundedReceiver<ReceivedFile>> {
        self.inner
            .received_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Start as the initiator: construct a peer, gather candidates, and
    /// publish the encoded offer for out-of-band delivery.
    pub async fn create_offer(&self) {
        if self.state().connection != ConnectionState::Idle {
            warn!("createOffer ignored outside idle");
            return;
        }
        self.enter_connecting();
        if let Err(key) = self.start_as_initiator().await {
            self.enter_error(key).await;
        }
    }

    /// Start as the responder: decode the pasted offer, answer it, and
    /// publish the encoded answer.
    pub async fn accept_offer(&self, encoded: &str) {
        if self.state().connection != ConnectionState::Idle {
            warn!("acceptOffer ignored outside idle");
            return;
        }
        let blob = match decode_signal(encoded) {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Offer decode failed: {e}");
                self.set_error_state(ErrorKey::InvalidOfferFormat);
                return;
            }
        };
        if blob.kind != SignalKind::Offer {
            warn!("Pasted signal is not an offer");
            self.set_error_state(ErrorKey::InvalidOffer);
            return;
        }
        self.enter_connecting();
        if let Err(key) = self.start_as_responder(blob).await {
            self.enter_error(key).await;
        }
    }

    /// Initiator only: feed the pasted answer back into the waiting peer.
    pub async fn accept_answer(&self, encoded: &str) {
        if self.state().connection != ConnectionState::WaitingForPeer {
            warn!("acceptAnswer ignored outside waitingForPeer");
            return;
        }
        let blob = match decode_signal(encoded) {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Answer decode failed: {e}");
                self.enter_error(ErrorKey::InvalidAnswerFormat).await;
                return;
            }
        };
        if blob.kind != SignalKind::Answer {
            warn!("Pasted signal is not an answer");
            self.enter_error(ErrorKey::InvalidAnswer).await;
            return;
        }

        self.inner.hub.update(|s| {
            s.connection = ConnectionState::Connecting;
        });
        let peer = { self.inner.peer.lock().await.clone() };
        let Some(peer) = peer else {
            warn!("acceptAnswer with no peer");
            self.set_error_state(ErrorKey::InvalidAnswer);
            return;
        };
        if let Err(e) = peer.apply_answer(blob.sdp).await {
            warn!("Failed to apply answer: {e:#}");
            self.enter_error(ErrorKey::InvalidAnswer).await;
        }
    }

    /// Queue files for sending; appends when a transfer loop is already
    /// running.
    pub async fn send_files(&self, sources: Vec<Arc<dyn FileSource>>) {
        let Some(transport) = self.current_transport() else {
            warn!("sendFiles ignored, no data channel");
            return;
        };
        self.inner.engine.enqueue_files(transport, sources);
    }

    /// Cancel one transfer in either direction.
    pub async fn cancel_transfer(&self, id: &str) {
        let transport = self.current_transport();
        self.inner.engine.cancel(transport.as_ref(), id).await;
    }

    /// Send a chat message over the open channel.
    pub async fn send_message(&self, text: impl Into<String>) {
        let Some(transport) = self.current_transport() else {
            warn!("sendMessage ignored, no data channel");
            return;
        };
        if let Err(e) = self.inner.engine.send_chat(&transport, text.into()).await {
            warn!("Chat send failed: {e:#}");
        }
    }

    /// Hard reset: destroy the peer, drop all queues, transfers, and
    /// messages, and return to idle. Idempotent.
    pub async fn disconnect(&self) {
        self.teardown_peer().await;
        self.inner.engine.clear();
        self.inner.hub.update(|s| *s = ViewState::default());
        info!("Session reset");
    }

    /// Alias of [`Session::disconnect`].
    pub async fn reset_connection(&self) {
        self.disconnect().await;
    }

    /// Clear the surfaced error without touching the connection state.
    pub fn clear_error(&self) {
        self.inner.hub.update(|s| s.error = None);
    }

    /// Host visibility hint: backgrounded while the handshake is pending
    /// surfaces a persistent warning, nothing else changes.
    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.inner.hub.update(|s| {
            s.background_warning = backgrounded
                && matches!(
                    s.connection,
                    ConnectionState::Connecting | ConnectionState::WaitingForPeer
                );
        });
    }

    // --- handshake internals ---

    fn enter_connecting(&self) {
        self.inner.hub.update(|s| {
            s.connection = ConnectionState::Connecting;
            s.signal_status = Some(SignalStatus::Gathering);
            s.local_signal = None;
            s.error = None;
        });
    }

    async fn start_as_initiator(&self) -> Result<(), ErrorKey> {
        let peer = Arc::new(
            WebRtcPeer::new(&self.inner.stun_urls)
                .await
                .map_err(|e| classify_peer_error(&format!("{e:#}")))?,
        );
        let data_channel = peer
            .create_data_channel()
            .await
            .map_err(|e| classify_peer_error(&format!("{e:#}")))?;
        self.wire_data_channel(&data_channel);
        self.wire_peer_events(&peer);
        self.install_peer(Arc::clone(&peer)).await;
        self.spawn_connect_watchdog(peer.generation);

        let sdp = peer
            .offer_with_candidates()
            .await
            .map_err(|e| classify_peer_error(&format!("{e:#}")))?;
        self.publish_local_signal(SignalBlob {
            kind: SignalKind::Offer,
            sdp,
        })
    }

    async fn start_as_responder(&self, offer: SignalBlob) -> Result<(), ErrorKey> {
        let peer = Arc::new(
            WebRtcPeer::new(&self.inner.stun_urls)
                .await
                .map_err(|e| classify_peer_error(&format!("{e:#}")))?,
        );
        // The initiator announced the channel; adopt it when it arrives.
        let session = self.clone();
        peer.on_data_channel(move |dc| session.wire_data_channel(&dc));
        self.wire_peer_events(&peer);
        self.install_peer(Arc::clone(&peer)).await;
        self.spawn_connect_watchdog(peer.generation);

        let sdp = peer
            .answer_with_candidates(offer.sdp)
            .await
            .map_err(|e| {
                warn!("Failed to answer offer: {e:#}");
                ErrorKey::InvalidOffer
            })?;
        self.publish_local_signal(SignalBlob {
            kind: SignalKind::Answer,
            sdp,
        })
    }

    fn publish_local_signal(&self, blob: SignalBlob) -> Result<(), ErrorKey> {
        let encoded = encode_signal(&blob).map_err(|e| ErrorKey::Raw(e.to_string()))?;
        info!(
            kind = ?blob.kind,
            len = encoded.len(),
            "Local signal ready for out-of-band delivery"
        );
        self.inner.hub.update(|s| {
            // The connect event may already have raced signal encoding.
            if s.connection == ConnectionState::Connecting {
                s.connection = ConnectionState::WaitingForPeer;
            }
            s.signal_status = Some(SignalStatus::Ready);
            s.local_signal = Some(encoded);
        });
        Ok(())
    }

    /// Replace the owned peer, closing any previous one.
    async fn install_peer(&self, peer: Arc<WebRtcPeer>) {
        let mut guard = self.inner.peer.lock().await;
        if let Some(old) = guard.replace(peer) {
            let _ = old.close().await;
        }
    }

    async fn teardown_peer(&self) {
        *self
            .inner
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        let old = self.inner.peer.lock().await.take();
        if let Some(peer) = old {
            let _ = peer.close().await;
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn DataTransport>> {
        self.inner
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Hook the data channel into the session: open/close drive the
    /// connection state, messages feed the transfer engine.
    fn wire_data_channel(&self, data_channel: &Arc<RTCDataChannel>) {
        let transport: Arc<dyn DataTransport> =
            Arc::new(DataChannelTransport::new(Arc::clone(data_channel)));
        *self
            .inner
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&transport));

        let session = self.clone();
        let open_transport = Arc::clone(&transport);
        data_channel.on_open(Box::new(move || {
            let session = session.clone();
            let transport = Arc::clone(&open_transport);
            Box::pin(async move {
                session.on_channel_open(transport);
            })
        }));

        let session = self.clone();
        data_channel.on_close(Box::new(move || {
            let session = session.clone();
            Box::pin(async move {
                session.on_channel_close();
            })
        }));

        let engine = Arc::clone(&self.inner.engine);
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                engine.handle_inbound(msg.is_string, msg.data);
            })
        }));
    }

    fn wire_peer_events(&self, peer: &Arc<WebRtcPeer>) {
        let session = self.clone();
        peer.on_connection_state_change(move |state| match state {
            RTCPeerConnectionState::Failed => {
                warn!("Peer connection failed");
                let session = session.clone();
                tokio::spawn(async move {
                    session.enter_error(ErrorKey::IceFailed).await;
                });
            }
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Disconnected => {
                session.on_channel_close();
            }
            _ => {
                debug!(?state, "Peer connection state changed");
            }
        });
    }

    fn on_channel_open(&self, transport: Arc<dyn DataTransport>) {
        info!("Data channel open");
        self.inner.hub.update(|s| {
            s.connection = ConnectionState::Connected;
            s.signal_status = None;
            s.error = None;
            s.background_warning = false;
        });
        // Files queued before the channel opened can start flowing now.
        self.inner.engine.kick(transport);
    }

    fn on_channel_close(&self) {
        let mut transitioned = false;
        self.inner.hub.update(|s| {
            if matches!(
                s.connection,
                ConnectionState::Connected
                    | ConnectionState::Connecting
                    | ConnectionState::WaitingForPeer
            ) {
                info!("Peer closed, session disconnected");
                s.connection = ConnectionState::Disconnected;
                s.signal_status = None;
                transitioned = true;
            }
        });
        if transitioned {
            let session = self.clone();
            tokio::spawn(async move {
                session.teardown_peer().await;
            });
        }
    }

    /// 180 s from entering connecting to connected, else the peer is
    /// destroyed and `connectionTimeout` surfaces. Stale watchdogs from a
    /// replaced peer are ignored via the generation counter.
    fn spawn_connect_watchdog(&self, generation: u64) {
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(CONNECT_TIMEOUT_SECS)).await;
            let current = {
                let guard = session.inner.peer.lock().await;
                guard.as_ref().map(|p| p.generation)
            };
            if current != Some(generation) {
                return;
            }
            if matches!(
                session.state().connection,
                ConnectionState::Connecting | ConnectionState::WaitingForPeer
            ) {
                warn!("Handshake timed out");
                session.enter_error(ErrorKey::ConnectionTimeout).await;
            }
        });
    }

    async fn enter_error(&self, key: ErrorKey) {
        self.teardown_peer().await;
        self.set_error_state(key);
    }

    fn set_error_state(&self, key: ErrorKey) {
        self.inner.hub.update(|s| {
            s.connection = ConnectionState::Error;
            s.signal_status = None;
            s.error = Some(key.to_string());
        });
    }

    #[cfg(test)]
    pub(crate) async fn has_peer(&self) -> bool {
        self.inner.peer.lock().await.is_some()
    }
}
