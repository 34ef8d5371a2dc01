//! Thin wrapper around the WebRTC peer connection.
//!
//! Candidates are gathered non-trickle: `offer_with_candidates` and
//! `answer_with_candidates` block until ICE gathering completes so the
//! returned SDP bundles every candidate. That is what makes one signal
//! string per side sufficient for the out-of-band exchange.

use crate::transport::DataTransport;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Monotonically increasing counter so watchdog tasks can detect peer
/// swaps. Each call to `WebRtcPeer::new` bumps this; a timeout whose
/// generation no longer matches the installed peer is stale.
static PEER_GENERATION: AtomicU64 = AtomicU64::new(0);

pub(crate) const DATA_CHANNEL_LABEL: &str = "data";

pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    pub generation: u64,
}

impl WebRtcPeer {
    pub async fn new(stun_urls: &[String]) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        // Loopback candidates make same-host sessions connectable.
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_include_loopback_candidate(true);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let generation = PEER_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, "WebRTC peer connection created");

        Ok(Self {
            peer_connection,
            generation,
        })
    }

    /// Create the ordered, reliable channel on the initiator side.
    pub async fn create_data_channel(&self) -> anyhow::Result<Arc<RTCDataChannel>> {
        self.peer_connection
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .context("Failed to create data channel")
    }

    /// Register the responder-side callback for the channel the initiator
    /// announced in its offer.
    pub fn on_data_channel(&self, callback: impl Fn(Arc<RTCDataChannel>) + Send + Sync + 'static) {
        self.peer_connection.on_data_channel(Box::new(move |dc| {
            debug!(label = dc.label(), "Data channel announced by peer");
            callback(dc);
            Box::pin(async {})
        }));
    }

    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) {
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                callback(state);
                Box::pin(async {})
            }));
    }

    /// Create the local offer and block until ICE gathering completes, so
    /// the returned SDP carries every candidate.
    pub async fn offer_with_candidates(&self) -> anyhow::Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;

        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set local description")?;
        let _ = gather_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .context("Local description missing after gathering")?;
        debug!(
            candidates = count_candidates(&local.sdp),
            "Offer gathering complete"
        );
        Ok(local.sdp)
    }

    /// Apply a remote offer and produce the local answer, again blocking
    /// until gathering completes.
    pub async fn answer_with_candidates(&self, offer_sdp: String) -> anyhow::Result<String> {
        let offer =
            RTCSessionDescription::offer(offer_sdp).context("Failed to parse SDP offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;

        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set local description")?;
        let _ = gather_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .context("Local description missing after gathering")?;
        debug!(
            candidates = count_candidates(&local.sdp),
            "Answer gathering complete"
        );
        Ok(local.sdp)
    }

    /// Feed the remote answer back into the initiator.
    pub async fn apply_answer(&self, answer_sdp: String) -> anyhow::Result<()> {
        let answer =
            RTCSessionDescription::answer(answer_sdp).context("Failed to parse SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!(generation = self.generation, "Peer connection closed");
        Ok(())
    }
}

fn count_candidates(sdp: &str) -> usize {
    sdp.lines().filter(|l| l.starts_with("a=candidate")).count()
}

/// Production transport: the transfer engine talking to the real data
/// channel.
pub struct DataChannelTransport {
    data_channel: Arc<RTCDataChannel>,
}

impl DataChannelTransport {
    pub fn new(data_channel: Arc<RTCDataChannel>) -> Self {
        Self { data_channel }
    }
}

#[async_trait]
impl DataTransport for DataChannelTransport {
    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        self.data_channel
            .send_text(text)
            .await
            .context("Failed to send control message")?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> anyhow::Result<()> {
        self.data_channel
            .send(&data)
            .await
            .context("Failed to send chunk")?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.data_channel.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.data_channel.ready_state() == RTCDataChannelState::Open
    }
}
