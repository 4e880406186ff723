//! WebRTC transport: the peer connection, its single data channel, and the
//! bridge from connection callbacks into the session's event queue.
//!
//! Callbacks registered here do no protocol work of their own. Every open,
//! message, close, and error is forwarded as a [`SessionEvent`] so the
//! session task remains the only place where ordering matters.

mod gate;

pub(crate) use gate::{await_drained, await_sendable};

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::core::config::{DATA_CHANNEL_LABEL, ICE_GATHER_TIMEOUT, INCLUDE_LOOPBACK_CANDIDATES};
use crate::core::error::TransferError;
use crate::core::session::SessionEvent;

/// Default ICE configuration: a public STUN server for reflexive candidates.
pub(crate) fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_owned()],
        ..Default::default()
    }]
}

/// One session's peer connection plus its transfer channel.
///
/// The initiating side creates the channel up front; the responding side
/// receives it through `on_data_channel` once negotiation lands.
pub(crate) struct PeerLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl PeerLink {
    /// Build the sending side: connection plus a fresh ordered channel.
    pub(crate) async fn initiator(
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, TransferError> {
        let pc = build_peer_connection(&events).await?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| TransferError::negotiation(format!("data channel creation failed: {e}")))?;
        attach_channel_forwarders(&dc, events);
        Ok(Self {
            pc,
            channel: Arc::new(RwLock::new(Some(dc))),
        })
    }

    /// Build the receiving side: connection only, channel adopted on arrival.
    pub(crate) async fn responder(
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, TransferError> {
        let pc = build_peer_connection(&events).await?;
        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        let slot = channel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            let events = events.clone();
            Box::pin(async move {
                info!(event = "data_channel_announced", label = %dc.label(), "Peer opened a channel");
                attach_channel_forwarders(&dc, events);
                *slot.write().await = Some(dc);
            })
        }));

        Ok(Self { pc, channel })
    }

    /// Create the local offer and return its SDP with all candidates inlined.
    pub(crate) async fn create_offer_sdp(&self) -> Result<String, TransferError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransferError::negotiation(format!("offer creation failed: {e}")))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransferError::negotiation(format!("local description rejected: {e}")))?;
        self.gathered_local_sdp().await
    }

    /// Apply the remote offer and return the gathered local answer SDP.
    pub(crate) async fn accept_offer_sdp(&self, sdp: &str) -> Result<String, TransferError> {
        let remote = RTCSessionDescription::offer(sdp.to_owned())
            .map_err(|e| TransferError::negotiation(format!("remote offer unusable: {e}")))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransferError::negotiation(format!("remote offer rejected: {e}")))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransferError::negotiation(format!("answer creation failed: {e}")))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransferError::negotiation(format!("local description rejected: {e}")))?;
        self.gathered_local_sdp().await
    }

    /// Apply the remote answer on the initiating side.
    pub(crate) async fn apply_answer_sdp(&self, sdp: &str) -> Result<(), TransferError> {
        let remote = RTCSessionDescription::answer(sdp.to_owned())
            .map_err(|e| TransferError::negotiation(format!("remote answer unusable: {e}")))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransferError::negotiation(format!("remote answer rejected: {e}")))
    }

    /// The transfer channel, once it exists.
    pub(crate) async fn channel(&self) -> Result<Arc<RTCDataChannel>, TransferError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| TransferError::transport("data channel not available yet"))
    }

    /// Close channel then connection; errors survive only as log lines.
    pub(crate) async fn close(&self) {
        if let Some(dc) = self.channel.read().await.clone() {
            if let Err(err) = dc.close().await {
                debug!(event = "channel_close_failed", error = %err, "Data channel close reported an error");
            }
        }
        if let Err(err) = self.pc.close().await {
            debug!(event = "peer_close_failed", error = %err, "Peer connection close reported an error");
        }
        info!(event = "transport_released", "Peer connection and channel closed");
    }

    /// Wait for ICE gathering to finish, then read back the complete local
    /// description. Descriptors are exchanged without trickle, so the SDP
    /// must already carry every candidate.
    async fn gathered_local_sdp(&self) -> Result<String, TransferError> {
        if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            let (tx, rx) = oneshot::channel::<()>();
            let tx = Arc::new(Mutex::new(Some(tx)));
            self.pc
                .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        if state == RTCIceGathererState::Complete {
                            if let Ok(mut guard) = tx.lock() {
                                if let Some(tx) = guard.take() {
                                    let _ = tx.send(());
                                }
                            }
                        }
                    })
                }));

            // Gathering may have finished between the first check and the
            // callback registration; re-check before waiting on it.
            if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
                match timeout(ICE_GATHER_TIMEOUT, rx).await {
                    Ok(_) => {}
                    Err(_) => {
                        return Err(TransferError::negotiation(
                            "ICE gathering did not complete in time",
                        ));
                    }
                }
            }
        }

        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransferError::negotiation("no local description after gathering"))?;
        debug!(
            event = "ice_gathering_complete",
            sdp_len = desc.sdp.len(),
            "Local description ready with full candidate set"
        );
        Ok(desc.sdp)
    }
}

/// Shared connection construction for both roles.
async fn build_peer_connection(
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<Arc<RTCPeerConnection>, TransferError> {
    let mut media_engine = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| TransferError::negotiation(format!("interceptor setup failed: {e}")))?;

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_include_loopback_candidate(INCLUDE_LOOPBACK_CANDIDATES);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers: default_ice_servers(),
            ..Default::default()
        })
        .await
        .map_err(|e| TransferError::negotiation(format!("peer connection setup failed: {e}")))?;
    let pc = Arc::new(pc);

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Connected => {
                    info!(event = "peer_connected", "Peer connection established");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(event = "peer_disconnected", "Peer connection interrupted; may recover");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "peer_failed", "Peer connection failed");
                    let _ = events.send(SessionEvent::ChannelError("peer connection failed".into()));
                }
                RTCPeerConnectionState::Closed => {
                    debug!(event = "peer_closed", "Peer connection closed");
                }
                other => {
                    trace!(event = "peer_state_change", state = %other, "Peer connection state change");
                }
            }
        })
    }));

    Ok(pc)
}

/// Forward every channel callback into the session's event queue.
fn attach_channel_forwarders(
    dc: &Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let on_open = events.clone();
    dc.on_open(Box::new(move || {
        let events = on_open.clone();
        Box::pin(async move {
            debug!(event = "channel_open_callback", "Data channel reported open");
            let _ = events.send(SessionEvent::ChannelOpen);
        })
    }));

    let on_close = events.clone();
    dc.on_close(Box::new(move || {
        let events = on_close.clone();
        Box::pin(async move {
            warn!(event = "channel_closed", "Data channel closed");
            let _ = events.send(SessionEvent::ChannelClosed);
        })
    }));

    let on_error = events.clone();
    dc.on_error(Box::new(move |err| {
        let events = on_error.clone();
        Box::pin(async move {
            error!(event = "channel_error", error = %err, "Data channel error");
            let _ = events.send(SessionEvent::ChannelError(err.to_string()));
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            if msg.is_string {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                trace!(event = "text_frame", len = text.len(), "Control frame received");
                let _ = events.send(SessionEvent::ChannelText(text));
            } else {
                trace!(event = "binary_frame", len = msg.data.len(), "Chunk received");
                let _ = events.send(SessionEvent::ChannelBinary(msg.data));
            }
        })
    }));
}
