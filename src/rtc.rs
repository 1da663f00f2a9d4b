// src/rtc.rs
//
// `PeerTransport` backed by a webrtc-rs `RTCPeerConnection`.
//
// Publishers attach the tracks of a freshly opened capture stream; viewers
// only receive.  Candidates are trickled: every locally gathered candidate is
// reported through the event sink as soon as the ICE agent produces it.
//
// ────────────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::capture::{CaptureSource, MediaStream};
use crate::error::TransportError;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    LinkState, PeerTransport, TransportEvent, TransportEventSink, TransportFactory,
};

// ─── Peer connection setup ──────────────────────────────────────────────────

async fn create_peer_connection(
    stun_urls: &[String],
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
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

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, peer_id: &str, sink: &TransportEventSink) {
    {
        let sink = sink.clone();
        let pid = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(peer_id = %pid, "peer connection state: {state}");
            sink.emit(TransportEvent::Link(link_state(state)));
            Box::pin(async {})
        }));
    }

    {
        let sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // `None` marks the end of gathering.
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("could not serialise local candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));
    }

    {
        let sink = sink.clone();
        let pid = peer_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = track.kind().to_string();
            info!(peer_id = %pid, kind = %kind, ssrc = track.ssrc(), "track received");
            sink.emit(TransportEvent::RemoteTrack { kind });
            Box::pin(async {})
        }));
    }
}

// ─── Factory ────────────────────────────────────────────────────────────────

pub struct WebRtcTransportFactory {
    stun_urls: Vec<String>,
    capture: Option<Arc<dyn CaptureSource>>,
}

impl WebRtcTransportFactory {
    /// Receive-only transports (viewer side).
    pub fn receiver(stun_urls: Vec<String>) -> Self {
        Self { stun_urls, capture: None }
    }

    /// Transports that send the tracks of `capture` (publisher side).
    pub fn sender(stun_urls: Vec<String>, capture: Arc<dyn CaptureSource>) -> Self {
        Self {
            stun_urls,
            capture: Some(capture),
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        sink: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let pc = create_peer_connection(&self.stun_urls)
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        let stream = match &self.capture {
            Some(capture) => {
                let stream = capture.open().await?;
                for track in stream.tracks() {
                    if let Err(e) = pc.add_track(track).await {
                        stream.stop();
                        let _ = pc.close().await;
                        return Err(TransportError::Setup(format!("add_track failed: {e}")));
                    }
                }
                Some(stream)
            }
            None => None,
        };

        install_callbacks(&pc, peer_id, &sink);
        debug!(peer_id, generation = sink.generation(), "peer connection created");

        Ok(Box::new(WebRtcTransport {
            peer_id: peer_id.to_string(),
            pc,
            stream,
        }))
    }
}

// ─── Transport ──────────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    stream: Option<Box<dyn MediaStream>>,
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let sdp = description.sdp.clone();
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if offer.kind != SdpKind::Offer {
            return Err(TransportError::InvalidDescription("expected an offer".into()));
        }
        self.pc.set_remote_description(to_rtc(offer)?).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
        if answer.kind != SdpKind::Answer {
            return Err(TransportError::InvalidDescription("expected an answer".into()));
        }
        self.pc.set_remote_description(to_rtc(answer)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn reconnect_in_place(&self) -> Result<(), TransportError> {
        // The ICE agent keeps running consent checks on the selected pair and
        // moves back to connected on its own if the path returns.
        match self.pc.connection_state() {
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => {
                Err(TransportError::Closed)
            }
            state => {
                debug!(peer_id = %self.peer_id, "waiting for ICE agent to recover from {state}");
                Ok(())
            }
        }
    }

    async fn close(&self) {
        if let Some(stream) = &self.stream {
            stream.stop();
        }
        if let Err(e) = self.pc.close().await {
            warn!(peer_id = %self.peer_id, "error closing peer connection: {e}");
        }
    }
}
