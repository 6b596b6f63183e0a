//! webrtc-rs backed media transport
//!
//! Creates receive-only peer connections and exposes inbound video as
//! [`RemoteVideoTrack`]s whose RTP payloads can be consumed by a decoder.

use super::transport::{
    IceConnectionState, MediaTransport, SharedTrack, TrackReadyState, TransportConfig,
    TransportError, TransportEvent, TransportFactory, VideoTrack,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

const FRAME_BROADCAST_CAPACITY: usize = 512;

/// One RTP payload of the inbound video stream
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub payload: Bytes,
    pub timestamp: u32,
    pub sequence: u16,
}

/// Inbound video track. Payloads are forwarded only while enabled.
#[derive(Debug)]
pub struct RemoteVideoTrack {
    id: String,
    codec: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    frames: broadcast::Sender<VideoFrame>,
}

impl RemoteVideoTrack {
    fn new(id: String, codec: String) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_BROADCAST_CAPACITY);
        Arc::new(Self {
            id,
            codec,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            frames,
        })
    }

    /// Negotiated codec MIME type
    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<VideoFrame> {
        self.frames.subscribe()
    }

    async fn read_loop(self: Arc<Self>, remote: Arc<TrackRemote>) {
        let mut packets = 0u64;
        loop {
            match remote.read_rtp().await {
                Ok((packet, _)) => {
                    packets += 1;
                    if packets == 1 {
                        info!("WHEP: First RTP packet on track {}", self.id);
                    }
                    if self.enabled.load(Ordering::Relaxed) {
                        let _ = self.frames.send(VideoFrame {
                            payload: packet.payload,
                            timestamp: packet.header.timestamp,
                            sequence: packet.header.sequence_number,
                        });
                    }
                }
                Err(e) => {
                    debug!("WHEP: Track {} ended after {} packets: {}", self.id, packets, e);
                    self.ended.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

impl VideoTrack for RemoteVideoTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn ready_state(&self) -> TrackReadyState {
        if self.ended.load(Ordering::Relaxed) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }
}

/// Builds webrtc-rs peer connections
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerConnectionFactory;

impl PeerConnectionFactory {
    pub fn new() -> Self {
        Self
    }

    /// Register the video codecs a WHEP server may answer with
    fn register_video_codecs(media_engine: &mut MediaEngine) -> Result<(), TransportError> {
        let codecs = [
            (
                MIME_TYPE_H264,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
                96,
            ),
            (MIME_TYPE_VP8, "", 97),
            (MIME_TYPE_VP9, "profile-id=0", 98),
        ];
        for (mime_type, fmtp, payload_type) in codecs {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: mime_type.to_string(),
                            clock_rate: 90000,
                            channels: 0,
                            sdp_fmtp_line: fmtp.to_string(),
                            rtcp_feedback: vec![],
                        },
                        payload_type,
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .map_err(|e| TransportError::Create(format!("Failed to register {}: {}", mime_type, e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for PeerConnectionFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        Self::register_video_codecs(&mut media_engine)?;

        // Interceptors provide NACK/RTCP feedback for the inbound stream
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Create(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| TransportError::Create(e.to_string()))?;
        let pc = Arc::new(pc);
        install_handlers(&pc, events);
        Ok(Arc::new(WebRtcTransport { pc }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    let track_events = events.clone();
    pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
        let events = track_events.clone();
        Box::pin(async move {
            if remote.kind() != RTPCodecType::Video {
                debug!("WHEP: Ignoring {} track", remote.kind());
                return;
            }
            let codec = remote.codec().capability.mime_type;
            let track = RemoteVideoTrack::new(remote.id(), codec);
            info!("WHEP: Remote video track {} ({})", track.id(), track.codec());
            tokio::spawn(track.clone().read_loop(remote));
            let shared: SharedTrack = track;
            let _ = events.send(TransportEvent::ReceiverAdded(shared));
        })
    }));

    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            if let Some(state) = map_ice_state(state) {
                let _ = events.send(TransportEvent::IceConnectionStateChanged(state));
            }
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn add_recvonly_video_transceiver(&self) -> Result<(), TransportError> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Transceiver(e.to_string()))
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        // No trickle ICE: the offer must carry every host candidate.
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        let _ = gathered.recv().await;

        match self.pc.local_description().await {
            Some(description) => Ok(description.sdp),
            None => Err(TransportError::Sdp("local description missing after gathering".into())),
        }
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| TransportError::Sdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::Sdp(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("WHEP: Error closing peer connection: {}", e);
        }
    }
}
