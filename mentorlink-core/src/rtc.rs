//! webrtc-rs engine
//!
//! Implements the peer transport and capture seams on top of
//! `RTCPeerConnection`. Audio is Opus, video is VP8; screen share swaps the
//! video sender's track in place.

use crate::media::{CaptureDevice, DeviceError, MediaDevices, MediaError, MediaTrack};
use crate::peer_transport::{
    OpenedTransport, PeerTransport, TransportError, TransportEvent, TransportFactory,
    TransportState,
};
use crate::types::{
    ConnectionStats, IceCandidate, IceServer, MediaConstraints, MediaKind, ParticipantId,
    SdpKind, SessionDescription, TrackSource,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Opus DTX silence frame
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Creates `RTCPeerConnection`-backed transports
pub struct RtcTransportFactory {
    api: API,
}

impl RtcTransportFactory {
    /// Build the engine with Opus, VP8 and the default interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, TransportError> {
        let setup = |e: webrtc::Error| TransportError::Setup(e.to_string());
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(setup)?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: vp8_capability(),
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(setup)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(setup)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn open(
        &self,
        remote: ParticipantId,
        ice_servers: &[IceServer],
    ) -> Result<OpenedTransport, TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        let (tx, events) = mpsc::unbounded_channel();
        let candidates = tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let _ = candidates.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_m_line_index: json.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));
        let states = tx;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                tracing::debug!(peer = %remote, ?state, "Peer connection state changed");
                if let Some(state) = map_state(state) {
                    let _ = states.send(TransportEvent::StateChanged(state));
                }
                Box::pin(async {})
            },
        ));

        tracing::info!(peer = %remote, servers = ice_servers.len(), "WebRTC peer connection created");
        Ok(OpenedTransport {
            transport: Arc::new(RtcPeerTransport {
                remote,
                peer_connection,
                video_sender: Mutex::new(None),
            }),
            events,
        })
    }
}

/// Peer transport over an `RTCPeerConnection`
pub struct RtcPeerTransport {
    remote: ParticipantId,
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::Description(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    match desc.sdp_type {
        RTCSdpType::Offer => SessionDescription::offer(desc.sdp),
        _ => SessionDescription::answer(desc.sdp),
    }
}

fn engine_track(track: &MediaTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, TransportError> {
    track
        .device()
        .rtc_track()
        .map(|t| t as Arc<dyn TrackLocal + Send + Sync>)
        .ok_or_else(|| TransportError::Track(format!("{} has no engine source", track.id())))
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.peer_connection
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer_connection
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        let sender = self
            .peer_connection
            .add_track(engine_track(&track)?)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;
        if track.kind() == MediaKind::Video {
            *self.video_sender.lock() = Some(sender);
        }
        tracing::debug!(peer = %self.remote, track_id = track.id(), "Track added");
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Track("no video sender".to_string()))?;
        sender
            .replace_track(Some(engine_track(&track)?))
            .await
            .map_err(|e| TransportError::Track(e.to_string()))
    }

    async fn stats(&self) -> Result<ConnectionStats, TransportError> {
        let report = self.peer_connection.get_stats().await;
        let (mut lost, mut received) = (0u64, 0u64);
        for stat in report.reports.values() {
            match stat {
                StatsReportType::InboundRTP(inbound) => received += inbound.packets_received,
                StatsReportType::RemoteInboundRTP(remote) => {
                    lost += u64::try_from(remote.packets_lost).unwrap_or(0);
                }
                _ => {}
            }
        }
        Ok(ConnectionStats::new(lost, received))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        tracing::info!(peer = %self.remote, "Peer connection closed");
        Ok(())
    }
}

/// Capture backed by a sample track
///
/// Microphone captures write Opus silence frames while enabled. Video
/// captures carry no frames; an encoder feeding the track is outside this
/// crate.
pub struct SyntheticCapture {
    source: TrackSource,
    track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticCapture {
    fn open(source: TrackSource) -> Arc<Self> {
        let capability = match source.kind() {
            MediaKind::Audio => opus_capability(),
            MediaKind::Video => vp8_capability(),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            source.to_string(),
            "mentorlink".to_string(),
        ));
        let live = Arc::new(AtomicBool::new(true));
        let enabled = Arc::new(AtomicBool::new(true));

        let generator = (source == TrackSource::Microphone).then(|| {
            let track = Arc::clone(&track);
            let live = Arc::clone(&live);
            let enabled = Arc::clone(&enabled);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(AUDIO_FRAME);
                while live.load(Ordering::Acquire) {
                    ticker.tick().await;
                    if !enabled.load(Ordering::Acquire) {
                        continue;
                    }
                    let sample = webrtc::media::Sample {
                        data: bytes::Bytes::from_static(OPUS_SILENCE),
                        duration: AUDIO_FRAME,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        tracing::trace!("Audio sample dropped: {e}");
                    }
                }
            })
        });

        Arc::new(Self {
            source,
            track,
            live,
            enabled,
            generator: Mutex::new(generator),
        })
    }

    /// Capture source
    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.source
    }
}

impl CaptureDevice for SyntheticCapture {
    fn stop(&self) {
        self.live.store(false, Ordering::Release);
        if let Some(generator) = self.generator.lock().take() {
            generator.abort();
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        Some(Arc::clone(&self.track))
    }
}

/// Capture devices producing [`SyntheticCapture`]s
#[derive(Debug, Default)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<(TrackSource, Arc<dyn CaptureDevice>)>, DeviceError> {
        let sources = constraints.sources();
        if sources.is_empty() {
            return Err(DeviceError::ConstraintsUnsatisfiable(
                "neither audio nor video requested".to_string(),
            ));
        }
        Ok(sources
            .into_iter()
            .map(|source| (source, SyntheticCapture::open(source) as Arc<dyn CaptureDevice>))
            .collect())
    }

    async fn open_camera(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Arc<dyn CaptureDevice>, DeviceError> {
        Ok(SyntheticCapture::open(TrackSource::Camera))
    }

    async fn open_display(&self) -> Result<Arc<dyn CaptureDevice>, MediaError> {
        Ok(SyntheticCapture::open(TrackSource::Screen))
    }

    fn supports_display_capture(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(TransportState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_from_engine() {
        let factory = RtcTransportFactory::new().unwrap();
        let opened = factory.open(ParticipantId(2), &[]).await.unwrap();
        let offer = opened.transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        opened.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_synthetic_devices_stop() {
        let devices = SyntheticDevices;
        let opened = devices
            .open_user_media(&MediaConstraints::video_call())
            .await
            .unwrap();
        assert_eq!(opened.len(), 2);
        for (_, device) in &opened {
            assert!(device.rtc_track().is_some());
            device.stop();
            assert!(!device.is_live());
        }
    }
}
