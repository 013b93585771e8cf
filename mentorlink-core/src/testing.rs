//! In-process engine for tests and simulation
//!
//! [`FakeTransport`] and [`FakeDevices`] stand in for the media engine. They
//! record every call so tests can assert on what the negotiation core asked
//! the engine to do.

use crate::media::{CaptureDevice, DeviceError, MediaDevices, MediaError, MediaTrack};
use crate::peer_transport::{
    OpenedTransport, PeerTransport, TransportError, TransportEvent, TransportFactory,
    TransportState,
};
use crate::types::{
    ConnectionStats, IceCandidate, IceServer, MediaConstraints, ParticipantId, SdpKind,
    SessionDescription, TrackSource,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Default)]
struct FakeTransportState {
    pending_local_offer: bool,
    has_local: bool,
    has_remote: bool,
    connected: bool,
    conflicts: u32,
    offers: u32,
    answers: u32,
    rollbacks: u32,
    closes: u32,
    candidates_gathered: u32,
    applied: Vec<IceCandidate>,
    tracks: Vec<String>,
    video_track: Option<String>,
    stats: (u64, u64),
}

/// Scriptable peer transport
pub struct FakeTransport {
    remote: ParticipantId,
    state: Mutex<FakeTransportState>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    hold: watch::Sender<bool>,
    auto_connect: AtomicBool,
}

impl FakeTransport {
    /// Transport towards `remote` with no event stream attached
    #[must_use]
    pub fn new(remote: ParticipantId) -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            remote,
            state: Mutex::new(FakeTransportState::default()),
            events: Mutex::new(None),
            hold,
            auto_connect: AtomicBool::new(true),
        }
    }

    fn with_events(remote: ParticipantId) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self::new(remote);
        *transport.events.lock() = Some(tx);
        (transport, rx)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Suspend description creation until [`FakeTransport::release_descriptions`]
    pub fn hold_descriptions(&self) {
        self.hold.send_replace(true);
    }

    /// Resume description creation
    pub fn release_descriptions(&self) {
        self.hold.send_replace(false);
    }

    async fn wait_released(&self) {
        let mut hold = self.hold.subscribe();
        let _ = hold.wait_for(|held| !*held).await;
    }

    /// Do not report `Connected` when negotiation completes
    pub fn disable_auto_connect(&self) {
        self.auto_connect.store(false, Ordering::SeqCst);
    }

    /// Raise a connection state change
    pub fn set_state(&self, state: TransportState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    /// Set the cumulative counters returned by `stats`
    pub fn set_stats(&self, packets_lost: u64, packets_received: u64) {
        self.state.lock().stats = (packets_lost, packets_received);
    }

    /// Remote participant
    #[must_use]
    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    /// Offers created
    #[must_use]
    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers
    }

    /// Answers created
    #[must_use]
    pub fn answers_created(&self) -> u32 {
        self.state.lock().answers
    }

    /// Rollbacks performed
    #[must_use]
    pub fn rollbacks(&self) -> u32 {
        self.state.lock().rollbacks
    }

    /// Times a local offer was applied while another was still active
    #[must_use]
    pub fn local_description_conflicts(&self) -> u32 {
        self.state.lock().conflicts
    }

    /// Candidates applied, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Times `close` was called
    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.state.lock().closes
    }

    /// Track ids added, in order
    #[must_use]
    pub fn added_tracks(&self) -> Vec<String> {
        self.state.lock().tracks.clone()
    }

    /// Track id currently feeding outgoing video
    #[must_use]
    pub fn video_track(&self) -> Option<String> {
        self.state.lock().video_track.clone()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.state.lock().closes > 0 {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn maybe_connect(&self, state: &mut FakeTransportState) -> bool {
        if state.has_local
            && state.has_remote
            && !state.pending_local_offer
            && !state.connected
            && self.auto_connect.load(Ordering::SeqCst)
        {
            state.connected = true;
            return true;
        }
        false
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.wait_released().await;
        self.check_open()?;
        let mut state = self.state.lock();
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 offer to {} #{}",
            self.remote, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.wait_released().await;
        self.check_open()?;
        let mut state = self.state.lock();
        if !state.has_remote {
            return Err(TransportError::Description(
                "no remote offer to answer".to_string(),
            ));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0 answer to {} #{}",
            self.remote, state.answers
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        let (candidate, connected) = {
            let mut state = self.state.lock();
            if desc.kind == SdpKind::Offer {
                if state.pending_local_offer {
                    state.conflicts += 1;
                }
                state.pending_local_offer = true;
            }
            state.has_local = true;
            state.candidates_gathered += 1;
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                    state.candidates_gathered,
                    50_000 + state.candidates_gathered
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            };
            (candidate, self.maybe_connect(&mut state))
        };
        self.emit(TransportEvent::LocalCandidate(candidate));
        if connected {
            self.emit(TransportEvent::StateChanged(TransportState::Connected));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        let connected = {
            let mut state = self.state.lock();
            if desc.kind == SdpKind::Answer {
                if !state.pending_local_offer {
                    return Err(TransportError::Description(
                        "answer without local offer".to_string(),
                    ));
                }
                state.pending_local_offer = false;
            } else if state.pending_local_offer {
                return Err(TransportError::Description(
                    "remote offer while local offer is active".to_string(),
                ));
            }
            state.has_remote = true;
            self.maybe_connect(&mut state)
        };
        if connected {
            self.emit(TransportEvent::StateChanged(TransportState::Connected));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.rollbacks += 1;
        state.pending_local_offer = false;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.state.lock();
        if !state.has_remote {
            return Err(TransportError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.tracks.push(track.id().to_string());
        if track.kind() == crate::types::MediaKind::Video {
            state.video_track = Some(track.id().to_string());
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        self.check_open()?;
        self.state.lock().video_track = Some(track.id().to_string());
        Ok(())
    }

    async fn stats(&self) -> Result<ConnectionStats, TransportError> {
        self.check_open()?;
        let (lost, received) = self.state.lock().stats;
        Ok(ConnectionStats::new(lost, received))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.lock().closes += 1;
        self.events.lock().take();
        Ok(())
    }
}

/// Factory producing [`FakeTransport`]s
#[derive(Default)]
pub struct FakeTransportFactory {
    opened: Mutex<Vec<Arc<FakeTransport>>>,
    ice_servers: Mutex<Vec<IceServer>>,
    fail_open: AtomicBool,
}

impl FakeTransportFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open` calls fail
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Every transport opened, oldest first
    #[must_use]
    pub fn opened(&self) -> Vec<Arc<FakeTransport>> {
        self.opened.lock().clone()
    }

    /// Most recent transport towards `remote`
    #[must_use]
    pub fn transport_for(&self, remote: ParticipantId) -> Option<Arc<FakeTransport>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|t| t.remote() == remote)
            .cloned()
    }

    /// Offers created across every transport
    #[must_use]
    pub fn total_offers(&self) -> u32 {
        self.opened.lock().iter().map(|t| t.offers_created()).sum()
    }

    /// ICE servers passed to the last `open`
    #[must_use]
    pub fn last_ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn open(
        &self,
        remote: ParticipantId,
        ice_servers: &[IceServer],
    ) -> Result<OpenedTransport, TransportError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Setup("fake factory set to fail".to_string()));
        }
        let (transport, events) = FakeTransport::with_events(remote);
        let transport = Arc::new(transport);
        self.opened.lock().push(Arc::clone(&transport));
        *self.ice_servers.lock() = ice_servers.to_vec();
        Ok(OpenedTransport {
            transport,
            events,
        })
    }
}

/// Capture device that counts how often it was stopped
#[derive(Debug)]
pub struct FakeCapture {
    source: TrackSource,
    live: AtomicBool,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeCapture {
    fn new(source: TrackSource) -> Self {
        Self {
            source,
            live: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        }
    }

    /// Capture source
    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Times `stop` was called
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Current enabled flag
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for FakeCapture {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Capture devices backed by [`FakeCapture`]
pub struct FakeDevices {
    captures: Mutex<Vec<Arc<FakeCapture>>>,
    failure: Mutex<Option<DeviceError>>,
    display_supported: AtomicBool,
    display_denied: AtomicBool,
    opens: AtomicU32,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self {
            captures: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            display_supported: AtomicBool::new(true),
            display_denied: AtomicBool::new(false),
            opens: AtomicU32::new(0),
        }
    }
}

impl FakeDevices {
    /// Devices that grant everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make camera/microphone capture fail
    pub fn fail_with(&self, error: Option<DeviceError>) {
        *self.failure.lock() = error;
    }

    /// Toggle display capture support
    pub fn set_display_supported(&self, supported: bool) {
        self.display_supported.store(supported, Ordering::SeqCst);
    }

    /// Make the display picker refuse
    pub fn deny_display(&self, denied: bool) {
        self.display_denied.store(denied, Ordering::SeqCst);
    }

    /// Every capture opened, oldest first
    #[must_use]
    pub fn captures(&self) -> Vec<Arc<FakeCapture>> {
        self.captures.lock().clone()
    }

    /// Captures that are still running
    #[must_use]
    pub fn live_captures(&self) -> usize {
        self.captures.lock().iter().filter(|c| c.is_live()).count()
    }

    /// Calls to `open_user_media`
    #[must_use]
    pub fn user_media_opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    fn open(&self, source: TrackSource) -> Arc<FakeCapture> {
        let capture = Arc::new(FakeCapture::new(source));
        self.captures.lock().push(Arc::clone(&capture));
        capture
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<(TrackSource, Arc<dyn CaptureDevice>)>, DeviceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(constraints
            .sources()
            .into_iter()
            .map(|source| (source, self.open(source) as Arc<dyn CaptureDevice>))
            .collect())
    }

    async fn open_camera(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Arc<dyn CaptureDevice>, DeviceError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(self.open(TrackSource::Camera))
    }

    async fn open_display(&self) -> Result<Arc<dyn CaptureDevice>, MediaError> {
        if !self.supports_display_capture() {
            return Err(MediaError::ScreenShareUnsupported);
        }
        if self.display_denied.load(Ordering::SeqCst) {
            return Err(MediaError::ScreenSharePermissionDenied);
        }
        Ok(self.open(TrackSource::Screen))
    }

    fn supports_display_capture(&self) -> bool {
        self.display_supported.load(Ordering::SeqCst)
    }
}
