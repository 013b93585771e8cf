//! Media track management
//!
//! [`MediaTrackController`] is the only owner of local capture tracks. Peer
//! links receive forwarding references and never change a track's enabled
//! state. Releasing media is synchronous so camera and microphone go dark
//! without waiting on the network.

use crate::peer_transport::PeerTransport;
use crate::types::{MediaConstraints, MediaKind, ParticipantId, TrackSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capture device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// User or platform refused access
    #[error("Permission to use the device was denied")]
    PermissionDenied,

    /// No matching device
    #[error("No capture device found")]
    NotFound,

    /// Device in use elsewhere
    #[error("Capture device is busy")]
    Busy,

    /// Constraints cannot be met
    #[error("Constraints cannot be satisfied: {0}")]
    ConstraintsUnsatisfiable(String),
}

impl DeviceError {
    /// Guidance to show the user
    #[must_use]
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Allow camera and microphone access in your browser or system settings, then rejoin."
            }
            Self::NotFound => "Connect a camera or microphone, or join with audio only.",
            Self::Busy => "Close other applications that are using the camera or microphone.",
            Self::ConstraintsUnsatisfiable(_) => {
                "Lower the requested video resolution or join with audio only."
            }
        }
    }
}

/// Media errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Capture failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Platform cannot capture the display
    #[error("Screen sharing is not supported on this platform")]
    ScreenShareUnsupported,

    /// User refused display capture
    #[error("Permission to share the screen was denied")]
    ScreenSharePermissionDenied,

    /// Operation needs acquired media
    #[error("Media has not been acquired")]
    NotAcquired,

    /// No track of that kind
    #[error("No {0:?} track")]
    TrackNotFound(MediaKind),
}

/// Handle to a running capture source
///
/// Implemented by the media engine. `stop` releases the hardware.
pub trait CaptureDevice: Send + Sync {
    /// Stop capturing and release the device
    fn stop(&self);

    /// Enable or silence the produced media without stopping capture
    fn set_enabled(&self, enabled: bool);

    /// Whether the device is still producing media
    fn is_live(&self) -> bool;

    /// Engine track backing this capture
    #[cfg(feature = "webrtc-engine")]
    fn rtc_track(
        &self,
    ) -> Option<Arc<webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample>>
    {
        None
    }
}

/// Opens capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open camera and/or microphone as requested
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<(TrackSource, Arc<dyn CaptureDevice>)>, DeviceError>;

    /// Open the camera alone
    async fn open_camera(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn CaptureDevice>, DeviceError>;

    /// Open display capture
    async fn open_display(&self) -> Result<Arc<dyn CaptureDevice>, MediaError>;

    /// Whether display capture exists on this platform
    fn supports_display_capture(&self) -> bool;
}

/// Local capture track
pub struct MediaTrack {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
    device: Arc<dyn CaptureDevice>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaTrack {
    fn new(id: String, source: TrackSource, device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            id,
            source,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            device,
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Capture source
    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Media kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    /// Whether media is flowing (not muted)
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether the track has been stopped
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || !self.device.is_live()
    }

    /// Engine device behind this track
    #[must_use]
    pub fn device(&self) -> &Arc<dyn CaptureDevice> {
        &self.device
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        self.device.set_enabled(enabled);
    }

    /// Stops the device; true only for the call that actually stopped it
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.device.stop();
        true
    }
}

/// Tracks currently owned by the controller
#[derive(Debug, Clone, Default)]
pub struct MediaTrackSet {
    /// Camera track
    pub camera: Option<Arc<MediaTrack>>,
    /// Microphone track
    pub microphone: Option<Arc<MediaTrack>>,
    /// Screen-share track while sharing
    pub screen: Option<Arc<MediaTrack>>,
}

impl MediaTrackSet {
    /// Video track currently sent to peers
    #[must_use]
    pub fn outgoing_video(&self) -> Option<&Arc<MediaTrack>> {
        self.screen.as_ref().or(self.camera.as_ref())
    }

    /// Tracks sent to peers
    #[must_use]
    pub fn outgoing(&self) -> Vec<Arc<MediaTrack>> {
        self.microphone
            .iter()
            .chain(self.outgoing_video())
            .cloned()
            .collect()
    }

    /// Whether a screen share is active
    #[must_use]
    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }
}

/// Media events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Track started
    TrackStarted {
        /// Track identifier
        track_id: String,
        /// Capture source
        source: TrackSource,
    },
    /// Track stopped
    TrackStopped {
        /// Track identifier
        track_id: String,
    },
    /// Track muted or unmuted
    TrackToggled {
        /// Track identifier
        track_id: String,
        /// New enabled flag
        enabled: bool,
    },
}

#[derive(Default)]
struct ControllerState {
    set: Option<MediaTrackSet>,
    /// Every track this controller created and has not yet stopped
    owned: Vec<Arc<MediaTrack>>,
    forwarding: HashMap<ParticipantId, Arc<dyn PeerTransport>>,
}

/// Media track controller
///
/// Owns camera, microphone and screen tracks for one session and keeps the
/// forwarding references held by peer links in step with them.
pub struct MediaTrackController {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    state: Mutex<ControllerState>,
    next_track: AtomicU64,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaTrackController {
    /// Create a controller capturing with `constraints`
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices,
            constraints,
            state: Mutex::new(ControllerState::default()),
            next_track: AtomicU64::new(0),
            event_sender,
        }
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }

    /// Current track set, if acquired
    #[must_use]
    pub fn tracks(&self) -> Option<MediaTrackSet> {
        self.state.lock().set.clone()
    }

    /// Number of tracks created and not yet stopped
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.state.lock().owned.len()
    }

    fn register(&self, source: TrackSource, device: Arc<dyn CaptureDevice>) -> Arc<MediaTrack> {
        let n = self.next_track.fetch_add(1, Ordering::Relaxed);
        let track = Arc::new(MediaTrack::new(format!("{source}-{n}"), source, device));
        tracing::info!(track_id = %track.id, %source, "Track started");
        let _ = self.event_sender.send(MediaEvent::TrackStarted {
            track_id: track.id.clone(),
            source,
        });
        track
    }

    fn stop_track(&self, track: &MediaTrack) {
        if track.stop() {
            tracing::info!(track_id = %track.id, "Track stopped");
            let _ = self.event_sender.send(MediaEvent::TrackStopped {
                track_id: track.id.clone(),
            });
        }
    }

    /// Acquire camera and microphone
    ///
    /// Returns the existing set when already acquired.
    ///
    /// # Errors
    ///
    /// Returns the device error when capture fails
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<MediaTrackSet, DeviceError> {
        if let Some(set) = self.tracks() {
            tracing::debug!("Media already acquired");
            return Ok(set);
        }

        let opened = self.devices.open_user_media(&self.constraints).await?;

        let mut state = self.state.lock();
        if let Some(set) = state.set.clone() {
            // Lost a race with a concurrent acquire: keep the first set.
            drop(state);
            for (_, device) in opened {
                device.stop();
            }
            return Ok(set);
        }

        let mut set = MediaTrackSet::default();
        for (source, device) in opened {
            let track = self.register(source, device);
            state.owned.push(Arc::clone(&track));
            match source {
                TrackSource::Camera => set.camera = Some(track),
                TrackSource::Microphone => set.microphone = Some(track),
                TrackSource::Screen => set.screen = Some(track),
            }
        }
        state.set = Some(set.clone());
        Ok(set)
    }

    /// Mute or unmute the outgoing track of `kind`
    ///
    /// Purely local; no renegotiation takes place.
    ///
    /// # Errors
    ///
    /// Returns error if no track of that kind exists
    pub fn toggle_track(&self, kind: MediaKind, enabled: bool) -> Result<(), MediaError> {
        let state = self.state.lock();
        let set = state.set.as_ref().ok_or(MediaError::NotAcquired)?;
        let track = match kind {
            MediaKind::Audio => set.microphone.as_ref(),
            MediaKind::Video => set.outgoing_video(),
        }
        .ok_or(MediaError::TrackNotFound(kind))?;

        track.set_enabled(enabled);
        tracing::debug!(track_id = %track.id, enabled, "Track toggled");
        let _ = self.event_sender.send(MediaEvent::TrackToggled {
            track_id: track.id.clone(),
            enabled,
        });
        Ok(())
    }

    /// Stop the camera hardware while keeping the rest of the call up
    pub fn release_camera(&self) {
        let state = self.state.lock();
        if let Some(camera) = state.set.as_ref().and_then(|s| s.camera.as_ref()) {
            self.stop_track(camera);
        }
    }

    /// Start forwarding local tracks to a peer transport
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects a track
    pub async fn attach_peer(
        &self,
        peer: ParticipantId,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(), crate::peer_transport::TransportError> {
        let outgoing = {
            let mut state = self.state.lock();
            state.forwarding.insert(peer, Arc::clone(&transport));
            state.set.as_ref().map(MediaTrackSet::outgoing).unwrap_or_default()
        };
        for track in outgoing {
            transport.add_track(track).await?;
        }
        tracing::debug!(%peer, "Peer attached to local media");
        Ok(())
    }

    /// Drop the forwarding reference held for a peer
    pub fn detach_peer(&self, peer: ParticipantId) {
        if self.state.lock().forwarding.remove(&peer).is_some() {
            tracing::debug!(%peer, "Peer detached from local media");
        }
    }

    /// Number of peers currently forwarding local media
    #[must_use]
    pub fn forwarding_count(&self) -> usize {
        self.state.lock().forwarding.len()
    }

    fn forwarding_targets(&self) -> Vec<(ParticipantId, Arc<dyn PeerTransport>)> {
        self.state
            .lock()
            .forwarding
            .iter()
            .map(|(peer, transport)| (*peer, Arc::clone(transport)))
            .collect()
    }

    async fn substitute_video(&self, track: &Arc<MediaTrack>) {
        for (peer, transport) in self.forwarding_targets() {
            if let Err(e) = transport.replace_video_track(Arc::clone(track)).await {
                tracing::warn!(%peer, track_id = %track.id, error = %e, "Video substitution failed");
            }
        }
    }

    /// Replace the outgoing video on every peer with a display capture
    ///
    /// The camera track is kept for rollback.
    ///
    /// # Errors
    ///
    /// Returns error if display capture is unsupported or refused
    #[tracing::instrument(skip(self))]
    pub async fn start_screen_share(&self) -> Result<Arc<MediaTrack>, MediaError> {
        {
            let state = self.state.lock();
            let set = state.set.as_ref().ok_or(MediaError::NotAcquired)?;
            if let Some(screen) = &set.screen {
                return Ok(Arc::clone(screen));
            }
        }
        if !self.devices.supports_display_capture() {
            return Err(MediaError::ScreenShareUnsupported);
        }

        let device = self.devices.open_display().await?;
        let track = self.register(TrackSource::Screen, device);
        {
            let mut state = self.state.lock();
            state.owned.push(Arc::clone(&track));
            match state.set.as_mut() {
                Some(set) => set.screen = Some(Arc::clone(&track)),
                None => {
                    // Released while the picker was open.
                    drop(state);
                    self.stop_track(&track);
                    return Err(MediaError::NotAcquired);
                }
            }
        }

        self.substitute_video(&track).await;
        tracing::info!(track_id = %track.id, "Screen share started");
        Ok(track)
    }

    /// Restore the camera on every peer
    ///
    /// Re-acquires the camera if it was stopped during the share.
    ///
    /// # Errors
    ///
    /// Returns error if the camera must be re-acquired and that fails
    #[tracing::instrument(skip(self))]
    pub async fn stop_screen_share(&self) -> Result<(), MediaError> {
        let (screen, camera) = {
            let mut state = self.state.lock();
            let set = state.set.as_mut().ok_or(MediaError::NotAcquired)?;
            let Some(screen) = set.screen.take() else {
                return Ok(());
            };
            (screen, set.camera.clone())
        };
        self.stop_track(&screen);
        self.prune_stopped();

        let camera = match camera {
            Some(camera) if !camera.is_stopped() => Some(camera),
            _ if self.constraints.has_video() => {
                let device = self.devices.open_camera(&self.constraints).await?;
                let camera = self.register(TrackSource::Camera, device);
                let mut state = self.state.lock();
                let ControllerState { set, owned, .. } = &mut *state;
                if let Some(set) = set.as_mut() {
                    set.camera = Some(Arc::clone(&camera));
                    owned.push(Arc::clone(&camera));
                    Some(camera)
                } else {
                    drop(state);
                    self.stop_track(&camera);
                    return Err(MediaError::NotAcquired);
                }
            }
            _ => None,
        };

        if let Some(camera) = camera {
            self.substitute_video(&camera).await;
        }
        tracing::info!("Screen share stopped");
        Ok(())
    }

    fn prune_stopped(&self) {
        self.state.lock().owned.retain(|t| !t.stopped.load(Ordering::Acquire));
    }

    /// Stop every owned track and clear all forwarding references
    ///
    /// Synchronous and idempotent. Returns how many tracks this call stopped.
    pub fn release_all(&self) -> usize {
        let (owned, forwarding) = {
            let mut state = self.state.lock();
            state.set = None;
            (
                std::mem::take(&mut state.owned),
                std::mem::take(&mut state.forwarding),
            )
        };

        let mut stopped = 0;
        for track in &owned {
            if track.stop() {
                stopped += 1;
                let _ = self.event_sender.send(MediaEvent::TrackStopped {
                    track_id: track.id.clone(),
                });
            }
        }
        if stopped > 0 || !forwarding.is_empty() {
            tracing::info!(
                stopped,
                peers = forwarding.len(),
                "Released all local media"
            );
        }
        stopped
    }
}

impl Drop for MediaTrackController {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevices, FakeTransport};
    use pretty_assertions::assert_eq;

    fn controller(devices: &Arc<FakeDevices>) -> MediaTrackController {
        MediaTrackController::new(
            Arc::clone(devices) as Arc<dyn MediaDevices>,
            MediaConstraints::video_call(),
        )
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let devices = Arc::new(FakeDevices::new());
        let media = controller(&devices);
        let first = media.acquire().await.unwrap();
        let second = media.acquire().await.unwrap();

        assert_eq!(devices.user_media_opens(), 1);
        assert_eq!(
            first.microphone.unwrap().id(),
            second.microphone.unwrap().id()
        );
        assert_eq!(media.live_track_count(), 2);
    }

    #[tokio::test]
    async fn test_device_error_surfaces_with_remediation() {
        let devices = Arc::new(FakeDevices::new());
        devices.fail_with(Some(DeviceError::Busy));
        let media = controller(&devices);

        let err = media.acquire().await.unwrap_err();
        assert_eq!(err, DeviceError::Busy);
        assert!(!err.remediation().is_empty());
        assert!(media.tracks().is_none());
    }

    #[tokio::test]
    async fn test_toggle_is_local() {
        let devices = Arc::new(FakeDevices::new());
        let media = controller(&devices);
        assert_eq!(
            media.toggle_track(MediaKind::Audio, false),
            Err(MediaError::NotAcquired)
        );

        media.acquire().await.unwrap();
        media.toggle_track(MediaKind::Audio, false).unwrap();
        let set = media.tracks().unwrap();
        assert!(!set.microphone.unwrap().is_enabled());
        assert!(set.camera.unwrap().is_enabled());
        let mic = devices
            .captures()
            .into_iter()
            .find(|c| c.source() == TrackSource::Microphone)
            .unwrap();
        assert!(!mic.is_enabled());
        assert_eq!(mic.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_screen_share_substitutes_and_restores_camera() {
        let devices = Arc::new(FakeDevices::new());
        let media = controller(&devices);
        media.acquire().await.unwrap();
        let transport = Arc::new(FakeTransport::new(ParticipantId(2)));
        media
            .attach_peer(ParticipantId(2), Arc::clone(&transport) as Arc<dyn PeerTransport>)
            .await
            .unwrap();
        let camera_id = media.tracks().unwrap().camera.unwrap().id().to_string();
        assert_eq!(transport.video_track(), Some(camera_id.clone()));

        let screen = media.start_screen_share().await.unwrap();
        assert_eq!(transport.video_track(), Some(screen.id().to_string()));
        assert!(media.tracks().unwrap().is_sharing_screen());

        media.stop_screen_share().await.unwrap();
        assert!(screen.is_stopped());
        assert_eq!(transport.video_track(), Some(camera_id));
        assert!(!media.tracks().unwrap().is_sharing_screen());
    }

    #[tokio::test]
    async fn test_stop_share_reacquires_released_camera() {
        let devices = Arc::new(FakeDevices::new());
        let media = controller(&devices);
        media.acquire().await.unwrap();
        let old_camera = media.tracks().unwrap().camera.unwrap();

        media.start_screen_share().await.unwrap();
        media.release_camera();
        assert!(old_camera.is_stopped());

        media.stop_screen_share().await.unwrap();
        let camera = media.tracks().unwrap().camera.unwrap();
        assert_ne!(camera.id(), old_camera.id());
        assert!(!camera.is_stopped());
        assert_eq!(media.live_track_count(), 2);
    }

    #[tokio::test]
    async fn test_screen_share_unsupported_and_denied() {
        let devices = Arc::new(FakeDevices::new());
        let media = controller(&devices);
        media.acquire().await.unwrap();

        devices.set_display_supported(false);
        assert_eq!(
            media.start_screen_share().await.unwrap_err(),
            MediaError::ScreenShareUnsupported
        );

        devices.set_display_supported(true);
        devices.deny_display(true);
        assert_eq!(
            media.start_screen_share().await.unwrap_err(),
            MediaError::ScreenSharePermissionDenied
        );
        assert!(!media.tracks().unwrap().is_sharing_screen());
    }

    #[tokio::test]
    async fn test_release_all_stops_each_device_once() {
        let devices = Arc::new(FakeDevices::new());
        let media = controller(&devices);
        media.acquire().await.unwrap();
        media.start_screen_share().await.unwrap();

        assert_eq!(media.release_all(), 3);
        assert_eq!(media.release_all(), 0);
        drop(media);

        assert_eq!(devices.live_captures(), 0);
        assert!(devices.captures().iter().all(|c| c.stop_calls() == 1));
    }
}
