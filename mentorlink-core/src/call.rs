//! Call session management
//!
//! A [`CallSession`] owns the roster, one [`PeerLink`] per remote
//! participant and the local media for one call. A single event pump task
//! applies relay events in arrival order; each peer link runs its own actor.
//! Every termination path funnels into one guarded teardown.

use crate::api::{resolve_ice_servers, ApiError, CallApi, CallRequest, CallSummary};
use crate::config::CallConfig;
use crate::media::{DeviceError, MediaDevices, MediaError, MediaTrackController, MediaTrackSet};
use crate::monitor::{ConnectionMonitor, StatsSource};
use crate::negotiation::{LinkReport, PeerLink, PeerLinkHandle};
use crate::peer_transport::{PeerTransport, TransportError, TransportFactory};
use crate::signaling::{
    ChannelEvent, NegotiationPayload, RoomEvent, SignalingChannel, SignalingError,
    SignalingHandler, SignalingMessage,
};
use crate::supervisor::{reconnect_with_backoff, CleanupSupervisor, PresenceWatch, Teardown, TeardownGuard};
use crate::types::{
    CallEvent, CallId, EndReason, IceServer, MediaKind, NegotiationState, Participant,
    ParticipantId, ParticipantInfo, SessionId, SessionSnapshot, SessionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Transport could not be created
    #[error("Transport to {peer} could not be opened: {source}")]
    Open {
        /// Remote peer
        peer: ParticipantId,
        /// Engine error
        source: TransportError,
    },

    /// ICE failed or timed out
    #[error("ICE connectivity to {0} failed")]
    IceFailed(ParticipantId),
}

/// Call session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Camera or microphone unavailable; fatal to session start
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Media operation failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Relay unreachable
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Peer connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// REST collaborator failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Relay did not confirm membership in time
    #[error("Timed out waiting for the relay to confirm room membership")]
    JoinTimeout,

    /// Session already ended
    #[error("Call session has ended")]
    Ended,

    /// Operation needs a different session status
    #[error("Operation not valid while {0:?}")]
    InvalidState(SessionStatus),

    /// Unknown participant
    #[error("Participant not found: {0}")]
    ParticipantNotFound(ParticipantId),

    /// Session was not created through the call API
    #[error("Session has no call context")]
    NoCallContext,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

struct LinkEntry {
    handle: PeerLinkHandle,
    connected: bool,
    failed: bool,
}

#[derive(Default)]
struct SessionState {
    roster: BTreeMap<ParticipantId, Participant>,
    links: HashMap<ParticipantId, LinkEntry>,
    started_at: Option<DateTime<Utc>>,
    final_duration: Option<chrono::Duration>,
}

struct PumpInputs {
    reports: mpsc::UnboundedReceiver<LinkReport>,
    expired: mpsc::UnboundedReceiver<ParticipantId>,
}

struct SessionInner {
    session_id: SessionId,
    local: ParticipantInfo,
    config: CallConfig,
    ice_servers: Vec<IceServer>,
    signaling: Arc<SignalingHandler>,
    factory: Arc<dyn TransportFactory>,
    media: Arc<MediaTrackController>,
    call: Option<(CallId, Arc<dyn CallApi>)>,
    state: Mutex<SessionState>,
    guard: TeardownGuard,
    presence: PresenceWatch,
    events: broadcast::Sender<CallEvent>,
    status: watch::Sender<SessionStatus>,
    shutdown: watch::Sender<bool>,
    reports: mpsc::UnboundedSender<LinkReport>,
    pump_inputs: Mutex<Option<PumpInputs>>,
}

/// Handle to a call session
///
/// Cheap to clone. Dropping the last handle without calling
/// [`CallSession::end`] still releases camera and microphone synchronously.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    /// Start building a session
    #[must_use]
    pub fn builder(
        local: ParticipantInfo,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> CallSessionBuilder {
        CallSessionBuilder::new(local, signaling, factory, devices)
    }

    /// Relay room of this session
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Local participant
    #[must_use]
    pub fn local(&self) -> &ParticipantInfo {
        &self.inner.local
    }

    /// Call id, when started through the call API
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        self.inner.call.as_ref().map(|(id, _)| *id)
    }

    /// ICE servers handed to every transport
    #[must_use]
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.inner.ice_servers
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the session status
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Media controller of this session
    #[must_use]
    pub fn media(&self) -> &Arc<MediaTrackController> {
        &self.inner.media
    }

    /// Local tracks, if acquired
    #[must_use]
    pub fn tracks(&self) -> Option<MediaTrackSet> {
        self.inner.media.tracks()
    }

    /// Peer link for a remote participant
    #[must_use]
    pub fn link(&self, peer: ParticipantId) -> Option<Arc<PeerLink>> {
        self.inner
            .state
            .lock()
            .links
            .get(&peer)
            .map(|entry| Arc::clone(entry.handle.link()))
    }

    /// Negotiation state of the link to `peer`
    #[must_use]
    pub fn peer_state(&self, peer: ParticipantId) -> Option<NegotiationState> {
        self.link(peer).map(|link| link.state())
    }

    /// Number of live peer links
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.inner.state.lock().links.len()
    }

    /// Malformed signaling frames dropped so far
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.inner.signaling.dropped_messages()
    }

    /// Point-in-time view of roster and status
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state.lock();
        SessionSnapshot {
            session_id: self.inner.session_id.clone(),
            participants: state.roster.values().cloned().collect(),
            status: self.status(),
            started_at: state.started_at,
            duration: SessionInner::duration(&state),
        }
    }

    /// Acquire media, join the relay room and wait for confirmation
    ///
    /// Repeated calls register the local participant only once.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Device`] if capture fails, a signaling error if
    /// the relay is unreachable, or [`CallError::JoinTimeout`]
    #[tracing::instrument(skip(self), fields(session_id = %self.inner.session_id, participant = %self.inner.local.id))]
    pub async fn join(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        if inner.guard.is_triggered() {
            return Err(CallError::Ended);
        }
        let registered = {
            let mut state = inner.state.lock();
            if state.roster.contains_key(&inner.local.id) {
                false
            } else {
                state
                    .roster
                    .insert(inner.local.id, Participant::from(inner.local.clone()));
                true
            }
        };
        if !registered {
            tracing::debug!("Local participant already registered");
            return self.wait_connected().await;
        }

        if let Err(e) = inner.media.acquire().await {
            tracing::warn!(error = %e, remediation = e.remediation(), "Media acquisition failed");
            inner.state.lock().roster.remove(&inner.local.id);
            return Err(e.into());
        }

        if let Err(e) = inner
            .signaling
            .channel()
            .join_room(&inner.session_id, &inner.local)
            .await
        {
            tracing::warn!(error = %e, "Could not join relay room");
            self.abandon_join();
            return Err(e.into());
        }
        self.start_pump();
        match self.wait_connected().await {
            Err(CallError::JoinTimeout) => {
                tracing::warn!("Relay never confirmed the room, abandoning join");
                self.abandon_join();
                let leave = inner.signaling.channel().leave_room(&inner.session_id);
                match tokio::time::timeout(inner.config.supervisor.teardown_timeout(), leave).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(error = %e, "Could not leave unconfirmed room"),
                    Err(_) => tracing::debug!("Timed out leaving unconfirmed room"),
                }
                Err(CallError::JoinTimeout)
            }
            other => other,
        }
    }

    /// Undo the local side of a join that did not complete
    fn abandon_join(&self) {
        self.inner.state.lock().roster.remove(&self.inner.local.id);
        self.inner.media.release_all();
    }

    async fn wait_connected(&self) -> Result<(), CallError> {
        let mut status = self.inner.status.subscribe();
        let timeout = self.inner.config.supervisor.join_timeout();
        let reached = tokio::time::timeout(timeout, async {
            status
                .wait_for(|s| *s != SessionStatus::Connecting)
                .await
                .map(|s| *s)
        })
        .await;
        match reached {
            Ok(Ok(SessionStatus::Connected)) => Ok(()),
            Ok(_) => Err(CallError::Ended),
            Err(_) => Err(CallError::JoinTimeout),
        }
    }

    fn start_pump(&self) {
        let Some(inputs) = self.inner.pump_inputs.lock().take() else {
            return;
        };
        tokio::spawn(run_pump(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.signaling),
            inputs,
            self.inner.shutdown.subscribe(),
        ));
    }

    /// End the session
    ///
    /// Idempotent. The first call runs the teardown; later calls wait for it
    /// to finish. Returns true for the call that performed the teardown.
    pub async fn end(&self, reason: EndReason) -> bool {
        if self.inner.teardown(reason).await {
            return true;
        }
        let mut status = self.inner.status.subscribe();
        let _ = status.wait_for(|s| *s == SessionStatus::Ended).await;
        false
    }

    /// Leave the call (local hang-up)
    pub async fn leave(&self) -> bool {
        self.end(EndReason::LocalHangup).await
    }

    /// End the session when the host process is interrupted
    pub fn end_on_host_exit(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let target: Weak<dyn Teardown> = weak;
        CleanupSupervisor::watch_host_exit(target)
    }

    /// Mute or unmute local audio or video
    ///
    /// # Errors
    ///
    /// Returns error if no such track exists
    pub fn toggle_track(&self, kind: MediaKind, enabled: bool) -> Result<(), CallError> {
        self.inner.media.toggle_track(kind, enabled)?;
        Ok(())
    }

    /// Stop the camera hardware, keeping the call up
    pub fn release_camera(&self) {
        self.inner.media.release_camera();
    }

    /// Send a screen capture instead of the camera to every peer
    ///
    /// # Errors
    ///
    /// Returns error if display capture is unsupported or refused
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.ensure_active()?;
        self.inner.media.start_screen_share().await?;
        let _ = self.inner.events.send(CallEvent::ScreenShareStarted);
        Ok(())
    }

    /// Restore the camera on every peer
    ///
    /// # Errors
    ///
    /// Returns error if the camera has to be re-acquired and that fails
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.ensure_active()?;
        let sharing = self
            .inner
            .media
            .tracks()
            .is_some_and(|set| set.is_sharing_screen());
        self.inner.media.stop_screen_share().await?;
        if sharing {
            let _ = self.inner.events.send(CallEvent::ScreenShareStopped);
        }
        Ok(())
    }

    /// Rebuild the link to a failed peer and offer again
    ///
    /// # Errors
    ///
    /// Returns error if the peer is unknown or the transport cannot be opened
    #[tracing::instrument(skip(self), fields(session_id = %self.inner.session_id))]
    pub async fn retry_peer(&self, peer: ParticipantId) -> Result<(), CallError> {
        self.ensure_active()?;
        let old = {
            let mut state = self.inner.state.lock();
            if peer == self.inner.local.id || !state.roster.contains_key(&peer) {
                return Err(CallError::ParticipantNotFound(peer));
            }
            state.links.remove(&peer)
        };
        if let Some(old) = old {
            old.handle.close().await;
        }
        self.inner.media.detach_peer(peer);
        tracing::info!(%peer, "Retrying peer connection");
        self.inner.open_link(peer, true).await
    }

    /// Post the end-of-call summary
    ///
    /// # Errors
    ///
    /// Returns error if the session has not ended, was not started through
    /// the call API, or the endpoint fails
    pub async fn submit_summary(
        &self,
        rating: Option<u8>,
        notes: Option<String>,
    ) -> Result<(), CallError> {
        let status = self.status();
        if status != SessionStatus::Ended {
            return Err(CallError::InvalidState(status));
        }
        let (call_id, api) = self.inner.call.clone().ok_or(CallError::NoCallContext)?;
        let duration = SessionInner::duration(&self.inner.state.lock());
        let summary = CallSummary {
            duration: u64::try_from(duration.num_seconds()).unwrap_or(0),
            rating,
            notes,
        };
        api.submit_summary(call_id, &summary).await?;
        tracing::info!(%call_id, duration = summary.duration, "Call summary submitted");
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), CallError> {
        if self.inner.guard.is_triggered() {
            Err(CallError::Ended)
        } else {
            Ok(())
        }
    }
}

impl SessionInner {
    fn duration(state: &SessionState) -> chrono::Duration {
        state.final_duration.unwrap_or_else(|| {
            state
                .started_at
                .map_or_else(chrono::Duration::zero, |started| Utc::now() - started)
        })
    }

    fn set_status(&self, to: SessionStatus) -> bool {
        let mut from = None;
        self.status.send_if_modified(|current| {
            if *current >= to {
                return false;
            }
            from = Some(*current);
            *current = to;
            true
        });
        match from {
            Some(from) => {
                tracing::info!(session_id = %self.session_id, ?from, ?to, "Session status changed");
                let _ = self.events.send(CallEvent::StatusChanged { from, to });
                true
            }
            None => false,
        }
    }

    async fn handle_channel_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::Negotiation(message) => self.route_negotiation(message).await,
            ChannelEvent::Room(RoomEvent::ParticipantJoined {
                session_id,
                participant,
            }) if session_id == self.session_id => {
                if participant.id == self.local.id {
                    tracing::debug!("Ignoring join event for local participant");
                } else {
                    self.add_remote(participant).await;
                }
            }
            ChannelEvent::Room(RoomEvent::ParticipantLeft {
                session_id,
                participant_id,
            }) if session_id == self.session_id => {
                self.remove_remote(participant_id, false).await;
            }
            ChannelEvent::RoomJoined {
                session_id,
                participants,
            } if session_id == self.session_id => self.room_joined(participants).await,
            ChannelEvent::PresenceLost {
                session_id,
                participant_id,
            } if session_id == self.session_id => {
                if self.state.lock().roster.contains_key(&participant_id) {
                    tracing::info!(peer = %participant_id, "Peer lost its relay connection");
                    self.presence.arm(participant_id);
                }
            }
            ChannelEvent::PresenceRestored {
                session_id,
                participant_id,
            } if session_id == self.session_id => {
                if self.presence.disarm(participant_id) {
                    tracing::info!(peer = %participant_id, "Peer relay connection restored");
                }
            }
            ChannelEvent::Disconnected => self.signaling_lost().await,
            other => {
                tracing::warn!(kind = other.kind(), "Dropping event for another session");
            }
        }
    }

    async fn room_joined(self: &Arc<Self>, participants: Vec<ParticipantInfo>) {
        let rejoin = *self.status.borrow() == SessionStatus::Connected;
        if !rejoin {
            if !self.state.lock().roster.contains_key(&self.local.id) {
                tracing::debug!("Room confirmation for an abandoned join");
                return;
            }
            self.state.lock().started_at = Some(Utc::now());
            if !self.set_status(SessionStatus::Connected) {
                return;
            }
            if self.config.monitor.enabled {
                let weak = Arc::downgrade(self);
                let source: Weak<dyn StatsSource> = weak;
                ConnectionMonitor::spawn(
                    &self.config.monitor,
                    source,
                    self.events.clone(),
                    self.shutdown.subscribe(),
                );
            }
        } else {
            // Members that left while we were away get a synthesized leave.
            let gone: Vec<ParticipantId> = self
                .state
                .lock()
                .roster
                .keys()
                .filter(|id| **id != self.local.id && !participants.iter().any(|p| p.id == **id))
                .copied()
                .collect();
            for peer in gone {
                self.remove_remote(peer, true).await;
            }
        }
        for participant in participants {
            if participant.id != self.local.id {
                self.add_remote(participant).await;
            }
        }
        if rejoin {
            // Sends that failed while the channel was down are replayed now.
            for entry in self.state.lock().links.values() {
                entry.handle.resume();
            }
        }
    }

    async fn route_negotiation(self: &Arc<Self>, message: SignalingMessage) {
        if message.session_id != self.session_id
            || message.from == self.local.id
            || message.to.is_some_and(|to| to != self.local.id)
        {
            tracing::warn!(
                from = %message.from,
                message_type = %message.message_type(),
                "Dropping misaddressed negotiation message"
            );
            return;
        }
        let peer = message.from;
        let known = self.state.lock().links.contains_key(&peer);
        if !known {
            match message.payload {
                NegotiationPayload::Offer(_) => {
                    // Answer the offer we were sent rather than racing it with our own.
                    self.admit(ParticipantInfo::unknown(peer), false).await;
                }
                _ => {
                    tracing::debug!(%peer, message_type = %message.message_type(), "No link for sender");
                    return;
                }
            }
        }
        if let Some(entry) = self.state.lock().links.get(&peer) {
            entry.handle.deliver(message.payload);
        }
    }

    async fn add_remote(self: &Arc<Self>, info: ParticipantInfo) {
        let initiate = self.local.id.initiates_with(info.id);
        self.admit(info, initiate).await;
    }

    async fn admit(self: &Arc<Self>, info: ParticipantInfo, initiate: bool) {
        if self.guard.is_triggered() {
            return;
        }
        let peer = info.id;
        let is_new = {
            let mut state = self.state.lock();
            if state.links.contains_key(&peer) {
                return;
            }
            let is_new = !state.roster.contains_key(&peer);
            if is_new {
                state.roster.insert(peer, Participant::from(info.clone()));
            }
            is_new
        };
        if is_new {
            tracing::info!(%peer, name = %info.display_name, "Participant joined");
            let _ = self
                .events
                .send(CallEvent::ParticipantJoined { participant: info });
        }

        if let Err(e) = self.open_link(peer, initiate).await {
            tracing::warn!(%peer, error = %e, "Could not create peer link");
            let _ = self.events.send(CallEvent::ConnectionFailed {
                peer,
                error: e.to_string(),
            });
        }
    }

    async fn open_link(&self, peer: ParticipantId, offer: bool) -> Result<(), CallError> {
        let opened = self
            .factory
            .open(peer, &self.ice_servers)
            .await
            .map_err(|source| ConnectionError::Open { peer, source })?;
        let link = Arc::new(PeerLink::new(
            self.session_id.clone(),
            self.local.id,
            peer,
            Arc::clone(&opened.transport),
            Arc::clone(&self.signaling),
            self.events.clone(),
        ));
        if let Err(e) = self.media.attach_peer(peer, opened.transport).await {
            tracing::warn!(%peer, error = %e, "Local media not forwarded to peer");
        }

        let handle = PeerLinkHandle::spawn(link, opened.events, self.reports.clone());
        if offer {
            tracing::debug!(%peer, "Local side initiates negotiation");
            handle.create_offer();
        }

        let (rejected, replaced) = {
            let mut state = self.state.lock();
            if self.guard.is_triggered() {
                (Some(handle), None)
            } else {
                let entry = LinkEntry {
                    handle,
                    connected: false,
                    failed: false,
                };
                (None, state.links.insert(peer, entry))
            }
        };
        if let Some(handle) = rejected {
            handle.close().await;
            return Err(CallError::Ended);
        }
        if let Some(old) = replaced {
            old.handle.close().await;
        }
        Ok(())
    }

    async fn remove_remote(&self, peer: ParticipantId, synthesized: bool) {
        if peer == self.local.id {
            return;
        }
        let (entry, was_member) = {
            let mut state = self.state.lock();
            (
                state.links.remove(&peer),
                state.roster.remove(&peer).is_some(),
            )
        };
        self.presence.disarm(peer);
        self.media.detach_peer(peer);
        if let Some(entry) = entry {
            entry.handle.close().await;
        }
        if was_member {
            tracing::info!(%peer, synthesized, "Participant left");
            let _ = self.events.send(CallEvent::ParticipantLeft {
                participant_id: peer,
                synthesized,
            });
        }
    }

    async fn handle_report(self: &Arc<Self>, report: LinkReport) {
        match report {
            LinkReport::Connected(peer) => {
                let known = match self.state.lock().links.get_mut(&peer) {
                    Some(entry) => {
                        entry.connected = true;
                        entry.failed = false;
                        true
                    }
                    None => false,
                };
                if known {
                    tracing::info!(%peer, "Peer connected");
                    let _ = self.events.send(CallEvent::PeerConnected { peer });
                }
            }
            LinkReport::Failed(peer, reason) => {
                let all_failed = {
                    let mut state = self.state.lock();
                    let Some(entry) = state.links.get_mut(&peer) else {
                        return;
                    };
                    entry.failed = true;
                    entry.connected = false;
                    state.links.values().all(|e| e.failed)
                };
                let error = ConnectionError::IceFailed(peer);
                tracing::warn!(%peer, %reason, "Peer connection failed");
                let _ = self.events.send(CallEvent::ConnectionFailed {
                    peer,
                    error: error.to_string(),
                });
                if all_failed && self.config.supervisor.end_on_transport_failure {
                    self.teardown(EndReason::TransportFailed).await;
                }
            }
        }
    }

    async fn signaling_lost(self: &Arc<Self>) {
        if self.guard.is_triggered() {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        let channel = self.signaling.channel();
        let rejoined = match reconnect_with_backoff(
            channel,
            &self.config.supervisor.reconnect,
            &mut shutdown,
        )
        .await
        {
            Ok(_) => channel.join_room(&self.session_id, &self.local).await,
            Err(e) => Err(e),
        };
        if let Err(e) = rejoined {
            tracing::warn!(error = %e, "Signaling could not be re-established");
            self.teardown(EndReason::SignalingLost).await;
        }
    }
}

#[async_trait]
impl Teardown for SessionInner {
    async fn teardown(&self, reason: EndReason) -> bool {
        if !self.guard.try_begin() {
            tracing::debug!(?reason, "Teardown already triggered");
            return false;
        }
        tracing::info!(session_id = %self.session_id, ?reason, "Ending call session");
        self.set_status(SessionStatus::Ending);

        // Local media first: never wait on the network for the camera to go dark.
        self.media.release_all();

        let timeout = self.config.supervisor.teardown_timeout();
        match tokio::time::timeout(timeout, self.signaling.channel().leave_room(&self.session_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Could not notify peers of departure"),
            Err(_) => tracing::warn!("Timed out notifying peers of departure"),
        }

        let links: Vec<LinkEntry> = self.state.lock().links.drain().map(|(_, e)| e).collect();
        futures::future::join_all(links.iter().map(|entry| entry.handle.close())).await;
        self.presence.disarm_all();

        self.shutdown.send_replace(true);

        let duration = {
            let mut state = self.state.lock();
            let duration = Self::duration(&state);
            state.final_duration = Some(duration);
            state.roster.clear();
            duration
        };
        self.set_status(SessionStatus::Ended);
        let _ = self.events.send(CallEvent::Ended { reason, duration });
        self.guard.finish();
        true
    }
}

impl StatsSource for SessionInner {
    fn connected_transports(&self) -> Vec<(ParticipantId, Arc<dyn PeerTransport>)> {
        self.state
            .lock()
            .links
            .iter()
            .filter(|(_, entry)| entry.connected && !entry.handle.link().is_closed())
            .map(|(peer, entry)| (*peer, Arc::clone(entry.handle.link().transport())))
            .collect()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.guard.try_begin() {
            return;
        }
        tracing::info!(session_id = %self.session_id, "Session dropped without end, releasing media");
        self.media.release_all();
        let state = self.state.get_mut();
        let runtime = tokio::runtime::Handle::try_current().ok();
        for (_, entry) in state.links.drain() {
            entry.handle.abort();
            if let Some(runtime) = &runtime {
                let transport = Arc::clone(entry.handle.link().transport());
                runtime.spawn(async move {
                    let _ = transport.close().await;
                });
            }
        }
        self.presence.disarm_all();
        self.shutdown.send_replace(true);
        let duration = Self::duration(state);
        state.roster.clear();
        self.set_status(SessionStatus::Ended);
        let _ = self.events.send(CallEvent::Ended {
            reason: EndReason::Dropped,
            duration,
        });
        self.guard.finish();
    }
}

enum PumpStep {
    Channel(Result<ChannelEvent, SignalingError>),
    Report(LinkReport),
    PresenceExpired(ParticipantId),
}

async fn run_pump(
    session: Weak<SessionInner>,
    signaling: Arc<SignalingHandler>,
    mut inputs: PumpInputs,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let step = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            Some(report) = inputs.reports.recv() => PumpStep::Report(report),
            Some(peer) = inputs.expired.recv() => PumpStep::PresenceExpired(peer),
            event = signaling.receive_event() => PumpStep::Channel(event),
        };
        let Some(inner) = session.upgrade() else {
            break;
        };
        match step {
            PumpStep::Channel(Ok(event)) => inner.handle_channel_event(event).await,
            PumpStep::Channel(Err(e)) => {
                tracing::warn!(error = %e, "Signaling channel failed");
                inner.signaling_lost().await;
            }
            PumpStep::Report(report) => inner.handle_report(report).await,
            PumpStep::PresenceExpired(peer) => {
                tracing::info!(%peer, "Peer did not return, synthesizing leave");
                inner.remove_remote(peer, true).await;
            }
        }
    }
    tracing::trace!("Session event pump stopped");
}

/// Builder for [`CallSession`]
pub struct CallSessionBuilder {
    local: ParticipantInfo,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn TransportFactory>,
    devices: Arc<dyn MediaDevices>,
    config: CallConfig,
    session_id: Option<SessionId>,
    ice_servers: Option<Vec<IceServer>>,
    call: Option<(CallId, Arc<dyn CallApi>)>,
}

impl CallSessionBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(
        local: ParticipantInfo,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            local,
            signaling,
            factory,
            devices,
            config: CallConfig::default(),
            session_id: None,
            ice_servers: None,
            call: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the relay room
    #[must_use]
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Use these ICE servers instead of the configured ones
    #[must_use]
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.ice_servers = Some(ice_servers);
        self
    }

    /// Build the session without joining
    ///
    /// # Errors
    ///
    /// Returns error if no session id was set or the configuration has errors
    pub fn build(self) -> Result<CallSession, CallError> {
        let session_id = self
            .session_id
            .ok_or_else(|| CallError::Config("session id not set".to_string()))?;
        if let Err(issues) = self.config.validate() {
            for issue in issues.iter().filter(|i| i.starts_with("WARN:")) {
                tracing::warn!("{issue}");
            }
            let errors: Vec<String> = issues.into_iter().filter(|i| i.starts_with("ERROR:")).collect();
            if !errors.is_empty() {
                return Err(CallError::Config(errors.join("; ")));
            }
        }

        let ice_servers = self.ice_servers.unwrap_or_else(|| {
            if self.config.ice_servers.is_empty() {
                IceServer::public_stun()
            } else {
                self.config.ice_servers.clone()
            }
        });
        let (events, _) = broadcast::channel(100);
        let (status, _) = watch::channel(SessionStatus::Connecting);
        let (shutdown, _) = watch::channel(false);
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let media = Arc::new(MediaTrackController::new(
            self.devices,
            self.config.media.clone(),
        ));

        let inner = SessionInner {
            presence: PresenceWatch::new(self.config.supervisor.presence_timeout(), expired_tx),
            session_id,
            local: self.local,
            ice_servers,
            signaling: Arc::new(SignalingHandler::new(self.signaling)),
            factory: self.factory,
            media,
            call: self.call,
            config: self.config,
            state: Mutex::new(SessionState::default()),
            guard: TeardownGuard::new(),
            events,
            status,
            shutdown,
            reports,
            pump_inputs: Mutex::new(Some(PumpInputs {
                reports: reports_rx,
                expired: expired_rx,
            })),
        };
        tracing::debug!(session_id = %inner.session_id, participant = %inner.local.id, "Call session created");
        Ok(CallSession {
            inner: Arc::new(inner),
        })
    }

    /// Create a call through the API, then build and join its session
    ///
    /// The session id is derived from the returned call id. ICE servers come
    /// from the API, else the configured list, else public STUN.
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be created or joining fails
    #[tracing::instrument(skip(self, api, request), fields(participant = %self.local.id))]
    pub async fn start(
        mut self,
        api: Arc<dyn CallApi>,
        request: &CallRequest,
    ) -> Result<CallSession, CallError> {
        let context = api.create_call(request).await?;
        tracing::info!(call_id = %context.call_id, participants = context.participants.len(), "Call created");
        self.session_id = Some(SessionId::for_call(context.call_id));
        if self.ice_servers.is_none() {
            self.ice_servers =
                Some(resolve_ice_servers(Some(api.as_ref()), &self.config.ice_servers).await);
        }
        self.call = Some((context.call_id, api));
        let session = self.build()?;
        session.join().await?;
        Ok(session)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use crate::testing::{FakeDevices, FakeTransportFactory};
    use crate::types::Role;

    fn session(relay: &MemoryRelay, devices: Arc<FakeDevices>) -> CallSession {
        let local = ParticipantInfo::new(1, "Ada", Role::Mentor);
        CallSession::builder(
            local.clone(),
            relay.connect(local),
            Arc::new(FakeTransportFactory::new()),
            devices,
        )
        .with_session_id(SessionId::new("call-unit"))
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_session_id() {
        let relay = MemoryRelay::new();
        let local = ParticipantInfo::new(1, "Ada", Role::Mentor);
        let result = CallSession::builder(
            local.clone(),
            relay.connect(local),
            Arc::new(FakeTransportFactory::new()),
            Arc::new(FakeDevices::new()),
        )
        .build();
        assert!(matches!(result, Err(CallError::Config(_))));
    }

    #[tokio::test]
    async fn test_device_error_is_fatal_to_join() {
        let relay = MemoryRelay::new();
        let devices = Arc::new(FakeDevices::new());
        devices.fail_with(Some(DeviceError::PermissionDenied));
        let session = session(&relay, Arc::clone(&devices));

        let err = session.join().await.unwrap_err();
        assert_eq!(err, CallError::Device(DeviceError::PermissionDenied));
        assert!(session.snapshot().participants.is_empty());
        assert!(relay.room_members(session.session_id()).is_empty());
    }

    #[tokio::test]
    async fn test_join_then_end_releases_media() {
        let relay = MemoryRelay::new();
        let devices = Arc::new(FakeDevices::new());
        let session = session(&relay, Arc::clone(&devices));

        session.join().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);
        assert_eq!(devices.live_captures(), 2);

        assert!(session.end(EndReason::LocalHangup).await);
        assert_eq!(session.status(), SessionStatus::Ended);
        assert_eq!(devices.live_captures(), 0);
        assert_eq!(session.join().await, Err(CallError::Ended));
    }

    #[tokio::test]
    async fn test_drop_releases_media() {
        let relay = MemoryRelay::new();
        let devices = Arc::new(FakeDevices::new());
        let session = session(&relay, Arc::clone(&devices));
        session.join().await.unwrap();

        drop(session);
        assert_eq!(devices.live_captures(), 0);
        assert!(devices.captures().iter().all(|c| c.stop_calls() == 1));
    }

    #[tokio::test]
    async fn test_summary_requires_ended_session() {
        let relay = MemoryRelay::new();
        let session = session(&relay, Arc::new(FakeDevices::new()));
        assert_eq!(
            session.submit_summary(Some(5), None).await,
            Err(CallError::InvalidState(SessionStatus::Connecting))
        );
        session.end(EndReason::LocalHangup).await;
        assert_eq!(
            session.submit_summary(Some(5), None).await,
            Err(CallError::NoCallContext)
        );
    }
}
