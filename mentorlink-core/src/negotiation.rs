//! Peer negotiation state machine
//!
//! A [`PeerLink`] drives offer/answer/ICE exchange with one remote
//! participant:
//!
//! ```text
//! Stable --create_offer--> HaveLocalOffer --receive_answer--> Stable
//! Stable --receive_offer--> HaveRemoteOffer --(local answer)--> Stable
//! any --close--> Closed
//! ```
//!
//! Operations on one link never overlap. [`PeerLinkHandle`] runs a link as a
//! task draining a typed command queue together with the transport's event
//! stream, so inbound messages are applied one at a time in delivery order.

use crate::peer_transport::{PeerTransport, TransportError, TransportEvent, TransportState};
use crate::signaling::{NegotiationPayload, SignalingError, SignalingHandler, SignalingMessage};
use crate::types::{
    CallEvent, IceCandidate, NegotiationState, ParticipantId, SdpKind, SessionDescription,
    SessionId,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Negotiation errors
///
/// Apart from transport and signaling failures these describe messages that
/// arrived at the wrong time. The session ignores them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Operation not legal in the current state
    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: NegotiationState,
    },

    /// An offer is already being created
    #[error("Offer already in flight")]
    OfferInFlight,

    /// Duplicate or superseded message
    #[error("Stale {0} ignored")]
    StaleMessage(&'static str),

    /// Link closed
    #[error("Peer link closed")]
    Closed,

    /// Link closed while the operation was suspended
    #[error("Operation cancelled by close")]
    Cancelled,

    /// Engine failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Message could not be sent
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl NegotiationError {
    /// Whether this error only reflects message timing and can be dropped
    #[must_use]
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::OfferInFlight
                | Self::StaleMessage(_)
                | Self::Closed
                | Self::Cancelled
        )
    }
}

/// How an incoming offer was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Remote offer applied and answered
    Answered,
    /// Glare: our own offer wins, incoming offer dropped
    KeptLocalOffer,
    /// Glare: our offer rolled back, incoming offer answered
    RolledBackAndAnswered,
}

/// How an incoming ICE candidate was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceOutcome {
    /// Held until a remote description is set
    Buffered,
    /// Applied to the transport
    Applied,
}

#[derive(Debug)]
struct LinkState {
    negotiation: NegotiationState,
    offer_in_flight: bool,
    /// Any remote description has ever been applied
    has_remote_description: bool,
    /// Our latest offer has been answered
    answered: bool,
    /// Our last offer never reached the channel and was rolled back
    needs_renegotiation: bool,
    /// Answer applied locally whose send failed
    unsent_answer: Option<SessionDescription>,
    /// Local candidates waiting for the channel, in gathering order
    unsent_candidates: Vec<IceCandidate>,
    ice_buffer: Vec<IceCandidate>,
    history: Vec<(NegotiationState, NegotiationState)>,
    offers_created: u32,
}

/// Negotiation with one remote participant
pub struct PeerLink {
    session_id: SessionId,
    local: ParticipantId,
    remote: ParticipantId,
    transport: Arc<dyn PeerTransport>,
    signaling: Arc<SignalingHandler>,
    events: broadcast::Sender<CallEvent>,
    state: Mutex<LinkState>,
    /// Serializes operations on this link
    op: tokio::sync::Mutex<()>,
    cancel: watch::Sender<bool>,
}

impl PeerLink {
    /// Create a link in `Stable`
    #[must_use]
    pub fn new(
        session_id: SessionId,
        local: ParticipantId,
        remote: ParticipantId,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<SignalingHandler>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            session_id,
            local,
            remote,
            transport,
            signaling,
            events,
            state: Mutex::new(LinkState {
                negotiation: NegotiationState::Stable,
                offer_in_flight: false,
                has_remote_description: false,
                answered: false,
                needs_renegotiation: false,
                unsent_answer: None,
                unsent_candidates: Vec::new(),
                ice_buffer: Vec::new(),
                history: Vec::new(),
                offers_created: 0,
            }),
            op: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    /// Remote participant
    #[must_use]
    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    /// Whether this side makes the first offer for the pair
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.local.initiates_with(self.remote)
    }

    /// Current negotiation state
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    /// Whether the link is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Closed
    }

    /// Every transition so far, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<(NegotiationState, NegotiationState)> {
        self.state.lock().history.clone()
    }

    /// Candidates waiting for a remote description
    #[must_use]
    pub fn buffered_candidates(&self) -> usize {
        self.state.lock().ice_buffer.len()
    }

    /// Number of offers this link has sent
    #[must_use]
    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    /// Whether a failed send left something to redeliver
    #[must_use]
    pub fn has_pending_delivery(&self) -> bool {
        let state = self.state.lock();
        state.needs_renegotiation || state.unsent_answer.is_some() || !state.unsent_candidates.is_empty()
    }

    /// Engine transport of this link
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    fn transition(&self, state: &mut LinkState, to: NegotiationState) {
        let from = state.negotiation;
        if from == to {
            return;
        }
        state.negotiation = to;
        state.history.push((from, to));
        tracing::debug!(peer = %self.remote, ?from, ?to, "Negotiation state changed");
        let _ = self.events.send(CallEvent::NegotiationStateChanged {
            peer: self.remote,
            from,
            to,
        });
    }

    /// Run one transport step; resolves to `Cancelled` if the link closes first
    async fn guarded<T, F>(&self, step: F) -> Result<T, NegotiationError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            biased;
            _ = cancel.wait_for(|closed| *closed) => Err(NegotiationError::Cancelled),
            result = step => {
                if self.is_closed() {
                    return Err(NegotiationError::Cancelled);
                }
                Ok(result?)
            }
        }
    }

    async fn send(&self, payload: NegotiationPayload) -> Result<(), NegotiationError> {
        let message = SignalingMessage {
            session_id: self.session_id.clone(),
            from: self.local,
            to: Some(self.remote),
            payload,
        };
        self.signaling.send_message(self.remote, message).await?;
        Ok(())
    }

    /// Create and send an offer
    ///
    /// # Errors
    ///
    /// Returns error unless the link is `Stable` with no offer in flight, or
    /// if the engine or channel fails
    #[tracing::instrument(skip(self), fields(peer = %self.remote))]
    pub async fn create_offer(&self) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock();
            if state.offer_in_flight {
                return Err(NegotiationError::OfferInFlight);
            }
            state.offer_in_flight = true;
        }
        let result = self.create_offer_inner().await;
        self.state.lock().offer_in_flight = false;
        result
    }

    async fn create_offer_inner(&self) -> Result<(), NegotiationError> {
        let _op = self.op.lock().await;
        match self.state() {
            NegotiationState::Stable => {}
            NegotiationState::Closed => return Err(NegotiationError::Closed),
            state => {
                return Err(NegotiationError::InvalidState {
                    operation: "create_offer",
                    state,
                })
            }
        }

        let offer = self.guarded(self.transport.create_offer()).await?;
        self.guarded(self.transport.set_local_description(offer.clone()))
            .await?;
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return Err(NegotiationError::Cancelled);
            }
            state.answered = false;
            self.transition(&mut state, NegotiationState::HaveLocalOffer);
        }
        if let Err(e) = self.send(NegotiationPayload::Offer(offer)).await {
            self.withdraw_offer().await;
            return Err(e);
        }
        let mut state = self.state.lock();
        state.offers_created += 1;
        state.needs_renegotiation = false;
        Ok(())
    }

    /// Roll back an offer the peer never received
    ///
    /// The link returns to `Stable` so it can offer again once the channel
    /// is back.
    async fn withdraw_offer(&self) {
        tracing::warn!(peer = %self.remote, "Offer not delivered, rolling back");
        if let Err(e) = self.guarded(self.transport.rollback()).await {
            tracing::debug!(peer = %self.remote, error = %e, "Rollback of undelivered offer failed");
        }
        let mut state = self.state.lock();
        if state.negotiation == NegotiationState::HaveLocalOffer {
            state.needs_renegotiation = true;
            state.unsent_candidates.clear();
            self.transition(&mut state, NegotiationState::Stable);
        }
    }

    /// Apply a remote offer and answer it
    ///
    /// Glare is resolved by participant id: the lower id keeps its own
    /// offer, the higher id rolls back and answers.
    ///
    /// # Errors
    ///
    /// Returns error if the offer is not legal now, or if the engine or
    /// channel fails
    #[tracing::instrument(skip(self, offer), fields(peer = %self.remote))]
    pub async fn receive_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<OfferOutcome, NegotiationError> {
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::StaleMessage("answer in offer slot"));
        }
        let _op = self.op.lock().await;
        let glare = match self.state() {
            NegotiationState::Stable => false,
            NegotiationState::HaveLocalOffer if self.is_initiator() => {
                tracing::debug!("Glare: keeping local offer");
                return Ok(OfferOutcome::KeptLocalOffer);
            }
            NegotiationState::HaveLocalOffer => true,
            NegotiationState::Closed => return Err(NegotiationError::Closed),
            state => {
                return Err(NegotiationError::InvalidState {
                    operation: "receive_offer",
                    state,
                })
            }
        };

        if glare {
            tracing::debug!("Glare: rolling back local offer");
            self.guarded(self.transport.rollback()).await?;
            let mut state = self.state.lock();
            self.transition(&mut state, NegotiationState::Stable);
        }

        self.guarded(self.transport.set_remote_description(offer))
            .await?;
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return Err(NegotiationError::Cancelled);
            }
            state.has_remote_description = true;
            state.answered = false;
            state.unsent_answer = None;
            self.transition(&mut state, NegotiationState::HaveRemoteOffer);
        }
        self.flush_ice_buffer().await?;

        let answer = self.guarded(self.transport.create_answer()).await?;
        self.guarded(self.transport.set_local_description(answer.clone()))
            .await?;
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return Err(NegotiationError::Cancelled);
            }
            self.transition(&mut state, NegotiationState::Stable);
        }
        if let Err(e) = self.send(NegotiationPayload::Answer(answer.clone())).await {
            tracing::warn!(peer = %self.remote, error = %e, "Answer not delivered, holding it");
            self.state.lock().unsent_answer = Some(answer);
            return Err(e);
        }
        self.state.lock().needs_renegotiation = false;

        Ok(if glare {
            OfferOutcome::RolledBackAndAnswered
        } else {
            OfferOutcome::Answered
        })
    }

    /// Apply the answer to our outstanding offer
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::StaleMessage`] for a duplicate answer,
    /// [`NegotiationError::InvalidState`] when no offer is outstanding, or
    /// the engine error
    #[tracing::instrument(skip(self, answer), fields(peer = %self.remote))]
    pub async fn receive_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::StaleMessage("offer in answer slot"));
        }
        let _op = self.op.lock().await;
        {
            let state = self.state.lock();
            match state.negotiation {
                NegotiationState::HaveLocalOffer => {}
                NegotiationState::Stable if state.answered => {
                    return Err(NegotiationError::StaleMessage("answer"));
                }
                NegotiationState::Closed => return Err(NegotiationError::Closed),
                state => {
                    return Err(NegotiationError::InvalidState {
                        operation: "receive_answer",
                        state,
                    })
                }
            }
        }

        self.guarded(self.transport.set_remote_description(answer))
            .await?;
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return Err(NegotiationError::Cancelled);
            }
            state.has_remote_description = true;
            state.answered = true;
            self.transition(&mut state, NegotiationState::Stable);
        }
        self.flush_ice_buffer().await
    }

    /// Apply a remote candidate, or buffer it until a remote description exists
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the engine rejects the candidate
    pub async fn receive_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<IceOutcome, NegotiationError> {
        let _op = self.op.lock().await;
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return Err(NegotiationError::Closed);
            }
            if !state.has_remote_description {
                state.ice_buffer.push(candidate);
                tracing::trace!(peer = %self.remote, buffered = state.ice_buffer.len(), "ICE candidate buffered");
                return Ok(IceOutcome::Buffered);
            }
        }
        self.guarded(self.transport.add_ice_candidate(candidate))
            .await?;
        Ok(IceOutcome::Applied)
    }

    async fn flush_ice_buffer(&self) -> Result<(), NegotiationError> {
        let buffered = std::mem::take(&mut self.state.lock().ice_buffer);
        if buffered.is_empty() {
            return Ok(());
        }
        tracing::debug!(peer = %self.remote, count = buffered.len(), "Applying buffered ICE candidates");
        for candidate in buffered {
            match self.guarded(self.transport.add_ice_candidate(candidate)).await {
                Ok(()) => {}
                Err(NegotiationError::Transport(e)) => {
                    tracing::warn!(peer = %self.remote, error = %e, "Buffered candidate rejected");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send a locally gathered candidate to the peer
    ///
    /// Candidates that cannot go out yet are queued for [`PeerLink::resume`].
    /// A candidate never overtakes a held answer. Candidates gathered for a
    /// withdrawn offer are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the channel is unavailable
    pub async fn send_local_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return Err(NegotiationError::Closed);
            }
            if state.needs_renegotiation {
                return Ok(());
            }
            if state.unsent_answer.is_some() || !state.unsent_candidates.is_empty() {
                state.unsent_candidates.push(candidate);
                return Ok(());
            }
        }
        if let Err(e) = self
            .send(NegotiationPayload::IceCandidate(candidate.clone()))
            .await
        {
            self.state.lock().unsent_candidates.push(candidate);
            return Err(e);
        }
        Ok(())
    }

    /// Redeliver what failed sends left behind
    ///
    /// Resends a held answer followed by queued candidates, then offers again
    /// if our last offer was withdrawn. Called once the channel is back.
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or a send fails again; whatever
    /// was not delivered stays queued
    #[tracing::instrument(skip(self), fields(peer = %self.remote))]
    pub async fn resume(&self) -> Result<(), NegotiationError> {
        let reoffer = {
            let _op = self.op.lock().await;
            let answer = {
                let mut state = self.state.lock();
                if state.negotiation == NegotiationState::Closed {
                    return Err(NegotiationError::Closed);
                }
                state.unsent_answer.take()
            };
            if let Some(answer) = answer {
                if let Err(e) = self.send(NegotiationPayload::Answer(answer.clone())).await {
                    self.state.lock().unsent_answer = Some(answer);
                    return Err(e);
                }
                tracing::debug!("Held answer delivered");
            }

            let queued = std::mem::take(&mut self.state.lock().unsent_candidates);
            for (sent, candidate) in queued.iter().enumerate() {
                if let Err(e) = self
                    .send(NegotiationPayload::IceCandidate(candidate.clone()))
                    .await
                {
                    let mut state = self.state.lock();
                    let later = std::mem::take(&mut state.unsent_candidates);
                    state.unsent_candidates = queued[sent..].to_vec();
                    state.unsent_candidates.extend(later);
                    return Err(e);
                }
            }

            let state = self.state.lock();
            state.needs_renegotiation && state.negotiation == NegotiationState::Stable
        };
        if reoffer {
            tracing::debug!("Offering again after withdrawn offer");
            self.create_offer().await?;
        }
        Ok(())
    }

    /// Dispatch an inbound negotiation message
    ///
    /// # Errors
    ///
    /// Returns whatever the matching operation returns
    pub async fn handle_payload(&self, payload: NegotiationPayload) -> Result<(), NegotiationError> {
        match payload {
            NegotiationPayload::Offer(offer) => self.receive_offer(offer).await.map(|_| ()),
            NegotiationPayload::Answer(answer) => self.receive_answer(answer).await,
            NegotiationPayload::IceCandidate(candidate) => {
                self.receive_ice_candidate(candidate).await.map(|_| ())
            }
        }
    }

    /// Mark the link closed and cancel suspended operations
    ///
    /// Synchronous part of [`PeerLink::close`]. Returns false if already closed.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.negotiation == NegotiationState::Closed {
                return false;
            }
            state.ice_buffer.clear();
            state.unsent_candidates.clear();
            state.unsent_answer = None;
            state.offer_in_flight = false;
            self.transition(&mut state, NegotiationState::Closed);
        }
        self.cancel.send_replace(true);
        true
    }

    /// Close the link and its transport
    ///
    /// Idempotent; returns true only for the call that closed it.
    pub async fn close(&self) -> bool {
        if !self.cancel() {
            return false;
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(peer = %self.remote, error = %e, "Transport close failed");
        }
        tracing::debug!(peer = %self.remote, "Peer link closed");
        true
    }
}

/// What a link actor reports to its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkReport {
    /// Transport connected
    Connected(ParticipantId),
    /// Transport failed; the link stays up until retried or removed
    Failed(ParticipantId, String),
}

enum LinkCommand {
    CreateOffer,
    Resume,
    Inbound(NegotiationPayload),
    Shutdown,
}

/// A [`PeerLink`] running as its own task
pub struct PeerLinkHandle {
    link: Arc<PeerLink>,
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

impl PeerLinkHandle {
    /// Spawn the actor for `link`
    ///
    /// `transport_events` is the stream returned by the transport factory.
    pub fn spawn(
        link: Arc<PeerLink>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        reports: mpsc::UnboundedSender<LinkReport>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(Arc::clone(&link), rx, transport_events, reports));
        Self {
            link,
            commands,
            task,
        }
    }

    /// The link driven by this actor
    #[must_use]
    pub fn link(&self) -> &Arc<PeerLink> {
        &self.link
    }

    /// Queue offer creation
    pub fn create_offer(&self) {
        let _ = self.commands.send(LinkCommand::CreateOffer);
    }

    /// Queue redelivery of anything a failed send left behind
    pub fn resume(&self) {
        let _ = self.commands.send(LinkCommand::Resume);
    }

    /// Queue an inbound negotiation message
    pub fn deliver(&self, payload: NegotiationPayload) {
        let _ = self.commands.send(LinkCommand::Inbound(payload));
    }

    /// Close the link immediately and stop the actor
    pub async fn close(&self) -> bool {
        let closed = self.link.close().await;
        let _ = self.commands.send(LinkCommand::Shutdown);
        closed
    }

    /// Synchronous close for drop paths
    pub fn abort(&self) {
        self.link.cancel();
        self.task.abort();
    }
}

async fn run_link(
    link: Arc<PeerLink>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    reports: mpsc::UnboundedSender<LinkReport>,
) {
    let peer = link.remote();
    let mut events_open = true;
    loop {
        if link.is_closed() {
            break;
        }
        tokio::select! {
            command = commands.recv() => {
                let result = match command {
                    None | Some(LinkCommand::Shutdown) => break,
                    Some(LinkCommand::CreateOffer) => link.create_offer().await,
                    Some(LinkCommand::Resume) => link.resume().await,
                    Some(LinkCommand::Inbound(payload)) => link.handle_payload(payload).await,
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_ignorable() => {
                        tracing::debug!(%peer, error = %e, "Ignoring negotiation message");
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "Negotiation step failed"),
                }
            }
            event = transport_events.recv(), if events_open => match event {
                None => events_open = false,
                Some(TransportEvent::LocalCandidate(candidate)) => {
                    if let Err(e) = link.send_local_candidate(candidate).await {
                        tracing::debug!(%peer, error = %e, "Local candidate not sent");
                    }
                }
                Some(TransportEvent::StateChanged(state)) => {
                    tracing::debug!(%peer, ?state, "Transport state changed");
                    match state {
                        TransportState::Connected => {
                            let _ = reports.send(LinkReport::Connected(peer));
                        }
                        TransportState::Failed => {
                            let _ = reports.send(LinkReport::Failed(
                                peer,
                                "ICE connectivity failed".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
            },
        }
    }
    tracing::trace!(%peer, "Peer link actor stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use crate::signaling::{ChannelEvent, SignalingChannel};
    use crate::testing::FakeTransport;
    use crate::types::{ParticipantInfo, Role};
    use pretty_assertions::assert_eq;

    struct Fixture {
        relay: MemoryRelay,
        link: Arc<PeerLink>,
        transport: Arc<FakeTransport>,
        local_channel: Arc<crate::relay::RelayEndpoint>,
        remote_channel: Arc<crate::relay::RelayEndpoint>,
    }

    fn fixture(local: u64, remote: u64) -> Fixture {
        let relay = MemoryRelay::new();
        let local_channel = relay.connect(ParticipantInfo::new(local, "local", Role::Mentor));
        let remote_channel = relay.connect(ParticipantInfo::new(remote, "remote", Role::Mentee));
        let transport = Arc::new(FakeTransport::new(ParticipantId(remote)));
        let (events, _) = broadcast::channel(100);
        let link = Arc::new(PeerLink::new(
            SessionId::new("call-test"),
            ParticipantId(local),
            ParticipantId(remote),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            Arc::new(SignalingHandler::new(Arc::clone(&local_channel) as _)),
            events,
        ));
        Fixture {
            relay,
            link,
            transport,
            local_channel,
            remote_channel,
        }
    }

    async fn next_payload(channel: &crate::relay::RelayEndpoint) -> NegotiationPayload {
        match channel.receive().await.unwrap() {
            ChannelEvent::Negotiation(message) => message.payload,
            other => unreachable!("expected negotiation frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offer_then_answer() {
        let f = fixture(1, 2);
        f.link.create_offer().await.unwrap();
        assert_eq!(f.link.state(), NegotiationState::HaveLocalOffer);
        assert!(matches!(
            next_payload(&f.remote_channel).await,
            NegotiationPayload::Offer(_)
        ));

        f.link
            .receive_answer(SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();
        assert_eq!(f.link.state(), NegotiationState::Stable);
        assert_eq!(
            f.link.history(),
            vec![
                (NegotiationState::Stable, NegotiationState::HaveLocalOffer),
                (NegotiationState::HaveLocalOffer, NegotiationState::Stable),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_offer_rejected_while_outstanding() {
        let f = fixture(1, 2);
        f.link.create_offer().await.unwrap();
        let err = f.link.create_offer().await.unwrap_err();
        assert_eq!(
            err,
            NegotiationError::InvalidState {
                operation: "create_offer",
                state: NegotiationState::HaveLocalOffer,
            }
        );
        assert_eq!(f.link.offers_created(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_ignorable() {
        let f = fixture(1, 2);
        let err = f
            .link
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(err.is_ignorable());
        assert_eq!(f.link.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_stale() {
        let f = fixture(1, 2);
        f.link.create_offer().await.unwrap();
        f.link
            .receive_answer(SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();
        let err = f
            .link
            .receive_answer(SessionDescription::answer("v=0 answer"))
            .await
            .unwrap_err();
        assert_eq!(err, NegotiationError::StaleMessage("answer"));
        assert!(err.is_ignorable());
        assert_eq!(f.link.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_undelivered_offer_is_withdrawn_then_resent() {
        let f = fixture(1, 2);
        f.relay.disconnect(ParticipantId(1));
        assert_eq!(
            f.link.create_offer().await,
            Err(NegotiationError::Signaling(SignalingError::ChannelUnavailable))
        );
        assert_eq!(f.link.state(), NegotiationState::Stable);
        assert_eq!(f.transport.rollbacks(), 1);
        assert_eq!(f.link.offers_created(), 0);
        assert!(f.link.has_pending_delivery());

        // Candidates gathered for the withdrawn offer never go out.
        f.link
            .send_local_candidate(IceCandidate::new("candidate:stale"))
            .await
            .unwrap();

        f.local_channel.reconnect().await.unwrap();
        f.link.resume().await.unwrap();
        assert_eq!(f.link.state(), NegotiationState::HaveLocalOffer);
        assert_eq!(f.link.offers_created(), 1);
        assert!(!f.link.has_pending_delivery());
        assert_eq!(f.transport.local_description_conflicts(), 0);
        assert!(matches!(
            next_payload(&f.remote_channel).await,
            NegotiationPayload::Offer(_)
        ));

        f.link
            .receive_answer(SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();
        assert_eq!(f.link.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_undelivered_answer_is_held_until_resume() {
        let f = fixture(2, 1);
        f.relay.disconnect(ParticipantId(2));
        assert_eq!(
            f.link
                .receive_offer(SessionDescription::offer("v=0 offer"))
                .await,
            Err(NegotiationError::Signaling(SignalingError::ChannelUnavailable))
        );
        assert_eq!(f.link.state(), NegotiationState::Stable);
        f.link
            .send_local_candidate(IceCandidate::new("candidate:0"))
            .await
            .unwrap();
        assert!(f.link.has_pending_delivery());

        // Still down: nothing is lost.
        assert!(f.link.resume().await.is_err());
        assert!(f.link.has_pending_delivery());

        f.local_channel.reconnect().await.unwrap();
        f.link.resume().await.unwrap();
        assert!(!f.link.has_pending_delivery());
        assert!(matches!(
            next_payload(&f.remote_channel).await,
            NegotiationPayload::Answer(_)
        ));
        match next_payload(&f.remote_channel).await {
            NegotiationPayload::IceCandidate(candidate) => {
                assert_eq!(candidate.candidate, "candidate:0");
            }
            other => unreachable!("expected candidate, got {other:?}"),
        }
        // The answer is not re-created; the remote description stands.
        assert_eq!(f.link.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_receive_offer_answers() {
        let f = fixture(2, 1);
        let outcome = f
            .link
            .receive_offer(SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();
        assert_eq!(outcome, OfferOutcome::Answered);
        assert_eq!(f.link.state(), NegotiationState::Stable);
        assert!(matches!(
            next_payload(&f.remote_channel).await,
            NegotiationPayload::Answer(_)
        ));
    }

    #[tokio::test]
    async fn test_glare_lower_id_keeps_offer() {
        let f = fixture(1, 2);
        f.link.create_offer().await.unwrap();
        let outcome = f
            .link
            .receive_offer(SessionDescription::offer("v=0 theirs"))
            .await
            .unwrap();
        assert_eq!(outcome, OfferOutcome::KeptLocalOffer);
        assert_eq!(f.link.state(), NegotiationState::HaveLocalOffer);
        assert_eq!(f.transport.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_glare_higher_id_rolls_back() {
        let f = fixture(2, 1);
        f.link.create_offer().await.unwrap();
        let outcome = f
            .link
            .receive_offer(SessionDescription::offer("v=0 theirs"))
            .await
            .unwrap();
        assert_eq!(outcome, OfferOutcome::RolledBackAndAnswered);
        assert_eq!(f.link.state(), NegotiationState::Stable);
        assert_eq!(f.transport.rollbacks(), 1);
        assert_eq!(f.transport.local_description_conflicts(), 0);
    }

    #[tokio::test]
    async fn test_ice_buffered_until_remote_description() {
        let f = fixture(1, 2);
        for n in 0..3 {
            let outcome = f
                .link
                .receive_ice_candidate(IceCandidate::new(format!("candidate:{n}")))
                .await
                .unwrap();
            assert_eq!(outcome, IceOutcome::Buffered);
        }
        assert_eq!(f.link.buffered_candidates(), 3);
        assert!(f.transport.applied_candidates().is_empty());

        f.link.create_offer().await.unwrap();
        f.link
            .receive_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        f.link
            .receive_ice_candidate(IceCandidate::new("candidate:3"))
            .await
            .unwrap();

        let applied: Vec<String> = f
            .transport
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(
            applied,
            vec!["candidate:0", "candidate:1", "candidate:2", "candidate:3"]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture(1, 2);
        assert!(f.link.close().await);
        assert!(!f.link.close().await);
        assert_eq!(f.link.state(), NegotiationState::Closed);
        assert_eq!(f.transport.close_count(), 1);
        assert_eq!(f.link.create_offer().await, Err(NegotiationError::Closed));
    }

    #[tokio::test]
    async fn test_close_cancels_suspended_offer() {
        let f = fixture(1, 2);
        f.transport.hold_descriptions();
        let link = Arc::clone(&f.link);
        let pending = tokio::spawn(async move { link.create_offer().await });
        tokio::task::yield_now().await;

        assert!(f.link.close().await);
        f.transport.release_descriptions();
        assert_eq!(pending.await.unwrap(), Err(NegotiationError::Cancelled));
        assert_eq!(f.link.state(), NegotiationState::Closed);
        assert_eq!(f.link.offers_created(), 0);
    }
}
