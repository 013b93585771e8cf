//! Peer transport abstraction layer
//!
//! The media engine and ICE transport are an external capability. This module
//! is the seam the negotiation core drives them through: description
//! creation, candidate application, track forwarding and statistics.

use crate::media::MediaTrack;
use crate::types::{ConnectionStats, IceCandidate, IceServer, ParticipantId, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Engine could not create the transport
    #[error("Transport setup failed: {0}")]
    Setup(String),

    /// Description could not be created or applied
    #[error("Session description rejected: {0}")]
    Description(String),

    /// Candidate could not be applied
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    /// Track could not be attached or substituted
    #[error("Track forwarding failed: {0}")]
    Track(String),

    /// Transport already closed
    #[error("Transport closed")]
    Closed,
}

/// Connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, nothing exchanged yet
    New,
    /// ICE checks in progress
    Connecting,
    /// Media path established
    Connected,
    /// Temporarily lost, engine may recover
    Disconnected,
    /// ICE failed or timed out
    Failed,
    /// Closed locally
    Closed,
}

/// Event raised by a peer transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and must be trickled to the peer
    LocalCandidate(IceCandidate),
    /// Connection state changed
    StateChanged(TransportState),
}

/// Peer transport trait
///
/// One instance per remote participant. Implementations wrap an engine peer
/// connection; the negotiation automaton in [`crate::negotiation`] decides
/// which of these operations are legal at any moment.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer describing the local media
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Discard an outstanding local offer
    async fn rollback(&self) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Start forwarding a local track
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError>;

    /// Substitute the outgoing video source without renegotiating
    async fn replace_video_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError>;

    /// Cumulative packet counters
    async fn stats(&self) -> Result<ConnectionStats, TransportError>;

    /// Close the transport
    async fn close(&self) -> Result<(), TransportError>;
}

/// A freshly opened transport and its event stream
pub struct OpenedTransport {
    /// The transport
    pub transport: Arc<dyn PeerTransport>,
    /// Candidates and state changes, in the order the engine raised them
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Creates peer transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport towards `remote`
    async fn open(
        &self,
        remote: ParticipantId,
        ice_servers: &[IceServer],
    ) -> Result<OpenedTransport, TransportError>;
}
