//! Call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a call, issued by the call-context endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relay room identifier, derived from the call context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session ID from an arbitrary room key
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derive the relay room for a call
    pub fn for_call(call_id: CallId) -> Self {
        Self(format!("call-{call_id}"))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Participant identifier
///
/// Ordering is significant: the numerically lower id of a pair is the offer
/// initiator and wins glare.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    /// Whether this side creates the offer for the pair `(self, remote)`
    #[must_use]
    pub fn initiates_with(self, remote: ParticipantId) -> bool {
        self < remote
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Role of a participant in a mentorship call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Mentor
    Mentor,
    /// Mentee
    Mentee,
    /// Anyone else admitted to the room
    #[default]
    Guest,
}

/// Participant description as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Participant identifier
    pub id: ParticipantId,
    /// Name shown to other participants
    pub display_name: String,
    /// Role in the call
    #[serde(default)]
    pub role: Role,
}

impl ParticipantInfo {
    /// Create participant info
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    /// Placeholder for a peer known only by id
    pub fn unknown(id: ParticipantId) -> Self {
        Self {
            id,
            display_name: format!("participant-{id}"),
            role: Role::Guest,
        }
    }
}

/// Roster entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Participant identifier
    pub id: ParticipantId,
    /// Display name
    pub display_name: String,
    /// Role in the call
    pub role: Role,
    /// When the participant entered the roster
    pub joined_at: DateTime<Utc>,
}

impl From<ParticipantInfo> for Participant {
    fn from(info: ParticipantInfo) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            role: info.role,
            joined_at: Utc::now(),
        }
    }
}

/// Lifecycle status of a call session
///
/// Variants are ordered; a session only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Acquiring media and joining the room
    Connecting,
    /// Room membership confirmed
    Connected,
    /// Teardown in progress
    Ending,
    /// Teardown complete, resources released
    Ended,
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio
    Audio,
    /// Video
    Video,
}

/// Where a local track is captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    /// Camera
    Camera,
    /// Microphone
    Microphone,
    /// Display capture
    Screen,
}

impl TrackSource {
    /// Media kind produced by this source
    #[must_use]
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Microphone => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Camera => "camera",
            Self::Microphone => "microphone",
            Self::Screen => "screen",
        };
        f.write_str(name)
    }
}

/// Media constraints for capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Capture microphone
    pub audio: bool,
    /// Capture camera
    pub video: bool,
    /// Requested camera resolution
    pub video_resolution: VideoResolution,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            video_resolution: VideoResolution::default(),
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            video_resolution: VideoResolution::default(),
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Sources to capture for these constraints
    pub fn sources(&self) -> Vec<TrackSource> {
        let mut sources = Vec::new();
        if self.audio {
            sources.push(TrackSource::Microphone);
        }
        if self.video {
            sources.push(TrackSource::Camera);
        }
        sources
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Video resolution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 320x240
    QVGA240,
    /// 640x480
    SD480,
    /// 1280x720
    #[default]
    HD720,
    /// 1920x1080
    HD1080,
}

impl VideoResolution {
    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::QVGA240 => 320,
            Self::SD480 => 640,
            Self::HD720 => 1280,
            Self::HD1080 => 1920,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::QVGA240 => 240,
            Self::SD480 => 480,
            Self::HD720 => 720,
            Self::HD1080 => 1080,
        }
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged as offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate proposed for a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media line association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// Public STUN servers used when no configuration is available
    pub fn public_stun() -> Vec<Self> {
        vec![Self {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        }]
    }
}

/// Cumulative transport counters for one peer link at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Packets reported lost
    pub packets_lost: u64,
    /// Packets received
    pub packets_received: u64,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

impl ConnectionStats {
    /// Create a sample stamped now
    pub fn new(packets_lost: u64, packets_received: u64) -> Self {
        Self {
            packets_lost,
            packets_received,
            sampled_at: Utc::now(),
        }
    }

    /// Loss rate `lost / (lost + received)`, zero when nothing was observed
    #[must_use]
    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_lost + self.packets_received;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64
        }
    }

    /// Counters accumulated since `earlier`
    #[must_use]
    pub fn since(&self, earlier: &ConnectionStats) -> ConnectionStats {
        ConnectionStats {
            packets_lost: self.packets_lost.saturating_sub(earlier.packets_lost),
            packets_received: self.packets_received.saturating_sub(earlier.packets_received),
            sampled_at: self.sampled_at,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Signaling channel lost and could not be recovered
    SignalingLost,
    /// Every peer transport failed
    TransportFailed,
    /// Host process is exiting
    HostExit,
    /// Session handle dropped without an explicit end
    Dropped,
}

/// Negotiation state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    /// No offer outstanding
    Stable,
    /// Local offer sent, awaiting answer
    HaveLocalOffer,
    /// Remote offer applied, answer pending
    HaveRemoteOffer,
    /// Link closed
    Closed,
}

/// Call event for notifications
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Session status changed
    StatusChanged {
        /// Previous status
        from: SessionStatus,
        /// New status
        to: SessionStatus,
    },
    /// Remote participant added to the roster
    ParticipantJoined {
        /// Who joined
        participant: ParticipantInfo,
    },
    /// Remote participant removed from the roster
    ParticipantLeft {
        /// Who left
        participant_id: ParticipantId,
        /// Leave was synthesized after the peer silently disappeared
        synthesized: bool,
    },
    /// A peer link changed negotiation state
    NegotiationStateChanged {
        /// Remote peer
        peer: ParticipantId,
        /// Previous state
        from: NegotiationState,
        /// New state
        to: NegotiationState,
    },
    /// Peer transport connected
    PeerConnected {
        /// Remote peer
        peer: ParticipantId,
    },
    /// Packet loss above threshold
    Degraded {
        /// Remote peer
        peer: ParticipantId,
        /// Loss rate over the sampling window
        loss_rate: f64,
        /// Window sample
        stats: ConnectionStats,
    },
    /// Peer transport failed
    ConnectionFailed {
        /// Remote peer
        peer: ParticipantId,
        /// Error description
        error: String,
    },
    /// Screen share is being forwarded instead of the camera
    ScreenShareStarted,
    /// Camera restored after a screen share
    ScreenShareStopped,
    /// Session ended
    Ended {
        /// Why
        reason: EndReason,
        /// Connected duration
        duration: chrono::Duration,
    },
}

/// Point-in-time view of a call session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Relay room
    pub session_id: SessionId,
    /// Roster in participant id order
    pub participants: Vec<Participant>,
    /// Current status
    pub status: SessionStatus,
    /// When the session reached `Connected`
    pub started_at: Option<DateTime<Utc>>,
    /// Connected duration so far
    pub duration: chrono::Duration,
}
