//! Signaling channel contract
//!
//! Negotiation messages and room membership events exchanged with a relay.
//! Delivery is FIFO per sender; nothing is assumed about ordering across
//! senders.

use crate::types::{IceCandidate, ParticipantId, ParticipantInfo, SessionDescription, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Channel is disconnected
    #[error("Signaling channel unavailable")]
    ChannelUnavailable,

    /// Frame could not be decoded
    #[error("Malformed signaling message: {0}")]
    MalformedMessage(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Negotiation message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
}

impl MessageType {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed negotiation payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationPayload {
    /// SDP offer
    Offer(SessionDescription),
    /// SDP answer
    Answer(SessionDescription),
    /// ICE candidate
    IceCandidate(IceCandidate),
}

impl NegotiationPayload {
    /// Message type of this payload
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Offer(_) => MessageType::Offer,
            Self::Answer(_) => MessageType::Answer,
            Self::IceCandidate(_) => MessageType::IceCandidate,
        }
    }
}

/// Negotiation message between two participants of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    /// Relay room
    pub session_id: SessionId,
    /// Sender
    pub from: ParticipantId,
    /// Recipient, `None` for room broadcast
    pub to: Option<ParticipantId>,
    /// Offer, answer or candidate
    pub payload: NegotiationPayload,
}

impl SignalingMessage {
    /// Message type
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Room membership event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A participant entered the room
    ParticipantJoined {
        /// Relay room
        session_id: SessionId,
        /// Who joined
        participant: ParticipantInfo,
    },
    /// A participant left the room
    ParticipantLeft {
        /// Relay room
        session_id: SessionId,
        /// Who left
        participant_id: ParticipantId,
    },
}

/// Everything a channel delivers to its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Offer, answer or ICE candidate
    Negotiation(SignalingMessage),
    /// Membership change
    Room(RoomEvent),
    /// Relay confirmed our membership; lists participants already present
    RoomJoined {
        /// Relay room
        session_id: SessionId,
        /// Members other than us
        participants: Vec<ParticipantInfo>,
    },
    /// The relay lost a participant's socket without a leave
    PresenceLost {
        /// Relay room
        session_id: SessionId,
        /// Participant whose socket went away
        participant_id: ParticipantId,
    },
    /// A previously lost participant's socket is back
    PresenceRestored {
        /// Relay room
        session_id: SessionId,
        /// Participant whose socket returned
        participant_id: ParticipantId,
    },
    /// Our own connection to the relay dropped
    Disconnected,
}

impl ChannelEvent {
    /// Short name for tracing
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Negotiation(msg) => msg.message_type().as_str(),
            Self::Room(RoomEvent::ParticipantJoined { .. }) => "participant_joined",
            Self::Room(RoomEvent::ParticipantLeft { .. }) => "participant_left",
            Self::RoomJoined { .. } => "room_joined",
            Self::PresenceLost { .. } => "presence_lost",
            Self::PresenceRestored { .. } => "presence_restored",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Signaling channel trait
///
/// Implement this for the relay transport in use (WebSocket, in-process,
/// etc.). Sends fail with [`SignalingError::ChannelUnavailable`] while the
/// channel is down; implementations must not retry on their own.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a negotiation message to one participant
    async fn send(&self, to: ParticipantId, message: SignalingMessage)
        -> Result<(), SignalingError>;

    /// Enter a relay room as `local`
    async fn join_room(
        &self,
        session_id: &SessionId,
        local: &ParticipantInfo,
    ) -> Result<(), SignalingError>;

    /// Leave a relay room; other members observe `participant_left`
    async fn leave_room(&self, session_id: &SessionId) -> Result<(), SignalingError>;

    /// Next inbound event
    ///
    /// Yields [`ChannelEvent::Disconnected`] once when the channel drops and
    /// [`SignalingError::ChannelUnavailable`] afterwards.
    async fn receive(&self) -> Result<ChannelEvent, SignalingError>;

    /// Whether the channel is currently connected
    fn is_connected(&self) -> bool;

    /// Re-establish a dropped channel
    async fn reconnect(&self) -> Result<(), SignalingError> {
        Err(SignalingError::ChannelUnavailable)
    }
}

/// JSON frame exchanged with a relay
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from_participant: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to_participant: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    participant_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    participant_info: Option<ParticipantInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    participants: Option<Vec<ParticipantInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

fn required<T>(value: Option<T>, field: &str, kind: &str) -> Result<T, SignalingError> {
    value.ok_or_else(|| SignalingError::MalformedMessage(format!("{kind} frame missing {field}")))
}

fn payload_as<T: serde::de::DeserializeOwned>(
    payload: Option<serde_json::Value>,
    kind: &str,
) -> Result<T, SignalingError> {
    let value = required(payload, "payload", kind)?;
    serde_json::from_value(value)
        .map_err(|e| SignalingError::MalformedMessage(format!("{kind} payload: {e}")))
}

/// Encode an event as a relay frame
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode_frame(event: &ChannelEvent) -> Result<String, SignalingError> {
    let frame = match event {
        ChannelEvent::Negotiation(msg) => {
            let payload = match &msg.payload {
                NegotiationPayload::Offer(desc) | NegotiationPayload::Answer(desc) => {
                    serde_json::to_value(desc)
                }
                NegotiationPayload::IceCandidate(candidate) => serde_json::to_value(candidate),
            }
            .map_err(|e| SignalingError::MalformedMessage(e.to_string()))?;
            WireFrame {
                kind: msg.message_type().as_str().to_string(),
                session_id: Some(msg.session_id.clone()),
                from_participant: Some(msg.from),
                to_participant: msg.to,
                payload: Some(payload),
                ..Default::default()
            }
        }
        ChannelEvent::Room(RoomEvent::ParticipantJoined {
            session_id,
            participant,
        }) => WireFrame {
            kind: "participant_joined".to_string(),
            session_id: Some(session_id.clone()),
            participant_id: Some(participant.id),
            participant_info: Some(participant.clone()),
            ..Default::default()
        },
        ChannelEvent::Room(RoomEvent::ParticipantLeft {
            session_id,
            participant_id,
        }) => WireFrame {
            kind: "participant_left".to_string(),
            session_id: Some(session_id.clone()),
            participant_id: Some(*participant_id),
            ..Default::default()
        },
        ChannelEvent::RoomJoined {
            session_id,
            participants,
        } => WireFrame {
            kind: "room_joined".to_string(),
            session_id: Some(session_id.clone()),
            participants: Some(participants.clone()),
            ..Default::default()
        },
        ChannelEvent::PresenceLost {
            session_id,
            participant_id,
        } => WireFrame {
            kind: "presence_lost".to_string(),
            session_id: Some(session_id.clone()),
            participant_id: Some(*participant_id),
            ..Default::default()
        },
        ChannelEvent::PresenceRestored {
            session_id,
            participant_id,
        } => WireFrame {
            kind: "presence_restored".to_string(),
            session_id: Some(session_id.clone()),
            participant_id: Some(*participant_id),
            ..Default::default()
        },
        ChannelEvent::Disconnected => WireFrame {
            kind: "disconnected".to_string(),
            ..Default::default()
        },
    };
    serde_json::to_string(&frame).map_err(|e| SignalingError::MalformedMessage(e.to_string()))
}

/// Decode a relay frame
///
/// # Errors
///
/// Returns [`SignalingError::MalformedMessage`] for invalid JSON, unknown
/// frame types, missing fields or undecodable payloads.
pub fn decode_frame(raw: &str) -> Result<ChannelEvent, SignalingError> {
    let frame: WireFrame =
        serde_json::from_str(raw).map_err(|e| SignalingError::MalformedMessage(e.to_string()))?;
    let kind = frame.kind.as_str();

    match kind {
        "offer" | "answer" | "ice_candidate" => {
            let session_id = required(frame.session_id, "sessionId", kind)?;
            let from = required(frame.from_participant, "fromParticipant", kind)?;
            let payload = match kind {
                "offer" => NegotiationPayload::Offer(payload_as(frame.payload, kind)?),
                "answer" => NegotiationPayload::Answer(payload_as(frame.payload, kind)?),
                _ => NegotiationPayload::IceCandidate(payload_as(frame.payload, kind)?),
            };
            Ok(ChannelEvent::Negotiation(SignalingMessage {
                session_id,
                from,
                to: frame.to_participant,
                payload,
            }))
        }
        "participant_joined" => {
            let session_id = required(frame.session_id, "sessionId", kind)?;
            let participant = match (frame.participant_info, frame.participant_id) {
                (Some(info), _) => info,
                (None, Some(id)) => ParticipantInfo::unknown(id),
                (None, None) => {
                    return Err(SignalingError::MalformedMessage(format!(
                        "{kind} frame missing participantId"
                    )))
                }
            };
            Ok(ChannelEvent::Room(RoomEvent::ParticipantJoined {
                session_id,
                participant,
            }))
        }
        "participant_left" => Ok(ChannelEvent::Room(RoomEvent::ParticipantLeft {
            session_id: required(frame.session_id, "sessionId", kind)?,
            participant_id: required(frame.participant_id, "participantId", kind)?,
        })),
        "room_joined" => Ok(ChannelEvent::RoomJoined {
            session_id: required(frame.session_id, "sessionId", kind)?,
            participants: frame.participants.unwrap_or_default(),
        }),
        "presence_lost" => Ok(ChannelEvent::PresenceLost {
            session_id: required(frame.session_id, "sessionId", kind)?,
            participant_id: required(frame.participant_id, "participantId", kind)?,
        }),
        "presence_restored" => Ok(ChannelEvent::PresenceRestored {
            session_id: required(frame.session_id, "sessionId", kind)?,
            participant_id: required(frame.participant_id, "participantId", kind)?,
        }),
        "disconnected" => Ok(ChannelEvent::Disconnected),
        other => Err(SignalingError::MalformedMessage(format!(
            "unknown frame type: {other}"
        ))),
    }
}

/// Signaling handler
///
/// Wraps a channel with tracing and drops malformed frames instead of
/// surfacing them to the session.
pub struct SignalingHandler {
    channel: Arc<dyn SignalingChannel>,
    dropped: AtomicU64,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            channel,
            dropped: AtomicU64::new(0),
        }
    }

    /// Send a signaling message to a peer
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(peer = %to, message_type = %message.message_type()))]
    pub async fn send_message(
        &self,
        to: ParticipantId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.channel.send(to, message).await
    }

    /// Receive the next well-formed event
    ///
    /// # Errors
    ///
    /// Returns error if the channel is unavailable
    pub async fn receive_event(&self) -> Result<ChannelEvent, SignalingError> {
        loop {
            match self.channel.receive().await {
                Ok(event) => {
                    tracing::trace!(kind = event.kind(), "Received signaling event");
                    return Ok(event);
                }
                Err(SignalingError::MalformedMessage(reason)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(%reason, dropped, "Dropping malformed signaling message");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Number of malformed frames dropped so far
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }
}
