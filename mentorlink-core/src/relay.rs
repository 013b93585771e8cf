//! In-process signaling relay
//!
//! [`MemoryRelay`] plays the role of the room relay server for tests and the
//! CLI simulation. Every frame crosses the relay as JSON text so the wire
//! codec is exercised end to end.

use crate::signaling::{
    decode_frame, encode_frame, ChannelEvent, MessageType, RoomEvent, SignalingChannel,
    SignalingError, SignalingMessage,
};
use crate::types::{ParticipantId, ParticipantInfo, SessionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Delivery {
    Frame(String),
    Disconnected,
}

struct Member {
    generation: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    connected: bool,
}

/// One directed negotiation frame that crossed the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    /// Sender
    pub from: ParticipantId,
    /// Recipient
    pub to: ParticipantId,
    /// Message type
    pub message_type: MessageType,
}

#[derive(Default)]
struct RelayState {
    members: HashMap<ParticipantId, Member>,
    rooms: HashMap<SessionId, BTreeMap<ParticipantId, ParticipantInfo>>,
    log: Vec<RelayRecord>,
    generation: u64,
}

impl RelayState {
    fn deliver(&self, to: ParticipantId, frame: &str) {
        if let Some(member) = self.members.get(&to) {
            if member.connected {
                let _ = member.tx.send(Delivery::Frame(frame.to_string()));
            }
        }
    }

    fn fan_out(&self, session_id: &SessionId, except: ParticipantId, event: &ChannelEvent) {
        let Some(room) = self.rooms.get(session_id) else {
            return;
        };
        match encode_frame(event) {
            Ok(frame) => {
                for id in room.keys().filter(|id| **id != except) {
                    self.deliver(*id, &frame);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Relay could not encode room event"),
        }
    }

    fn rooms_of(&self, id: ParticipantId) -> Vec<SessionId> {
        self.rooms
            .iter()
            .filter(|(_, members)| members.contains_key(&id))
            .map(|(session, _)| session.clone())
            .collect()
    }
}

/// In-process relay hosting rooms keyed by session id
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for `participant`
    ///
    /// Connecting again with the same id replaces the previous socket.
    #[must_use]
    pub fn connect(&self, participant: ParticipantInfo) -> Arc<RelayEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = participant.id;
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        state.members.insert(
            id,
            Member {
                generation,
                tx,
                connected: true,
            },
        );
        drop(state);
        tracing::debug!(participant = %id, "Relay connection opened");
        Arc::new(RelayEndpoint {
            relay: self.clone(),
            local: id,
            generation,
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Drop a participant's socket; it sees `Disconnected`, peers see `presence_lost`
    pub fn disconnect(&self, id: ParticipantId) {
        let mut state = self.state.lock();
        let Some(member) = state.members.get_mut(&id) else {
            return;
        };
        if !member.connected {
            return;
        }
        member.connected = false;
        let _ = member.tx.send(Delivery::Disconnected);
        for session_id in state.rooms_of(id) {
            state.fan_out(
                &session_id,
                id,
                &ChannelEvent::PresenceLost {
                    session_id: session_id.clone(),
                    participant_id: id,
                },
            );
        }
        tracing::info!(participant = %id, "Relay connection dropped");
    }

    /// Lose a participant's socket without any leave
    ///
    /// The participant vanishes from every room; peers only see
    /// `presence_lost` and never a `participant_left`.
    pub fn drop_silently(&self, id: ParticipantId) {
        let mut state = self.state.lock();
        let rooms = state.rooms_of(id);
        for session_id in &rooms {
            state.fan_out(
                session_id,
                id,
                &ChannelEvent::PresenceLost {
                    session_id: session_id.clone(),
                    participant_id: id,
                },
            );
            if let Some(room) = state.rooms.get_mut(session_id) {
                room.remove(&id);
            }
        }
        state.members.remove(&id);
        tracing::info!(participant = %id, rooms = rooms.len(), "Relay lost participant silently");
    }

    fn restore(&self, id: ParticipantId) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        let member = state
            .members
            .get_mut(&id)
            .ok_or(SignalingError::ChannelUnavailable)?;
        if member.connected {
            return Ok(());
        }
        member.connected = true;
        for session_id in state.rooms_of(id) {
            state.fan_out(
                &session_id,
                id,
                &ChannelEvent::PresenceRestored {
                    session_id: session_id.clone(),
                    participant_id: id,
                },
            );
        }
        tracing::info!(participant = %id, "Relay connection restored");
        Ok(())
    }

    /// Deliver a raw text frame to a participant
    pub fn inject_raw(&self, to: ParticipantId, frame: &str) {
        self.state.lock().deliver(to, frame);
    }

    /// Members of a room, in id order
    #[must_use]
    pub fn room_members(&self, session_id: &SessionId) -> Vec<ParticipantId> {
        self.state
            .lock()
            .rooms
            .get(session_id)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Negotiation frames relayed so far
    #[must_use]
    pub fn history(&self) -> Vec<RelayRecord> {
        self.state.lock().log.clone()
    }

    /// Count relayed frames of one type sent by `from`
    #[must_use]
    pub fn sent_count(&self, from: ParticipantId, message_type: MessageType) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.from == from && r.message_type == message_type)
            .count()
    }
}

/// A participant's connection to a [`MemoryRelay`]
pub struct RelayEndpoint {
    relay: MemoryRelay,
    local: ParticipantId,
    generation: u64,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl RelayEndpoint {
    /// Participant this endpoint belongs to
    #[must_use]
    pub fn participant_id(&self) -> ParticipantId {
        self.local
    }

    fn ensure_connected(&self) -> Result<(), SignalingError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SignalingError::ChannelUnavailable)
        }
    }
}

#[async_trait]
impl SignalingChannel for RelayEndpoint {
    async fn send(
        &self,
        to: ParticipantId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        self.ensure_connected()?;
        let message_type = message.message_type();
        let frame = encode_frame(&ChannelEvent::Negotiation(message))?;
        let mut state = self.relay.state.lock();
        state.log.push(RelayRecord {
            from: self.local,
            to,
            message_type,
        });
        state.deliver(to, &frame);
        Ok(())
    }

    async fn join_room(
        &self,
        session_id: &SessionId,
        local: &ParticipantInfo,
    ) -> Result<(), SignalingError> {
        self.ensure_connected()?;
        let mut state = self.relay.state.lock();
        let room = state.rooms.entry(session_id.clone()).or_default();
        let rejoin = room.insert(local.id, local.clone()).is_some();
        let others: Vec<ParticipantInfo> = room
            .values()
            .filter(|p| p.id != local.id)
            .cloned()
            .collect();

        let confirmation = encode_frame(&ChannelEvent::RoomJoined {
            session_id: session_id.clone(),
            participants: others,
        })?;
        state.deliver(self.local, &confirmation);

        if !rejoin {
            state.fan_out(
                session_id,
                local.id,
                &ChannelEvent::Room(RoomEvent::ParticipantJoined {
                    session_id: session_id.clone(),
                    participant: local.clone(),
                }),
            );
        }
        tracing::debug!(%session_id, participant = %local.id, rejoin, "Relay room joined");
        Ok(())
    }

    async fn leave_room(&self, session_id: &SessionId) -> Result<(), SignalingError> {
        self.ensure_connected()?;
        let mut state = self.relay.state.lock();
        let removed = state
            .rooms
            .get_mut(session_id)
            .and_then(|room| room.remove(&self.local));
        if removed.is_some() {
            state.fan_out(
                session_id,
                self.local,
                &ChannelEvent::Room(RoomEvent::ParticipantLeft {
                    session_id: session_id.clone(),
                    participant_id: self.local,
                }),
            );
            tracing::debug!(%session_id, participant = %self.local, "Relay room left");
        }
        Ok(())
    }

    async fn receive(&self) -> Result<ChannelEvent, SignalingError> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(Delivery::Frame(frame)) => decode_frame(&frame),
            Some(Delivery::Disconnected) => Ok(ChannelEvent::Disconnected),
            None => Err(SignalingError::ChannelUnavailable),
        }
    }

    fn is_connected(&self) -> bool {
        self.relay
            .state
            .lock()
            .members
            .get(&self.local)
            .is_some_and(|m| m.connected)
    }

    async fn reconnect(&self) -> Result<(), SignalingError> {
        self.relay.restore(self.local)
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        let mut state = self.relay.state.lock();
        let current = state
            .members
            .get(&self.local)
            .is_some_and(|m| m.generation == self.generation);
        if current {
            state.members.remove(&self.local);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::signaling::NegotiationPayload;
    use crate::types::{Role, SessionDescription};
    use pretty_assertions::assert_eq;

    fn info(id: u64) -> ParticipantInfo {
        ParticipantInfo::new(id, format!("p{id}"), Role::Guest)
    }

    #[tokio::test]
    async fn test_join_confirms_and_fans_out() {
        let relay = MemoryRelay::new();
        let session = SessionId::new("call-room");
        let a = relay.connect(info(1));
        let b = relay.connect(info(2));

        a.join_room(&session, &info(1)).await.unwrap();
        assert_eq!(
            a.receive().await.unwrap(),
            ChannelEvent::RoomJoined {
                session_id: session.clone(),
                participants: vec![],
            }
        );

        b.join_room(&session, &info(2)).await.unwrap();
        assert_eq!(
            b.receive().await.unwrap(),
            ChannelEvent::RoomJoined {
                session_id: session.clone(),
                participants: vec![info(1)],
            }
        );
        assert_eq!(
            a.receive().await.unwrap(),
            ChannelEvent::Room(RoomEvent::ParticipantJoined {
                session_id: session.clone(),
                participant: info(2),
            })
        );
        assert_eq!(relay.room_members(&session), vec![ParticipantId(1), ParticipantId(2)]);
    }

    #[tokio::test]
    async fn test_send_fails_while_disconnected() {
        let relay = MemoryRelay::new();
        let a = relay.connect(info(1));
        relay.disconnect(ParticipantId(1));

        assert_eq!(a.receive().await.unwrap(), ChannelEvent::Disconnected);
        let message = SignalingMessage {
            session_id: SessionId::new("s"),
            from: ParticipantId(1),
            to: Some(ParticipantId(2)),
            payload: NegotiationPayload::Offer(SessionDescription::offer("v=0")),
        };
        assert_eq!(
            a.send(ParticipantId(2), message).await,
            Err(SignalingError::ChannelUnavailable)
        );

        a.reconnect().await.unwrap();
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn test_silent_drop_reports_presence_only() {
        let relay = MemoryRelay::new();
        let session = SessionId::new("s");
        let a = relay.connect(info(1));
        let b = relay.connect(info(2));
        a.join_room(&session, &info(1)).await.unwrap();
        b.join_room(&session, &info(2)).await.unwrap();
        let _ = a.receive().await.unwrap();
        let _ = a.receive().await.unwrap();

        relay.drop_silently(ParticipantId(2));
        assert_eq!(
            a.receive().await.unwrap(),
            ChannelEvent::PresenceLost {
                session_id: session.clone(),
                participant_id: ParticipantId(2),
            }
        );
        assert_eq!(relay.room_members(&session), vec![ParticipantId(1)]);
    }

    #[tokio::test]
    async fn test_injected_garbage_is_malformed() {
        let relay = MemoryRelay::new();
        let a = relay.connect(info(1));
        relay.inject_raw(ParticipantId(1), "{not json");
        assert!(matches!(
            a.receive().await,
            Err(SignalingError::MalformedMessage(_))
        ));
    }
}
