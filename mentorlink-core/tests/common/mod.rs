//! Shared fixtures for session-level tests

#![allow(dead_code)]

use mentorlink_core::relay::MemoryRelay;
use mentorlink_core::testing::{FakeDevices, FakeTransportFactory};
use mentorlink_core::{
    CallConfig, CallEvent, CallSession, ParticipantId, ParticipantInfo, Role, SessionId,
    SignalingChannel,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const ROOM: &str = "call-mentorship-42";

/// One participant with its own engine fakes
pub struct Peer {
    pub session: CallSession,
    pub events: broadcast::Receiver<CallEvent>,
    pub factory: Arc<FakeTransportFactory>,
    pub devices: Arc<FakeDevices>,
}

impl Peer {
    pub fn id(&self) -> ParticipantId {
        self.session.local().id
    }
}

pub fn info(id: u64) -> ParticipantInfo {
    match id {
        1 => ParticipantInfo::new(1, "Ada", Role::Mentor),
        2 => ParticipantInfo::new(2, "Grace", Role::Mentee),
        _ => ParticipantInfo::new(id, format!("guest-{id}"), Role::Guest),
    }
}

pub fn peer(relay: &MemoryRelay, id: u64) -> Peer {
    peer_with_config(relay, id, CallConfig::default())
}

pub fn peer_with_config(relay: &MemoryRelay, id: u64, config: CallConfig) -> Peer {
    peer_on_channel(id, relay.connect(info(id)), config)
}

/// Participant `id` speaking over an arbitrary channel
pub fn peer_on_channel(id: u64, channel: Arc<dyn SignalingChannel>, config: CallConfig) -> Peer {
    let local = info(id);
    let factory = Arc::new(FakeTransportFactory::new());
    let devices = Arc::new(FakeDevices::new());
    let session = CallSession::builder(
        local,
        channel,
        Arc::clone(&factory) as _,
        Arc::clone(&devices) as _,
    )
    .with_config(config)
    .with_session_id(SessionId::new(ROOM))
    .build()
    .unwrap();
    let events = session.subscribe();
    Peer {
        session,
        events,
        factory,
        devices,
    }
}

/// Mentor (1) and mentee (2), joined in that order and connected
pub async fn connected_pair(relay: &MemoryRelay) -> (Peer, Peer) {
    connected_pair_with_config(relay, CallConfig::default()).await
}

pub async fn connected_pair_with_config(relay: &MemoryRelay, config: CallConfig) -> (Peer, Peer) {
    let mut a = peer_with_config(relay, 1, config.clone());
    let mut b = peer_with_config(relay, 2, config);
    a.session.join().await.unwrap();
    b.session.join().await.unwrap();
    wait_for(&mut a.events, |e| {
        matches!(e, CallEvent::PeerConnected { peer } if *peer == ParticipantId(2))
    })
    .await;
    wait_for(&mut b.events, |e| {
        matches!(e, CallEvent::PeerConnected { peer } if *peer == ParticipantId(1))
    })
    .await;
    (a, b)
}

/// Next event matching `pred`; panics after 30s
pub async fn wait_for<F>(events: &mut broadcast::Receiver<CallEvent>, pred: F) -> CallEvent
where
    F: Fn(&CallEvent) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await;
    found.unwrap()
}

/// Events already queued, without waiting
pub fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Poll `cond` until it holds; panics after 30s
pub async fn eventually<F>(cond: F)
where
    F: Fn() -> bool,
{
    let reached = tokio::time::timeout(Duration::from_secs(30), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached in time");
}

/// Let spawned tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
