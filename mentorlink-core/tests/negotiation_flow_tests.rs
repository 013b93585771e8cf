//! Negotiation over the relay: ICE ordering, malformed traffic, track swaps

mod common;

use common::{connected_pair, eventually, info, peer, wait_for, ROOM};
use mentorlink_core::relay::MemoryRelay;
use mentorlink_core::{
    CallEvent, ChannelEvent, IceCandidate, MediaKind, MessageType, NegotiationPayload,
    NegotiationState, ParticipantId, SessionDescription, SessionId, SessionStatus,
    SignalingChannel, SignalingMessage,
};
use pretty_assertions::assert_eq;

fn from_raw(payload: NegotiationPayload) -> SignalingMessage {
    SignalingMessage {
        session_id: SessionId::new(ROOM),
        from: ParticipantId(1),
        to: Some(ParticipantId(2)),
        payload,
    }
}

fn candidate(port: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{port} 1 udp 2130706431 10.0.0.7 {port} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}

#[tokio::test]
async fn early_candidates_apply_after_offer_in_arrival_order() {
    let relay = MemoryRelay::new();
    let b = peer(&relay, 2);
    b.session.join().await.unwrap();

    // Participant 1 speaks raw frames through its own relay socket.
    let raw = relay.connect(info(1));
    raw.join_room(&SessionId::new(ROOM), &info(1)).await.unwrap();
    eventually(|| b.session.link_count() == 1).await;

    for port in [50_001, 50_002] {
        raw.send(
            ParticipantId(2),
            from_raw(NegotiationPayload::IceCandidate(candidate(port))),
        )
        .await
        .unwrap();
    }
    let link = b.session.link(ParticipantId(1)).unwrap();
    eventually(|| link.buffered_candidates() == 2).await;

    let transport = b.factory.transport_for(ParticipantId(1)).unwrap();
    assert!(transport.applied_candidates().is_empty());

    raw.send(
        ParticipantId(2),
        from_raw(NegotiationPayload::Offer(SessionDescription::offer("v=0 raw"))),
    )
    .await
    .unwrap();
    eventually(|| transport.applied_candidates().len() == 2).await;
    assert_eq!(
        transport.applied_candidates(),
        vec![candidate(50_001), candidate(50_002)]
    );
    assert_eq!(link.buffered_candidates(), 0);

    // The offer is answered back to the raw socket.
    loop {
        if let ChannelEvent::Negotiation(message) = raw.receive().await.unwrap() {
            if message.message_type() == MessageType::Answer {
                assert_eq!(message.from, ParticipantId(2));
                break;
            }
        }
    }
    assert_eq!(link.state(), NegotiationState::Stable);
}

#[tokio::test]
async fn offer_from_unlisted_peer_creates_link() {
    let relay = MemoryRelay::new();
    let b = peer(&relay, 2);
    b.session.join().await.unwrap();

    let raw = relay.connect(info(7));
    raw.send(
        ParticipantId(2),
        SignalingMessage {
            session_id: SessionId::new(ROOM),
            from: ParticipantId(7),
            to: Some(ParticipantId(2)),
            payload: NegotiationPayload::Offer(SessionDescription::offer("v=0 late")),
        },
    )
    .await
    .unwrap();

    eventually(|| b.session.peer_state(ParticipantId(7)) == Some(NegotiationState::Stable)).await;
    let roster = b.session.snapshot().participants;
    assert!(roster.iter().any(|p| p.id == ParticipantId(7)));
    assert_eq!(relay.sent_count(ParticipantId(2), MessageType::Answer), 1);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_side_effects() {
    let relay = MemoryRelay::new();
    let (mut a, b) = connected_pair(&relay).await;
    let before = b.session.snapshot();

    relay.inject_raw(ParticipantId(2), "{not json");
    relay.inject_raw(ParticipantId(2), r#"{"type":"teleport"}"#);
    relay.inject_raw(
        ParticipantId(2),
        r#"{"type":"offer","sessionId":"call-mentorship-42"}"#,
    );
    eventually(|| b.session.dropped_messages() == 3).await;

    assert_eq!(b.session.status(), SessionStatus::Connected);
    assert_eq!(b.session.snapshot().participants, before.participants);
    assert_eq!(b.session.peer_state(ParticipantId(1)), Some(NegotiationState::Stable));

    // Valid traffic still flows afterwards.
    a.session.retry_peer(ParticipantId(2)).await.unwrap();
    wait_for(&mut a.events, |e| {
        matches!(e, CallEvent::PeerConnected { peer } if *peer == ParticipantId(2))
    })
    .await;
    assert_eq!(relay.sent_count(ParticipantId(1), MessageType::Offer), 2);
}

#[tokio::test]
async fn screen_share_swaps_video_without_renegotiation() {
    let relay = MemoryRelay::new();
    let (mut a, _b) = connected_pair(&relay).await;
    let transport = a.factory.transport_for(ParticipantId(2)).unwrap();
    let before = a.session.tracks().unwrap();
    let camera = before.camera.clone().unwrap();
    let microphone = before.microphone.clone().unwrap();

    a.session.start_screen_share().await.unwrap();
    wait_for(&mut a.events, |e| matches!(e, CallEvent::ScreenShareStarted)).await;
    let sharing = a.session.tracks().unwrap();
    let screen = sharing.screen.clone().unwrap();
    assert_eq!(transport.video_track(), Some(screen.id().to_string()));
    assert_eq!(a.session.status(), SessionStatus::Connected);

    a.session.stop_screen_share().await.unwrap();
    wait_for(&mut a.events, |e| matches!(e, CallEvent::ScreenShareStopped)).await;
    let after = a.session.tracks().unwrap();
    assert!(screen.is_stopped());
    assert!(after.screen.is_none());
    assert_eq!(after.camera.unwrap().id(), camera.id());
    assert!(!camera.is_stopped());
    assert_eq!(after.microphone.unwrap().id(), microphone.id());
    assert_eq!(transport.video_track(), Some(camera.id().to_string()));

    assert_eq!(relay.sent_count(ParticipantId(1), MessageType::Offer), 1);
    assert_eq!(transport.offers_created(), 1);
    assert_eq!(a.session.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn screen_share_refusal_keeps_camera() {
    let relay = MemoryRelay::new();
    let (a, _b) = connected_pair(&relay).await;
    let transport = a.factory.transport_for(ParticipantId(2)).unwrap();
    let camera = a.session.tracks().unwrap().camera.unwrap();

    a.devices.deny_display(true);
    assert!(a.session.start_screen_share().await.is_err());
    assert_eq!(transport.video_track(), Some(camera.id().to_string()));
    assert!(!a.session.tracks().unwrap().is_sharing_screen());
    assert_eq!(a.session.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn muting_is_local_only() {
    let relay = MemoryRelay::new();
    let (a, _b) = connected_pair(&relay).await;
    let frames = relay.history().len();

    a.session.toggle_track(MediaKind::Audio, false).unwrap();
    a.session.toggle_track(MediaKind::Video, false).unwrap();
    let tracks = a.session.tracks().unwrap();
    assert!(!tracks.microphone.unwrap().is_enabled());
    assert!(!tracks.camera.unwrap().is_enabled());
    assert_eq!(a.devices.live_captures(), 2);

    a.session.release_camera();
    assert_eq!(a.devices.live_captures(), 1);
    assert_eq!(relay.history().len(), frames);
}
