//! MentorLink - real-time call negotiation core
//!
//! This library drives one-to-one and small-group mentorship calls. It owns
//! the parts of a call that have to be correct regardless of the media
//! engine underneath:
//!
//! - **Peer negotiation**: offer/answer and ICE exchange per remote
//!   participant, with deterministic glare resolution
//! - **Media tracks**: camera, microphone and screen-share lifecycle with
//!   guaranteed device release
//! - **Session lifecycle**: join, roster tracking, presence loss and a
//!   single idempotent teardown
//! - **Quality monitoring**: windowed packet-loss reporting per peer
//!
//! Signaling, the media engine and the REST collaborators are consumed
//! through traits ([`SignalingChannel`], [`TransportFactory`],
//! [`MediaDevices`], [`CallApi`]). The `webrtc-engine` feature provides a
//! webrtc-rs implementation, and [`testing`] an in-process one.
//!
//! # Examples
//!
//! ```rust,no_run
//! use mentorlink_core::prelude::*;
//! use mentorlink_core::relay::MemoryRelay;
//! use mentorlink_core::testing::{FakeDevices, FakeTransportFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//! let mentor = ParticipantInfo::new(1, "Ada", Role::Mentor);
//! let channel = relay.connect(mentor.clone());
//!
//! let session = CallSession::builder(
//!     mentor,
//!     channel,
//!     Arc::new(FakeTransportFactory::new()),
//!     Arc::new(FakeDevices::new()),
//! )
//! .with_session_id(SessionId::new("mentorship-42"))
//! .build()?;
//!
//! session.join().await?;
//! session.start_screen_share().await?;
//! session.end(EndReason::LocalHangup).await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Identifiers, roster, media and event types
pub mod types;

/// Signaling channel seam, wire frames and message handler
pub mod signaling;

/// In-process signaling relay
pub mod relay;

/// Peer transport seam over the media engine
pub mod peer_transport;

/// Per-peer offer/answer state machine
pub mod negotiation;

/// Local capture and track lifecycle
pub mod media;

/// Call session orchestration
pub mod call;

/// Packet loss monitoring
pub mod monitor;

/// Teardown, presence and reconnect supervision
pub mod supervisor;

/// Call REST collaborators
pub mod api;

/// Configuration loading and validation
pub mod config;

/// Scriptable engine for tests and simulation
pub mod testing;

/// webrtc-rs backed engine (requires webrtc-engine feature)
#[cfg(feature = "webrtc-engine")]
pub mod rtc;

// Re-export main types at crate root
pub use api::{resolve_ice_servers, ApiError, CallApi, CallContext, CallRequest, CallSummary};
#[cfg(feature = "http-api")]
pub use api::HttpCallApi;
pub use call::{CallError, CallSession, CallSessionBuilder, ConnectionError};
pub use config::{CallConfig, ConfigError, MonitorConfig, ReconnectPolicy, SupervisorConfig};
pub use media::{
    CaptureDevice, DeviceError, MediaDevices, MediaError, MediaEvent, MediaTrack,
    MediaTrackController, MediaTrackSet,
};
pub use monitor::ConnectionMonitor;
pub use negotiation::{NegotiationError, PeerLink};
pub use peer_transport::{
    OpenedTransport, PeerTransport, TransportError, TransportEvent, TransportFactory,
    TransportState,
};
#[cfg(feature = "webrtc-engine")]
pub use rtc::{RtcTransportFactory, SyntheticDevices};
pub use signaling::{
    ChannelEvent, MessageType, NegotiationPayload, RoomEvent, SignalingChannel, SignalingError,
    SignalingHandler, SignalingMessage,
};
pub use supervisor::{CleanupSupervisor, TeardownGuard};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallSession};
    pub use crate::config::CallConfig;
    pub use crate::media::MediaDevices;
    pub use crate::peer_transport::TransportFactory;
    pub use crate::signaling::{SignalingChannel, SignalingHandler};
    pub use crate::types::{
        CallEvent, EndReason, MediaConstraints, MediaKind, ParticipantId, ParticipantInfo, Role,
        SessionId, SessionStatus,
    };
}
