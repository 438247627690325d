//! Peercall - peer-to-peer call signaling engine
//!
//! This library drives one-to-one audio/video calls between peers that reach
//! each other over an application-provided signaling channel. It features:
//!
//! - **Per-peer call state machine**: `None -> Progress -> Invite -> Ringing -> Incall -> End`
//! - **Offer/answer coordination**: ordered descriptions and buffered connectivity candidates
//! - **Self-healing hangup**: every hangup ends locally even if the peer never acknowledges
//! - **Pluggable collaborators**: signaling channel, media transport and lifecycle delegate are traits
//! - **In-process loopback**: simulated network and media for demos and tests
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let network = LoopbackNetwork::new();
//! let signaling = Arc::new(SignalingHandler::new(Arc::new(network.join("alice"))));
//! let delegate = Arc::new(BroadcastDelegate::default());
//! let mut events = delegate.subscribe();
//!
//! let engine = Arc::new(
//!     SignalingEngine::builder(signaling, Arc::new(SimulatedMediaFactory::new()))
//!         .with_config(EngineConfig::new("alice"))
//!         .with_delegate(delegate)
//!         .build()?,
//! );
//! let pump = engine.clone();
//! tokio::spawn(async move { pump.run().await });
//!
//! engine.make_call(PeerId::new("bob"), true).await;
//! while let Ok(event) = events.recv().await {
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
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

/// Peer identity
pub mod identity;

/// Call data model and shared value types
pub mod types;

/// Session description helpers
pub mod sdp;

/// Pending connectivity candidates
pub mod candidate_buffer;

/// Media transport collaborator
pub mod media;

/// Offer/answer ordering
pub mod negotiation;

/// Signaling protocol and handlers
pub mod signaling;

/// Lifecycle notifications
pub mod delegate;

mod session;

/// Signaling engine orchestration
pub mod engine;

/// In-process signaling network and simulated media
pub mod loopback;

// Re-export main types at crate root
pub use candidate_buffer::{CandidateBuffer, CandidateSink};
pub use delegate::{BroadcastDelegate, CallDelegate, CallEvent, NoopDelegate, RecordingDelegate};
pub use engine::{EngineConfig, EngineError, ReplyCallback, SignalingEngine, SignalingEngineBuilder, VideoConfig};
pub use identity::PeerId;
pub use loopback::{
    Envelope, LoopbackNetwork, LoopbackTransport, SimulatedMediaFactory, SimulatedMediaOptions,
    SimulatedMediaTransport,
};
pub use media::{
    ConnectionState, LocalMedia, MediaError, MediaEvent, MediaEventSink, MediaTransport, MediaTransportFactory,
};
pub use negotiation::{NegotiationCoordinator, NegotiationError, NegotiationPhase};
pub use sdp::BandwidthHints;
pub use signaling::{SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::delegate::{BroadcastDelegate, CallDelegate, CallEvent, RecordingDelegate};
    pub use crate::engine::{EngineConfig, SignalingEngine, SignalingEngineBuilder};
    pub use crate::identity::PeerId;
    pub use crate::loopback::{LoopbackNetwork, SimulatedMediaFactory};
    pub use crate::media::{MediaTransport, MediaTransportFactory};
    pub use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
    pub use crate::types::{
        CallDirection, CallSession, ConsultOperation, EndReason, MediaKind, SignalingState, StateCode,
    };
}
