//! Media transport collaborator
//!
//! The engine never touches audio/video itself. It drives a media transport
//! (a peer connection in WebRTC terms) through [`MediaTransport`] and reacts
//! to the [`MediaEvent`]s the transport reports through its
//! [`MediaEventSink`].
//!
//! Events are delivered into the owning session's serialized queue, so a
//! transport may emit from any thread at any time.

use crate::candidate_buffer::CandidateSink;
use crate::identity::PeerId;
use crate::types::{IceCandidate, IceServer, MediaConstraints, MediaKind, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Media transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The transport could not be created
    #[error("Media transport initialization failed: {0}")]
    InitFailed(String),

    /// Local capture devices could not be opened or permission was denied
    #[error("Local media unavailable: {0}")]
    DeviceUnavailable(String),

    /// A description or candidate was rejected
    #[error("Rejected by media transport: {0}")]
    Rejected(String),

    /// The transport was already closed
    #[error("Media transport closed")]
    Closed,
}

/// Handle to captured local media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    /// Stream identifier assigned by the transport
    pub id: String,
    /// Microphone captured
    pub audio: bool,
    /// Camera captured
    pub video: bool,
}

/// Connectivity state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Gathering not started
    New,
    /// Connectivity checks running
    Checking,
    /// A working candidate pair exists
    Connected,
    /// Checks finished with a working pair
    Completed,
    /// Connectivity lost
    Disconnected,
    /// Connectivity could not be established
    Failed,
    /// Transport shut down
    Closed,
}

impl ConnectionState {
    /// Media can flow
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// Callback surface of the media transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Local media was attached and an offer is needed
    NegotiationNeeded,
    /// A local candidate was gathered
    CandidateGenerated(IceCandidate),
    /// Connectivity state changed
    ConnectionStateChanged(ConnectionState),
    /// Remote media started arriving
    RemoteMediaAdded,
    /// Remote media went away
    RemoteMediaRemoved,
}

/// Delivery handle for [`MediaEvent`]s, handed to the transport at creation
#[derive(Clone)]
pub struct MediaEventSink {
    deliver: Arc<dyn Fn(MediaEvent) + Send + Sync>,
}

impl MediaEventSink {
    /// Sink that forwards each event to `deliver`
    pub fn new(deliver: impl Fn(MediaEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Sink that discards everything
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Report an event
    pub fn emit(&self, event: MediaEvent) {
        (self.deliver)(event);
    }
}

impl fmt::Debug for MediaEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaEventSink").finish_non_exhaustive()
    }
}

/// Operations the engine invokes on the media transport
///
/// Every method may suspend. The engine never calls two of them concurrently
/// for the same session.
#[async_trait]
pub trait MediaTransport: CandidateSink {
    /// Capture local camera/microphone; may wait on user permission
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;

    /// Attach captured media; the transport answers with
    /// [`MediaEvent::NegotiationNeeded`]
    async fn add_local_media(&self, media: LocalMedia) -> Result<(), MediaError>;

    /// Create an offer description
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create an answer description for the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Commit the local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    /// Enable or disable the local track of one media kind
    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), MediaError>;

    /// Release capture devices and tear the connection down
    async fn close(&self);
}

/// Creates one media transport per call session
pub trait MediaTransportFactory: Send + Sync {
    /// Build a transport for `peer`
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be initialized
    fn create(
        &self,
        peer: &PeerId,
        ice_servers: &[IceServer],
        events: MediaEventSink,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;
}
