//! Call signaling protocol
//!
//! Defines the actions exchanged between two signaling engines and the
//! transport seam they travel over.

use crate::identity::PeerId;
use crate::types::{ConsultPayload, IceCandidate, IceServer, PeerProfile, ReplyTiming, StateCode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Message failed validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Destination is not reachable over this transport
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    /// Message was dropped in transit
    #[error("Message dropped: {0}")]
    Dropped(&'static str),

    /// Transport shut down
    #[error("Signaling transport closed")]
    Closed,
}

/// Signaling transport trait
///
/// Implement this for the channel connecting engines (websocket relay,
/// message bus, in-process loopback). The channel is assumed ordered and
/// at-least-once; sends may fail.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a signaling message
    async fn send_message(&self, peer: &PeerId, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Receive the next signaling message and the peer it came from
    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), Self::Error>;
}

/// Signaling actions
///
/// Peer fields carry the sender's identity as the sender sees it; the
/// engine demultiplexes on the transport-level origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Call invitation carrying the caller's offer
    Invite {
        /// Calling party
        caller: PeerId,
        /// Called party
        callee: PeerId,
        /// Offer description
        sdp: String,
        /// Connectivity-assist servers the caller uses
        #[serde(default)]
        ice_servers: Vec<IceServer>,
        /// Caller directory data
        #[serde(default)]
        caller_data: PeerProfile,
    },

    /// Invitation outcome
    InviteAck {
        /// Status code
        state: StateCode,
        /// Called party
        callee: PeerId,
        /// Callee directory data
        #[serde(default)]
        callee_data: PeerProfile,
    },

    /// Answer carrying the callee's description
    Answer {
        /// Calling party
        caller: PeerId,
        /// Called party
        callee: PeerId,
        /// Answer description
        sdp: String,
    },

    /// Answer outcome
    AnswerAck {
        /// Status code
        state: StateCode,
        /// Calling party
        caller: PeerId,
    },

    /// Hang up an established call
    Bye {
        /// Sender
        peer: PeerId,
    },

    /// Hang-up acknowledgement
    ByeAck {
        /// Sender
        peer: PeerId,
    },

    /// Abandon a call before it was established
    Cancel {
        /// Sender
        peer: PeerId,
        /// Optional reason code
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<StateCode>,
    },

    /// Cancel acknowledgement
    CancelAck {
        /// Sender
        peer: PeerId,
    },

    /// Connectivity candidate
    Candidate {
        /// Sender
        peer: PeerId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// Candidate acknowledgement
    CandidateAck {
        /// Sender
        peer: PeerId,
    },

    /// In-call media hint
    Consult {
        /// Sender
        peer: PeerId,
        /// Requested change
        payload: ConsultPayload,
    },

    /// Consult acknowledgement
    ConsultAck {
        /// Sender
        peer: PeerId,
    },

    /// Latency probe
    Reply {
        /// Prober
        from: PeerId,
        /// Responder
        to: PeerId,
        /// Timing fields
        timing: ReplyTiming,
    },

    /// Latency probe answer
    ReplyAck {
        /// Responder
        from: PeerId,
        /// Prober
        to: PeerId,
        /// Timing fields with responder times filled in
        timing: ReplyTiming,
    },

    /// Callee-initiated call: the callee sends an offer and the caller answers
    ReverseCall {
        /// Party sending the offer
        caller: PeerId,
        /// Offer description
        sdp: String,
        /// Connectivity-assist servers
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
}

impl SignalingMessage {
    /// Action name, used in logs
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "invite",
            Self::InviteAck { .. } => "invite_ack",
            Self::Answer { .. } => "answer",
            Self::AnswerAck { .. } => "answer_ack",
            Self::Bye { .. } => "bye",
            Self::ByeAck { .. } => "bye_ack",
            Self::Cancel { .. } => "cancel",
            Self::CancelAck { .. } => "cancel_ack",
            Self::Candidate { .. } => "candidate",
            Self::CandidateAck { .. } => "candidate_ack",
            Self::Consult { .. } => "consult",
            Self::ConsultAck { .. } => "consult_ack",
            Self::Reply { .. } => "reply",
            Self::ReplyAck { .. } => "reply_ack",
            Self::ReverseCall { .. } => "reverse_call",
        }
    }

    /// Whether the message acknowledges an earlier one
    #[must_use]
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            Self::InviteAck { .. }
                | Self::AnswerAck { .. }
                | Self::ByeAck { .. }
                | Self::CancelAck { .. }
                | Self::CandidateAck { .. }
                | Self::ConsultAck { .. }
                | Self::ReplyAck { .. }
        )
    }

    /// Structural checks applied before dispatch
    ///
    /// # Errors
    ///
    /// Returns error if a description is empty or a candidate has no body
    pub fn validate(&self) -> Result<(), SignalingError> {
        match self {
            Self::Invite { sdp, .. } | Self::Answer { sdp, .. } | Self::ReverseCall { sdp, .. }
                if sdp.trim().is_empty() =>
            {
                Err(SignalingError::InvalidMessage(format!(
                    "{} without session description",
                    self.action()
                )))
            }
            Self::Candidate { candidate, .. } if candidate.candidate.trim().is_empty() => {
                Err(SignalingError::InvalidMessage("empty candidate".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Minimum time between messages (10ms for 100 msg/sec rate limit)
const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(10);

/// Signaling handler with rate limiting
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    last_receive_time: Arc<tokio::sync::Mutex<Instant>>,
    error_count: Arc<tokio::sync::Mutex<u32>>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            last_receive_time: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            error_count: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    /// Send a signaling message to a peer
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(peer = %peer, action = message.action()))]
    pub async fn send_message(&self, peer: &PeerId, message: SignalingMessage) -> Result<(), T::Error> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(peer, message).await
    }

    /// Receive a signaling message with rate limiting and backpressure
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), T::Error> {
        let mut last_time = self.last_receive_time.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_time);

        if elapsed < MIN_MESSAGE_INTERVAL {
            let sleep_duration = MIN_MESSAGE_INTERVAL - elapsed;
            tracing::trace!(sleep_ms = sleep_duration.as_millis(), "Rate limiting applied");
            drop(last_time);
            sleep(sleep_duration).await;
            last_time = self.last_receive_time.lock().await;
        }

        *last_time = Instant::now();
        drop(last_time);

        tracing::trace!("Waiting for signaling message");

        match self.transport.receive_message().await {
            Ok(result) => {
                let mut error_count = self.error_count.lock().await;
                *error_count = 0;
                drop(error_count);

                tracing::debug!(peer = %result.0, action = result.1.action(), "Received signaling message");
                Ok(result)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    "Error receiving message, applying exponential backoff"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}
