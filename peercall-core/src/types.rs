//! Call data model and shared value types

use crate::identity::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

/// Direction of a call relative to the local party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Placed by the local party
    Outgoing,
    /// Received from a remote party
    Incoming,
}

/// Per-session signaling state
///
/// `None -> Progress -> Invite -> Ringing -> Incall -> End`. `End` is
/// absorbing: a new session is needed to call the same peer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingState {
    /// Not started
    None,
    /// Local media acquisition in flight
    Progress,
    /// Invitation sent or received
    Invite,
    /// Remote side is ringing
    Ringing,
    /// Call established
    Incall,
    /// Call finished
    End,
}

impl SignalingState {
    /// Whether the session still takes part in call control
    pub fn is_live(self) -> bool {
        !matches!(self, Self::None | Self::End)
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Progress => "progress",
            Self::Invite => "invite",
            Self::Ringing => "ringing",
            Self::Incall => "incall",
            Self::End => "end",
        };
        f.write_str(s)
    }
}

/// Signaling status code carried by acknowledgements and failure callbacks
///
/// 200-299 is success. Codes above 800 are raised locally by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateCode(pub u16);

impl StateCode {
    /// Request accepted
    pub const OK: Self = Self(200);
    /// Peer unknown to the signaling service
    pub const NOT_FOUND: Self = Self(404);
    /// Callee is busy
    pub const BUSY: Self = Self(486);
    /// Local preconditions failed (offline, not registered)
    pub const NETWORK_NOT_REACHABLE: Self = Self(809);
    /// An outbound signaling message could not be sent
    pub const SIGNALING_START_ERROR: Self = Self(1001);
    /// The media transport could not be created
    pub const RTC_INITIALIZE_FAILED: Self = Self(1002);
    /// Local camera/microphone acquisition failed
    pub const CAMERA_OPEN_FAILED: Self = Self(1003);
    /// The media transport rejected a description or candidate
    pub const WORKER_STATE_EXCEPTION: Self = Self(1004);
    /// Connectivity was not established in time, or ICE failed
    pub const ICE_CONNECTION_FAILED: Self = Self(1005);
    /// Cancel reason: another device of the callee answered
    pub const ANSWER_BY_OTHER: Self = Self(1101);
    /// Cancel reason: another device cancelled
    pub const CANCEL_BY_OTHER: Self = Self(1102);

    /// Whether the code is in the 2xx success range
    pub fn is_success(self) -> bool {
        (200..=299).contains(&self.0)
    }

    /// Raw numeric value
    pub fn code(self) -> u16 {
        self.0
    }
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a call ended, as reported by `on_call_ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Remote side hung up an established call
    Bye,
    /// Our Bye was acknowledged, or the hangup timeout assumed it was
    ByeAck,
    /// Remote side cancelled before the call was established
    Cancel,
    /// Our Cancel was acknowledged
    CancelAck,
    /// Another device of the callee answered
    AnswerByOther,
    /// Another device cancelled the call
    CancelByOther,
    /// Media connection closed underneath the call
    End,
}

impl EndReason {
    /// Wire/display form of the reason
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bye => "bye",
            Self::ByeAck => "bye-ack",
            Self::Cancel => "cancel",
            Self::CancelAck => "cancel-ack",
            Self::AnswerByOther => "answer-by-other",
            Self::CancelByOther => "cancel-by-other",
            Self::End => "end",
        }
    }

    /// Map an optional Cancel reason code to an end reason
    pub fn from_cancel_reason(reason: Option<StateCode>) -> Self {
        match reason {
            Some(StateCode::ANSWER_BY_OTHER) => Self::AnswerByOther,
            Some(StateCode::CANCEL_BY_OTHER) => Self::CancelByOther,
            _ => Self::Cancel,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity-assist (STUN/TURN) server descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Media stream identification tag
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    /// Candidate attribute line
    #[serde(rename = "sdp")]
    pub candidate: String,
}

impl IceCandidate {
    /// Create a candidate bound to an m-line
    pub fn new(sdp_mid: impl Into<String>, sdp_m_line_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: Some(sdp_mid.into()),
            sdp_m_line_index: Some(sdp_m_line_index),
            candidate: candidate.into(),
        }
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Opaque negotiated media-capability payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Directory data exchanged alongside Invite/InviteAck
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// Human-readable label
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
}

/// Media kinds addressed by Consult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone track
    Audio,
    /// Camera track
    Video,
}

/// Side-channel operation carried by Consult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsultOperation {
    /// Re-enable the media kind
    Open,
    /// Pause the media kind
    Close,
    /// Put the call on hold
    Hold,
    /// Take the call off hold
    Resume,
}

/// Payload of a Consult message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultPayload {
    /// Payload version, currently 1
    pub ver: u32,
    /// Target media
    pub media: MediaKind,
    /// Requested operation
    pub operation: ConsultOperation,
}

impl ConsultPayload {
    /// Version understood by this engine
    pub const VERSION: u32 = 1;

    /// Current-version payload
    pub fn new(media: MediaKind, operation: ConsultOperation) -> Self {
        Self {
            ver: Self::VERSION,
            media,
            operation,
        }
    }
}

/// Timing fields of a Reply/ReplyAck latency probe (milliseconds since epoch)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTiming {
    /// When the prober sent the Reply
    pub originate: i64,
    /// When the responder received it
    #[serde(default)]
    pub receive: Option<i64>,
    /// When the responder sent the ReplyAck
    #[serde(default)]
    pub transmit: Option<i64>,
    /// Responder reference clock at receipt
    #[serde(default)]
    pub reference: Option<i64>,
    /// When the prober got the ReplyAck
    #[serde(default)]
    pub local: Option<i64>,
    /// Round trip minus responder processing time
    #[serde(default, rename = "localLatency")]
    pub local_latency: Option<i64>,
    /// Responder processing time
    #[serde(default, rename = "remoteLatency")]
    pub remote_latency: Option<i64>,
}

impl ReplyTiming {
    /// Fill in the prober-side fields once the acknowledgement arrives
    pub fn complete(mut self, now_ms: i64) -> Self {
        self.local = Some(now_ms);
        let receive = self.receive.unwrap_or(self.originate);
        let transmit = self.transmit.unwrap_or(receive);
        let reference = self.reference.unwrap_or(receive);
        // Spans that overflow stay unset
        let processing = transmit.checked_sub(receive);
        self.remote_latency = transmit.checked_sub(reference);
        self.local_latency = now_ms
            .checked_sub(self.originate)
            .zip(processing)
            .and_then(|(round_trip, processing)| round_trip.checked_sub(processing));
        self
    }
}

/// Video resolution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 320x240
    QVGA240,
    /// 640x480
    SD480,
    /// 1280x720
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

/// Constraints handed to local media acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone
    pub audio: bool,
    /// Capture camera
    pub video: bool,
    /// Upper capture resolution
    pub max_resolution: VideoResolution,
    /// Lower frame rate bound
    pub min_frame_rate: u32,
    /// Upper frame rate bound
    pub max_frame_rate: u32,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            max_resolution: VideoResolution::QVGA240,
            min_frame_rate: 8,
            max_frame_rate: 15,
        }
    }

    /// Video call with audio
    pub fn video_call(max_resolution: VideoResolution) -> Self {
        Self {
            video: true,
            max_resolution,
            ..Self::audio_only()
        }
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

/// Invalid data model construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Caller and callee are the same identity
    #[error("caller and callee must differ: {0}")]
    SelfCall(PeerId),
}

/// One party's leg of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    identity: PeerId,
    /// Human-readable label, filled in from directory data
    pub display_name: Option<String>,
    video_enabled: bool,
    session_description: Option<String>,
    ice_servers: Vec<IceServer>,
    candidates: Vec<IceCandidate>,
}

impl Call {
    /// New call leg for `identity`
    pub fn new(identity: PeerId, video_enabled: bool) -> Self {
        Self {
            identity,
            display_name: None,
            video_enabled,
            session_description: None,
            ice_servers: Vec::new(),
            candidates: Vec::new(),
        }
    }

    /// Peer identity of this leg
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Whether video was requested when the call was created
    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Negotiated description contributed by this leg
    pub fn session_description(&self) -> Option<&str> {
        self.session_description.as_deref()
    }

    /// Record this leg's description for the current negotiation round
    ///
    /// Returns `false` and leaves the stored value untouched if a
    /// description was already recorded; use
    /// [`Call::replace_session_description`] when renegotiating.
    pub fn set_session_description(&mut self, sdp: impl Into<String>) -> bool {
        if self.session_description.is_some() {
            return false;
        }
        self.session_description = Some(sdp.into());
        true
    }

    /// Replace the description during an explicit renegotiation
    pub fn replace_session_description(&mut self, sdp: Option<String>) {
        self.session_description = sdp;
    }

    /// Connectivity-assist servers
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Set the servers at invite time; later calls are ignored
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        if self.ice_servers.is_empty() {
            self.ice_servers = servers;
        }
    }

    /// Candidates contributed by this leg, in arrival order
    pub fn candidates(&self) -> &[IceCandidate] {
        &self.candidates
    }

    /// Append a candidate
    pub fn add_candidate(&mut self, candidate: IceCandidate) {
        self.candidates.push(candidate);
    }
}

/// Per-peer unit of call state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier, used for log correlation
    pub call_id: CallId,
    caller: Call,
    callee: Call,
    direction: CallDirection,
    invite_timestamp: Option<DateTime<Utc>>,
    in_call_timestamp: Option<DateTime<Utc>>,
    end_timestamp: Option<DateTime<Utc>>,
    /// Callee-busy flag
    pub busy: bool,
    /// Current signaling state
    pub state: SignalingState,
}

impl CallSession {
    /// Session for a call the local party places to `remote`
    ///
    /// # Errors
    ///
    /// Returns error if both identities are equal
    pub fn outgoing(local: PeerId, remote: PeerId, video: bool) -> Result<Self, SessionError> {
        Self::build(Call::new(local, video), Call::new(remote, video), CallDirection::Outgoing)
    }

    /// Session for a call `remote` places to the local party
    ///
    /// # Errors
    ///
    /// Returns error if both identities are equal
    pub fn incoming(remote: PeerId, local: PeerId, video: bool) -> Result<Self, SessionError> {
        Self::build(Call::new(remote, video), Call::new(local, video), CallDirection::Incoming)
    }

    fn build(caller: Call, callee: Call, direction: CallDirection) -> Result<Self, SessionError> {
        if caller.identity == callee.identity {
            return Err(SessionError::SelfCall(caller.identity));
        }
        Ok(Self {
            call_id: CallId::new(),
            caller,
            callee,
            direction,
            invite_timestamp: None,
            in_call_timestamp: None,
            end_timestamp: None,
            busy: false,
            state: SignalingState::None,
        })
    }

    /// Calling party
    pub fn caller(&self) -> &Call {
        &self.caller
    }

    /// Called party
    pub fn callee(&self) -> &Call {
        &self.callee
    }

    /// Direction, fixed at creation
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Whether the local party placed the call
    pub fn is_initiator(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// The local party's leg
    pub fn local(&self) -> &Call {
        match self.direction {
            CallDirection::Outgoing => &self.caller,
            CallDirection::Incoming => &self.callee,
        }
    }

    /// The local party's leg, mutably
    pub fn local_mut(&mut self) -> &mut Call {
        match self.direction {
            CallDirection::Outgoing => &mut self.caller,
            CallDirection::Incoming => &mut self.callee,
        }
    }

    /// The remote party's leg
    pub fn remote(&self) -> &Call {
        match self.direction {
            CallDirection::Outgoing => &self.callee,
            CallDirection::Incoming => &self.caller,
        }
    }

    /// The remote party's leg, mutably
    pub fn remote_mut(&mut self) -> &mut Call {
        match self.direction {
            CallDirection::Outgoing => &mut self.callee,
            CallDirection::Incoming => &mut self.caller,
        }
    }

    /// Remote peer identity, the session map key
    pub fn peer(&self) -> &PeerId {
        self.remote().identity()
    }

    /// When the invite was sent or received
    pub fn invite_timestamp(&self) -> Option<DateTime<Utc>> {
        self.invite_timestamp
    }

    /// When the call was established
    pub fn in_call_timestamp(&self) -> Option<DateTime<Utc>> {
        self.in_call_timestamp
    }

    /// When the call ended
    pub fn end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.end_timestamp
    }

    /// Stamp the invite time; the first stamp wins
    pub fn mark_invited(&mut self, at: DateTime<Utc>) {
        stamp(&mut self.invite_timestamp, at);
    }

    /// Stamp the connect time; the first stamp wins
    pub fn mark_in_call(&mut self, at: DateTime<Utc>) {
        stamp(&mut self.in_call_timestamp, at);
    }

    /// Stamp the end time; the first stamp wins
    pub fn mark_ended(&mut self, at: DateTime<Utc>) {
        stamp(&mut self.end_timestamp, at);
    }

    /// Time spent in call
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.in_call_timestamp?;
        Some(self.end_timestamp.unwrap_or_else(Utc::now) - start)
    }
}

fn stamp(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if slot.is_none() {
        *slot = Some(at);
    }
}

/// Default connectivity-assist servers
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
    ]
}
