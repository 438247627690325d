//! Signaling engine orchestration
//!
//! [`SignalingEngine`] owns the peer-to-session map, accepts local call
//! control, demultiplexes inbound signaling onto the per-session tasks and
//! runs the engine-wide latency probe.

use crate::delegate::{CallDelegate, NoopDelegate};
use crate::identity::PeerId;
use crate::media::MediaTransportFactory;
use crate::sdp::{has_video, BandwidthHints};
use crate::session::{self, Command, SessionEvent, SessionHandle};
use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{
    default_ice_servers, CallSession, ConsultOperation, ConsultPayload, IceServer, MediaConstraints, MediaKind,
    PeerProfile, ReplyTiming, SignalingState, VideoResolution,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration text could not be parsed
    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Capture settings for the two call roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Capture ceiling when placing a call
    pub invite_resolution: VideoResolution,
    /// Capture ceiling when answering
    pub answer_resolution: VideoResolution,
    /// Lower frame rate bound
    pub min_frame_rate: u32,
    /// Upper frame rate bound
    pub max_frame_rate: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            invite_resolution: VideoResolution::QVGA240,
            answer_resolution: VideoResolution::SD480,
            min_frame_rate: 8,
            max_frame_rate: 15,
        }
    }
}

impl VideoConfig {
    /// Constraints used when placing a call
    pub fn invite_constraints(&self, video: bool) -> MediaConstraints {
        self.constraints(video, self.invite_resolution)
    }

    /// Constraints used when answering
    pub fn answer_constraints(&self, video: bool) -> MediaConstraints {
        self.constraints(video, self.answer_resolution)
    }

    fn constraints(&self, video: bool, resolution: VideoResolution) -> MediaConstraints {
        let base = if video {
            MediaConstraints::video_call(resolution)
        } else {
            MediaConstraints::audio_only()
        };
        MediaConstraints {
            min_frame_rate: self.min_frame_rate,
            max_frame_rate: self.max_frame_rate,
            ..base
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity of the local party
    pub local_id: PeerId,
    /// Label sent to peers in Invite/InviteAck
    pub display_name: Option<String>,
    /// Wait for a Bye/Cancel acknowledgement before assuming delivery
    pub hangup_timeout_ms: u64,
    /// Wait for connectivity after the answer before failing the call
    pub ice_timeout_ms: u64,
    /// Audio bandwidth cap written into descriptions
    pub audio_bandwidth_kbps: u32,
    /// Video bandwidth cap written into descriptions
    pub video_bandwidth_kbps: u32,
    /// Refuse new outgoing calls while any call is live
    pub single_active_call: bool,
    /// Answer inbound invites without user action
    pub auto_answer: bool,
    /// Connectivity-assist servers
    pub ice_servers: Vec<IceServer>,
    /// Capture settings
    pub video: VideoConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_id: PeerId::new(""),
            display_name: None,
            hangup_timeout_ms: 5_000,
            ice_timeout_ms: 15_000,
            audio_bandwidth_kbps: 70,
            video_bandwidth_kbps: 512,
            single_active_call: true,
            auto_answer: false,
            ice_servers: default_ice_servers(),
            video: VideoConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration for `local_id`
    pub fn new(local_id: impl Into<PeerId>) -> Self {
        Self {
            local_id: local_id.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON for this structure or the
    /// result fails validation
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for unusable values
    ///
    /// # Errors
    ///
    /// Returns error naming the first offending field
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.local_id.as_str().trim().is_empty() {
            return Err(EngineError::InvalidConfig("local_id must not be empty".into()));
        }
        if self.hangup_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig("hangup_timeout_ms must be positive".into()));
        }
        if self.ice_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig("ice_timeout_ms must be positive".into()));
        }
        if self.audio_bandwidth_kbps == 0 || self.video_bandwidth_kbps == 0 {
            return Err(EngineError::InvalidConfig("bandwidth caps must be positive".into()));
        }
        if self.video.min_frame_rate > self.video.max_frame_rate {
            return Err(EngineError::InvalidConfig(
                "min_frame_rate must not exceed max_frame_rate".into(),
            ));
        }
        Ok(())
    }

    /// Hangup timeout as a duration
    pub fn hangup_timeout(&self) -> Duration {
        Duration::from_millis(self.hangup_timeout_ms)
    }

    /// ICE timeout as a duration
    pub fn ice_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_timeout_ms)
    }

    /// Bandwidth caps as annotation hints
    pub fn bandwidth(&self) -> BandwidthHints {
        BandwidthHints {
            audio_kbps: self.audio_bandwidth_kbps,
            video_kbps: self.video_bandwidth_kbps,
        }
    }
}

/// State shared between the engine and its session tasks
pub(crate) struct EngineContext<T: SignalingTransport> {
    pub(crate) local: PeerId,
    pub(crate) profile: PeerProfile,
    pub(crate) config: EngineConfig,
    pub(crate) signaling: Arc<SignalingHandler<T>>,
    pub(crate) media: Arc<dyn MediaTransportFactory>,
    pub(crate) delegate: Arc<dyn CallDelegate>,
    pub(crate) bandwidth: RwLock<BandwidthHints>,
    auto_answer: AtomicBool,
    sessions: RwLock<HashMap<PeerId, SessionHandle>>,
    next_generation: AtomicU64,
}

impl<T: SignalingTransport> EngineContext<T> {
    pub(crate) fn auto_answer(&self) -> bool {
        self.auto_answer.load(Ordering::Relaxed)
    }

    /// Remove `peer` from the map if it still maps to `generation`
    pub(crate) fn release(&self, peer: &PeerId, generation: u64) {
        let mut sessions = self.sessions.write();
        if sessions.get(peer).map(SessionHandle::generation) == Some(generation) {
            sessions.remove(peer);
            tracing::debug!(peer = %peer, generation, "Session released");
        }
    }

    fn handle(&self, peer: &PeerId) -> Option<SessionHandle> {
        self.sessions.read().get(peer).cloned()
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Callback of a latency probe: `(acknowledged, peer, timing)`
pub type ReplyCallback = Box<dyn FnOnce(bool, PeerId, Option<ReplyTiming>) + Send>;

struct ReplyProbe {
    id: u64,
    peer: PeerId,
    callback: ReplyCallback,
}

/// Call signaling engine
///
/// One instance per local identity. Every method is safe to call
/// concurrently; operations on the same peer are serialized on that peer's
/// session task.
///
/// Call control methods return `bool` and never fail loudly: a `false` means
/// a local precondition did not hold and nothing was started. Everything
/// that goes wrong later is reported through the [`CallDelegate`].
pub struct SignalingEngine<T: SignalingTransport + 'static> {
    ctx: Arc<EngineContext<T>>,
    channel_ready: AtomicBool,
    probe: Arc<Mutex<Option<ReplyProbe>>>,
    probe_ids: AtomicU64,
    shutdown: Notify,
}

impl<T: SignalingTransport + 'static> SignalingEngine<T> {
    /// Create an engine
    ///
    /// The signaling channel starts out ready.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration fails validation
    pub fn new(
        signaling: Arc<SignalingHandler<T>>,
        media: Arc<dyn MediaTransportFactory>,
        delegate: Arc<dyn CallDelegate>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        tracing::info!(local = %config.local_id, "Creating signaling engine");
        let ctx = EngineContext {
            local: config.local_id.clone(),
            profile: PeerProfile {
                display_name: config.display_name.clone(),
            },
            bandwidth: RwLock::new(config.bandwidth()),
            auto_answer: AtomicBool::new(config.auto_answer),
            config,
            signaling,
            media,
            delegate,
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            channel_ready: AtomicBool::new(true),
            probe: Arc::new(Mutex::new(None)),
            probe_ids: AtomicU64::new(0),
            shutdown: Notify::new(),
        })
    }

    /// Create a builder
    #[must_use]
    pub fn builder(
        signaling: Arc<SignalingHandler<T>>,
        media: Arc<dyn MediaTransportFactory>,
    ) -> SignalingEngineBuilder<T> {
        SignalingEngineBuilder::new(signaling, media)
    }

    /// Local identity
    pub fn local_id(&self) -> &PeerId {
        &self.ctx.local
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Place a call to `peer`
    ///
    /// Returns `false` without creating a session when the signaling channel
    /// is down, a hangup is still waiting for its acknowledgement, a call is
    /// already live (single-call policy) or `peer` is the local identity.
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local))]
    pub async fn make_call(&self, peer: PeerId, video: bool) -> bool {
        if !self.is_channel_ready() {
            tracing::warn!("Signaling channel not ready");
            return false;
        }
        if peer == self.ctx.local {
            tracing::warn!("Refusing to call the local identity");
            return false;
        }

        let mut sessions = self.ctx.sessions.write();
        if sessions.values().any(SessionHandle::hangup_pending) {
            tracing::warn!("A hangup is still pending");
            return false;
        }
        if sessions.get(&peer).is_some_and(|h| h.state().is_live()) {
            tracing::warn!("A call with this peer is already live");
            return false;
        }
        if self.ctx.config.single_active_call && sessions.values().any(|h| h.state().is_live()) {
            tracing::warn!("Another call is already active");
            return false;
        }

        let mut session = match CallSession::outgoing(self.ctx.local.clone(), peer.clone(), video) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot create session");
                return false;
            }
        };
        session.state = SignalingState::Progress;
        tracing::info!(call_id = %session.call_id, video, "Placing call");

        let handle = session::spawn(self.ctx.clone(), session, self.ctx.next_generation());
        let started = handle
            .deliver(SessionEvent::Command {
                command: Command::Start { video },
                reply: None,
            })
            .is_ok();
        sessions.insert(peer, handle);
        started
    }

    /// Answer the pending invite from `peer`
    ///
    /// Returns `false` unless an incoming session is waiting in `Invite`
    /// with an unconsumed offer.
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local))]
    pub async fn answer_call(&self, peer: &PeerId) -> bool {
        match self.ctx.handle(peer) {
            Some(handle) => handle.request(Command::Answer).await,
            None => {
                tracing::debug!("No session to answer");
                false
            }
        }
    }

    /// Hang up, cancel or reject the call with `peer`
    ///
    /// A no-op when there is no session. Returns once the Bye/Cancel has been
    /// handed to the signaling channel; the end is reported asynchronously.
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local))]
    pub async fn terminate_call(&self, peer: &PeerId) {
        if let Some(handle) = self.ctx.handle(peer) {
            handle.request(Command::Terminate).await;
        }
    }

    /// Send an in-call media hint to `peer`
    ///
    /// Returns `false` and sends nothing unless the call is `Incall`.
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local))]
    pub async fn consult(&self, peer: &PeerId, media: MediaKind, operation: ConsultOperation) -> bool {
        let Some(handle) = self.ctx.handle(peer) else {
            return false;
        };
        if handle.state() != SignalingState::Incall {
            return false;
        }
        handle
            .request(Command::Consult(ConsultPayload::new(media, operation)))
            .await
    }

    /// Probe round-trip latency to `peer`
    ///
    /// At most one probe is outstanding per engine. The callback fires once:
    /// with the completed timing when the acknowledgement arrives, or with
    /// `(false, peer, None)` after `timeout`.
    #[tracing::instrument(skip(self, callback), fields(local = %self.ctx.local))]
    pub async fn reply(&self, peer: PeerId, timeout: Duration, callback: ReplyCallback) -> bool {
        if !self.is_channel_ready() {
            return false;
        }
        let id = self.probe_ids.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut probe = self.probe.lock();
            if probe.is_some() {
                tracing::debug!("A probe is already outstanding");
                return false;
            }
            *probe = Some(ReplyProbe {
                id,
                peer: peer.clone(),
                callback,
            });
        }

        let message = SignalingMessage::Reply {
            from: self.ctx.local.clone(),
            to: peer.clone(),
            timing: ReplyTiming {
                originate: now_ms(),
                ..Default::default()
            },
        };
        if let Err(e) = self.ctx.signaling.send_message(&peer, message).await {
            tracing::warn!(error = %e, "Probe send failed");
            self.probe.lock().take();
            return false;
        }

        let probe = self.probe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut slot = probe.lock();
                if slot.as_ref().is_some_and(|p| p.id == id) {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(p) = expired {
                tracing::debug!(peer = %p.peer, "Probe timed out");
                (p.callback)(false, p.peer, None);
            }
        });
        true
    }

    /// Feed one inbound signaling message from `from` into the engine
    #[tracing::instrument(skip(self, message), fields(local = %self.ctx.local, action = message.action()))]
    pub async fn on_signaling_message(&self, from: PeerId, message: SignalingMessage) {
        if let Err(e) = message.validate() {
            tracing::warn!(error = %e, "Dropping malformed message");
            return;
        }
        match message {
            SignalingMessage::Reply { timing, .. } => self.answer_probe(from, timing).await,
            SignalingMessage::ReplyAck { timing, .. } => self.complete_probe(from, timing),
            other => self.dispatch(from, other).await,
        }
    }

    /// Signaling channel availability changed
    ///
    /// Losing the channel hangs up every session.
    #[tracing::instrument(skip(self), fields(local = %self.ctx.local))]
    pub async fn set_channel_ready(&self, ready: bool) {
        let was_ready = self.channel_ready.swap(ready, Ordering::AcqRel);
        if ready || !was_ready {
            return;
        }
        let handles: Vec<SessionHandle> = self.ctx.sessions.read().values().cloned().collect();
        tracing::warn!(sessions = handles.len(), "Signaling channel lost, hanging up");
        futures::future::join_all(handles.iter().map(|h| h.request(Command::Terminate))).await;
    }

    /// Whether outbound calls can be placed
    pub fn is_channel_ready(&self) -> bool {
        self.channel_ready.load(Ordering::Acquire)
    }

    /// Answer inbound invites automatically
    pub fn set_auto_answer(&self, enabled: bool) {
        self.ctx.auto_answer.store(enabled, Ordering::Relaxed);
    }

    /// Change the bandwidth caps for descriptions created from now on
    pub fn set_bandwidth(&self, audio_kbps: u32, video_kbps: u32) {
        *self.ctx.bandwidth.write() = BandwidthHints {
            audio_kbps,
            video_kbps,
        };
    }

    /// Snapshot of the session with `peer`
    pub fn session(&self, peer: &PeerId) -> Option<CallSession> {
        self.ctx.handle(peer).map(|h| h.snapshot())
    }

    /// Snapshots of every tracked session
    pub fn sessions(&self) -> Vec<CallSession> {
        self.ctx.sessions.read().values().map(SessionHandle::snapshot).collect()
    }

    /// Pump the signaling channel until [`SignalingEngine::shutdown`]
    pub async fn run(&self) {
        tracing::info!(local = %self.ctx.local, "Signaling engine running");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = self.ctx.signaling.receive_message() => match received {
                    Ok((from, message)) => self.on_signaling_message(from, message).await,
                    Err(e) => tracing::warn!(error = %e, "Signaling receive failed"),
                },
            }
        }
        tracing::info!(local = %self.ctx.local, "Signaling engine stopped");
    }

    /// Stop [`SignalingEngine::run`]
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    async fn dispatch(&self, from: PeerId, message: SignalingMessage) {
        let handle = {
            let mut sessions = self.ctx.sessions.write();
            let opens_session = matches!(
                message,
                SignalingMessage::Invite { .. } | SignalingMessage::ReverseCall { .. }
            );
            match sessions.get(&from).cloned() {
                Some(existing) if opens_session && existing.hangup_pending() => {
                    tracing::debug!(peer = %from, "New call supersedes a pending hangup");
                    let _ = existing.deliver(SessionEvent::Command {
                        command: Command::Supersede,
                        reply: None,
                    });
                    self.open_incoming(&mut sessions, &from, &message)
                }
                Some(existing) => Some(existing),
                None if opens_session => self.open_incoming(&mut sessions, &from, &message),
                None => None,
            }
        };

        let undelivered = match handle {
            Some(handle) => match handle.deliver(SessionEvent::Signal(message)) {
                Ok(()) => return,
                Err(SessionEvent::Signal(message)) => message,
                Err(_) => return,
            },
            None => message,
        };
        self.answer_without_session(from, undelivered).await;
    }

    fn open_incoming(
        &self,
        sessions: &mut HashMap<PeerId, SessionHandle>,
        from: &PeerId,
        message: &SignalingMessage,
    ) -> Option<SessionHandle> {
        let video = match message {
            SignalingMessage::Invite { sdp, .. } | SignalingMessage::ReverseCall { sdp, .. } => has_video(sdp),
            _ => false,
        };
        let mut session = match CallSession::incoming(from.clone(), self.ctx.local.clone(), video) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting inbound call");
                return None;
            }
        };
        session.busy = sessions.iter().any(|(peer, h)| peer != from && h.state().is_live());
        let handle = session::spawn(self.ctx.clone(), session, self.ctx.next_generation());
        sessions.insert(from.clone(), handle.clone());
        Some(handle)
    }

    /// Messages for peers without a session: acknowledge hangups, drop the rest
    async fn answer_without_session(&self, from: PeerId, message: SignalingMessage) {
        let local = self.ctx.local.clone();
        let ack = match message {
            SignalingMessage::Bye { .. } => SignalingMessage::ByeAck { peer: local },
            SignalingMessage::Cancel { .. } => SignalingMessage::CancelAck { peer: local },
            other => {
                tracing::debug!(peer = %from, action = other.action(), "Stale message dropped");
                return;
            }
        };
        if let Err(e) = self.ctx.signaling.send_message(&from, ack).await {
            tracing::warn!(error = %e, "Acknowledgement send failed");
        }
    }

    async fn answer_probe(&self, from: PeerId, mut timing: ReplyTiming) {
        let received = now_ms();
        timing.receive = Some(received);
        timing.reference = Some(received);
        timing.transmit = Some(now_ms());
        let ack = SignalingMessage::ReplyAck {
            from: self.ctx.local.clone(),
            to: from.clone(),
            timing,
        };
        if let Err(e) = self.ctx.signaling.send_message(&from, ack).await {
            tracing::warn!(error = %e, "Probe acknowledgement send failed");
        }
    }

    fn complete_probe(&self, from: PeerId, timing: ReplyTiming) {
        let probe = {
            let mut slot = self.probe.lock();
            if slot.as_ref().is_some_and(|p| p.peer == from) {
                slot.take()
            } else {
                None
            }
        };
        match probe {
            Some(p) => {
                let timing = timing.complete(now_ms());
                tracing::debug!(
                    peer = %from,
                    local_latency = ?timing.local_latency,
                    remote_latency = ?timing.remote_latency,
                    "Probe answered"
                );
                (p.callback)(true, p.peer, Some(timing));
            }
            None => tracing::debug!(peer = %from, "Unsolicited probe acknowledgement"),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Signaling engine builder
pub struct SignalingEngineBuilder<T: SignalingTransport + 'static> {
    signaling: Arc<SignalingHandler<T>>,
    media: Arc<dyn MediaTransportFactory>,
    delegate: Arc<dyn CallDelegate>,
    config: EngineConfig,
}

impl<T: SignalingTransport + 'static> SignalingEngineBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(signaling: Arc<SignalingHandler<T>>, media: Arc<dyn MediaTransportFactory>) -> Self {
        Self {
            signaling,
            media,
            delegate: Arc::new(NoopDelegate),
            config: EngineConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the local identity
    #[must_use]
    pub fn with_local_id(mut self, local_id: impl Into<PeerId>) -> Self {
        self.config.local_id = local_id.into();
        self
    }

    /// Set the lifecycle delegate
    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn CallDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns error if the configuration fails validation
    pub fn build(self) -> Result<SignalingEngine<T>, EngineError> {
        SignalingEngine::new(self.signaling, self.media, self.delegate, self.config)
    }
}
