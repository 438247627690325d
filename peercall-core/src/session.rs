//! Per-session actor
//!
//! Every tracked peer gets one task that owns its [`CallSession`]. Local
//! commands, inbound signaling, media transport callbacks, media acquisition
//! results and timer expiries all arrive as [`SessionEvent`]s on one queue
//! and are handled to completion one at a time, so two events for the same
//! peer never interleave. Sessions for different peers run concurrently.
//!
//! ```text
//!  Idle ──invite──▶ Inviting ──answer──▶ AcquiringMedia ──media──▶ InCall
//!  AcquiringMedia ──offer sent──▶ Inviting ──200──▶ Ringing ──answer──▶ InCall
//!  any live ──terminate──▶ Terminating ──ack / hangup timer──▶ Ended
//!  any live ──remote bye/cancel, failure──▶ Ended
//! ```
//!
//! Asynchronous results (media acquisition, media callbacks, timers) carry
//! the epoch or generation they were started under and are dropped when the
//! session has moved on.

use crate::delegate::CallDelegate;
use crate::engine::EngineContext;
use crate::identity::PeerId;
use crate::media::{ConnectionState, LocalMedia, MediaError, MediaEvent, MediaEventSink};
use crate::negotiation::{NegotiationCoordinator, NegotiationError};
use crate::sdp::has_video;
use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::types::{
    CallSession, ConsultOperation, ConsultPayload, EndReason, IceCandidate, IceServer, MediaConstraints,
    MediaKind, PeerProfile, SessionDescription, SignalingState, StateCode,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Delay before an invite answers itself
const AUTO_ANSWER_DELAY: Duration = Duration::from_millis(60);

/// Local command addressed to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Start { video: bool },
    Answer,
    Terminate,
    Consult(ConsultPayload),
    Supersede,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Hangup,
    Ice,
    AutoAnswer,
}

/// Everything a session task reacts to
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Command {
        command: Command,
        reply: Option<oneshot::Sender<bool>>,
    },
    Signal(SignalingMessage),
    Media {
        epoch: u64,
        event: MediaEvent,
    },
    MediaAcquired {
        epoch: u64,
        result: Result<LocalMedia, MediaError>,
    },
    TimerFired {
        kind: TimerKind,
        generation: u64,
    },
}

/// Internal lifecycle; the public [`SignalingState`] is derived from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AcquiringMedia,
    Inviting,
    Ringing,
    InCall { connected: bool, confirmed: bool },
    Terminating,
    Ended,
}

impl Phase {
    fn signaling_state(self) -> SignalingState {
        match self {
            Self::Idle => SignalingState::None,
            Self::AcquiringMedia => SignalingState::Progress,
            Self::Inviting => SignalingState::Invite,
            Self::Ringing => SignalingState::Ringing,
            Self::InCall { .. } => SignalingState::Incall,
            Self::Terminating | Self::Ended => SignalingState::End,
        }
    }

    fn is_finished(self) -> bool {
        matches!(self, Self::Terminating | Self::Ended)
    }

    fn is_in_call(self) -> bool {
        matches!(self, Self::InCall { .. })
    }
}

enum Outcome {
    Ended(EndReason),
    Failed(StateCode),
}

/// At most one running timer per kind
#[derive(Default)]
struct Timers {
    generation: u64,
    slots: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl Timers {
    fn start(&mut self, kind: TimerKind, after: Duration, tx: &mpsc::UnboundedSender<SessionEvent>) {
        self.cancel(kind);
        self.generation += 1;
        let generation = self.generation;
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionEvent::TimerFired { kind, generation });
        });
        tracing::trace!(?kind, generation, after_ms = after.as_millis(), "Timer started");
        self.slots.insert(kind, (generation, task));
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, task)) = self.slots.remove(&kind) {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, task)) in self.slots.drain() {
            task.abort();
        }
    }

    /// Claim an expiry; false if the timer was cancelled or restarted since
    fn expire(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.slots.get(&kind) {
            Some((current, _)) if *current == generation => {
                self.slots.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

pub(crate) struct SessionShared {
    snapshot: RwLock<CallSession>,
    hangup_pending: AtomicBool,
}

/// Engine-side handle to a running session task
#[derive(Clone)]
pub(crate) struct SessionHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn snapshot(&self) -> CallSession {
        self.shared.snapshot.read().clone()
    }

    pub(crate) fn state(&self) -> SignalingState {
        self.shared.snapshot.read().state
    }

    /// Waiting for a Bye/Cancel acknowledgement
    pub(crate) fn hangup_pending(&self) -> bool {
        self.shared.hangup_pending.load(Ordering::Acquire)
    }

    /// Queue an event; hands it back if the task has already finished
    pub(crate) fn deliver(&self, event: SessionEvent) -> Result<(), SessionEvent> {
        self.tx.send(event).map_err(|e| e.0)
    }

    /// Queue a command and wait until the task has handled it
    pub(crate) async fn request(&self, command: Command) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .deliver(SessionEvent::Command {
                command,
                reply: Some(reply),
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Start the task for `session` and return its handle
///
/// A session created in `Progress` is an outgoing call about to acquire
/// media; anything else starts idle and waits for its first event.
pub(crate) fn spawn<T>(ctx: Arc<EngineContext<T>>, session: CallSession, generation: u64) -> SessionHandle
where
    T: SignalingTransport + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let phase = if session.state == SignalingState::Progress {
        Phase::AcquiringMedia
    } else {
        Phase::Idle
    };
    let shared = Arc::new(SessionShared {
        snapshot: RwLock::new(session.clone()),
        hangup_pending: AtomicBool::new(false),
    });
    let span = tracing::info_span!("session", peer = %session.peer(), call_id = %session.call_id);
    let actor = SessionActor {
        ctx,
        generation,
        shared: shared.clone(),
        tx: tx.clone(),
        rx,
        session,
        phase,
        negotiation: None,
        acquisition: None,
        epoch: 0,
        timers: Timers::default(),
    };
    tokio::spawn(actor.run().instrument(span));
    SessionHandle { generation, tx, shared }
}

struct SessionActor<T: SignalingTransport> {
    ctx: Arc<EngineContext<T>>,
    generation: u64,
    shared: Arc<SessionShared>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    session: CallSession,
    phase: Phase,
    negotiation: Option<NegotiationCoordinator>,
    acquisition: Option<JoinHandle<()>>,
    epoch: u64,
    timers: Timers,
}

impl<T: SignalingTransport + 'static> SessionActor<T> {
    async fn run(mut self) {
        tracing::debug!(direction = ?self.session.direction(), "Session task started");
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
            if self.phase == Phase::Ended {
                // Queued hangups still get their acks; later deliveries bounce
                self.rx.close();
            }
        }
        self.timers.cancel_all();
        tracing::debug!("Session task finished");
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command { command, reply } => {
                let accepted = self.on_command(command).await;
                if let Some(reply) = reply {
                    let _ = reply.send(accepted);
                }
            }
            SessionEvent::Signal(message) => self.on_signal(message).await,
            SessionEvent::Media { epoch, event } => {
                if epoch != self.epoch {
                    tracing::trace!(?event, "Dropping event from a retired media transport");
                    return;
                }
                self.on_media_event(event).await;
            }
            SessionEvent::MediaAcquired { epoch, result } => self.on_media_acquired(epoch, result).await,
            SessionEvent::TimerFired { kind, generation } => {
                if !self.timers.expire(kind, generation) {
                    tracing::trace!(?kind, generation, "Stale timer expiry");
                    return;
                }
                self.on_timer(kind).await;
            }
        }
    }

    // ---- commands ----

    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { video } => {
                self.start_outgoing(video).await;
                true
            }
            Command::Answer => self.answer().await,
            Command::Terminate => self.terminate().await,
            Command::Consult(payload) => self.consult(payload).await,
            Command::Supersede => {
                if self.phase == Phase::Terminating {
                    tracing::debug!("Superseded by a new session for the same peer");
                    self.finish(Outcome::Ended(EndReason::ByeAck)).await;
                }
                true
            }
        }
    }

    async fn start_outgoing(&mut self, video: bool) {
        if self.phase != Phase::AcquiringMedia || !self.session.is_initiator() {
            tracing::warn!(phase = ?self.phase, "Start on a session that is not placing a call");
            return;
        }
        self.ctx.delegate.on_call(&self.session, video);
        if !self.open_transport(true).await {
            return;
        }
        self.ctx.delegate.on_in_progress(&self.session);
        let constraints = self.ctx.config.video.invite_constraints(video);
        self.acquire(constraints);
    }

    async fn answer(&mut self) -> bool {
        if self.session.is_initiator()
            || self.phase != Phase::Inviting
            || self.session.remote().session_description().is_none()
        {
            tracing::debug!(phase = ?self.phase, "Nothing to answer");
            return false;
        }
        tracing::info!("Answering call");
        self.timers.cancel(TimerKind::AutoAnswer);
        self.transition(Phase::AcquiringMedia);
        if !self.open_transport(false).await {
            return false;
        }
        self.ctx.delegate.on_in_progress(&self.session);
        let constraints = self
            .ctx
            .config
            .video
            .answer_constraints(self.session.local().video_enabled());
        self.acquire(constraints);
        true
    }

    async fn terminate(&mut self) -> bool {
        if matches!(self.phase, Phase::Idle) || self.phase.is_finished() {
            tracing::debug!(phase = ?self.phase, "Terminate is a no-op");
            return true;
        }
        let message = if self.phase.is_in_call() {
            SignalingMessage::Bye { peer: self.local() }
        } else {
            SignalingMessage::Cancel {
                peer: self.local(),
                reason: None,
            }
        };
        tracing::info!(action = message.action(), "Hanging up");

        self.timers.cancel_all();
        self.teardown_media().await;
        self.session.mark_ended(Utc::now());
        self.transition(Phase::Terminating);
        self.send(message).await;
        self.timers
            .start(TimerKind::Hangup, self.ctx.config.hangup_timeout(), &self.tx);
        true
    }

    async fn consult(&mut self, payload: ConsultPayload) -> bool {
        if !self.phase.is_in_call() {
            tracing::debug!(phase = ?self.phase, "Consult outside a call ignored");
            return false;
        }
        let message = SignalingMessage::Consult {
            peer: self.local(),
            payload,
        };
        self.send(message).await
    }

    // ---- inbound signaling ----

    async fn on_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Invite {
                sdp,
                ice_servers,
                caller_data,
                ..
            } => self.on_invite(sdp, ice_servers, caller_data).await,
            SignalingMessage::InviteAck {
                state, callee_data, ..
            } => self.on_invite_ack(state, callee_data).await,
            SignalingMessage::Answer { sdp, .. } => self.on_answer(sdp).await,
            SignalingMessage::AnswerAck { state, .. } => self.on_answer_ack(state).await,
            SignalingMessage::Bye { .. } => self.on_bye().await,
            SignalingMessage::Cancel { peer, reason } => self.on_cancel(peer, reason).await,
            SignalingMessage::ByeAck { .. } => self.on_hangup_ack(EndReason::ByeAck).await,
            SignalingMessage::CancelAck { .. } => self.on_hangup_ack(EndReason::CancelAck).await,
            SignalingMessage::Candidate { candidate, .. } => self.on_candidate(candidate).await,
            SignalingMessage::Consult { payload, .. } => self.on_consult(payload).await,
            SignalingMessage::ReverseCall { sdp, ice_servers, .. } => self.on_reverse_call(sdp, ice_servers).await,
            SignalingMessage::CandidateAck { .. } | SignalingMessage::ConsultAck { .. } => {
                tracing::trace!("Acknowledged");
            }
            other => {
                tracing::debug!(action = other.action(), "Message not handled by sessions");
            }
        }
    }

    async fn on_invite(&mut self, sdp: String, ice_servers: Vec<IceServer>, profile: PeerProfile) {
        match self.phase {
            Phase::Idle => {}
            Phase::Inviting if !self.session.is_initiator() => {
                tracing::debug!("Duplicate invite ignored");
                return;
            }
            phase => {
                tracing::warn!(?phase, "Invite collides with an existing call, answering busy");
                let ack = SignalingMessage::InviteAck {
                    state: StateCode::BUSY,
                    callee: self.local(),
                    callee_data: self.ctx.profile.clone(),
                };
                self.send(ack).await;
                return;
            }
        }

        let servers = if ice_servers.is_empty() {
            self.ctx.config.ice_servers.clone()
        } else {
            ice_servers
        };
        let video = has_video(&sdp);
        let remote = self.session.remote_mut();
        remote.set_session_description(sdp);
        remote.set_ice_servers(servers);
        if profile.display_name.is_some() {
            remote.display_name = profile.display_name;
        }
        self.session.mark_invited(Utc::now());
        self.transition(Phase::Inviting);
        tracing::info!(video, busy = self.session.busy, "Incoming call");

        let ack = SignalingMessage::InviteAck {
            state: StateCode::OK,
            callee: self.local(),
            callee_data: self.ctx.profile.clone(),
        };
        if !self.send(ack).await {
            self.fail(StateCode::SIGNALING_START_ERROR, false).await;
            return;
        }

        self.ctx.delegate.on_call(&self.session, video);
        if self.ctx.auto_answer() {
            self.timers.start(TimerKind::AutoAnswer, AUTO_ANSWER_DELAY, &self.tx);
        }
    }

    async fn on_invite_ack(&mut self, state: StateCode, profile: PeerProfile) {
        if !self.session.is_initiator() || self.phase != Phase::Inviting {
            tracing::debug!(phase = ?self.phase, code = %state, "Stale invite ack dropped");
            return;
        }
        if !state.is_success() {
            if state == StateCode::BUSY {
                self.session.busy = true;
            }
            self.fail(state, false).await;
            return;
        }
        if profile.display_name.is_some() {
            self.session.remote_mut().display_name = profile.display_name;
        }
        self.transition(Phase::Ringing);
        self.ctx.delegate.on_call_ringing(&self.session);
    }

    async fn on_answer(&mut self, sdp: String) {
        if !self.session.is_initiator() || !matches!(self.phase, Phase::Inviting | Phase::Ringing) {
            tracing::debug!(phase = ?self.phase, "Stale answer dropped");
            return;
        }
        let Some(negotiation) = self.negotiation.as_mut() else {
            return;
        };
        if let Err(e) = negotiation.apply_remote_answer(&sdp).await {
            tracing::warn!(error = %e, "Remote answer rejected");
            let nack = SignalingMessage::AnswerAck {
                state: StateCode::WORKER_STATE_EXCEPTION,
                caller: self.local(),
            };
            self.send(nack).await;
            self.fail(StateCode::WORKER_STATE_EXCEPTION, false).await;
            return;
        }

        self.session.remote_mut().set_session_description(sdp);
        self.session.mark_in_call(Utc::now());
        self.transition(Phase::InCall {
            connected: false,
            confirmed: true,
        });
        let ack = SignalingMessage::AnswerAck {
            state: StateCode::OK,
            caller: self.local(),
        };
        self.send(ack).await;
        self.timers.start(TimerKind::Ice, self.ctx.config.ice_timeout(), &self.tx);
        tracing::info!("Call answered");
        self.ctx.delegate.on_call_connected(&self.session);
    }

    async fn on_answer_ack(&mut self, state: StateCode) {
        let Phase::InCall {
            connected,
            confirmed: false,
        } = self.phase
        else {
            tracing::debug!(phase = ?self.phase, "Stale answer ack dropped");
            return;
        };
        if !state.is_success() {
            self.fail(state, false).await;
            return;
        }
        self.transition(Phase::InCall {
            connected,
            confirmed: true,
        });
        tracing::info!("Answer confirmed");
        self.ctx.delegate.on_call_connected(&self.session);
    }

    async fn on_bye(&mut self) {
        self.send(SignalingMessage::ByeAck { peer: self.local() }).await;
        if self.phase.is_finished() || self.phase == Phase::Idle {
            tracing::debug!(phase = ?self.phase, "Bye for a finished session");
            return;
        }
        self.finish(Outcome::Ended(EndReason::Bye)).await;
    }

    async fn on_cancel(&mut self, sender: PeerId, reason: Option<StateCode>) {
        self.send(SignalingMessage::CancelAck { peer: self.local() }).await;
        if &sender != self.session.peer() {
            tracing::warn!(sender = %sender, "Cancel for an untracked peer ignored");
            return;
        }
        if self.phase.is_finished() || self.phase == Phase::Idle {
            tracing::debug!(phase = ?self.phase, "Cancel for a finished session");
            return;
        }
        self.finish(Outcome::Ended(EndReason::from_cancel_reason(reason))).await;
    }

    async fn on_hangup_ack(&mut self, reason: EndReason) {
        if self.phase != Phase::Terminating {
            tracing::debug!(phase = ?self.phase, %reason, "Unexpected hangup ack dropped");
            return;
        }
        self.finish(Outcome::Ended(reason)).await;
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        self.send(SignalingMessage::CandidateAck { peer: self.local() }).await;
        if self.phase.is_finished() {
            tracing::debug!("Candidate for a finished session dropped");
            return;
        }
        self.session.remote_mut().add_candidate(candidate.clone());
        self.publish();
        let Some(negotiation) = self.negotiation.as_mut() else {
            // Replayed from the remote leg once the transport exists
            return;
        };
        if let Err(e) = negotiation.add_remote_candidate(candidate).await {
            tracing::warn!(error = %e, "Remote candidate rejected");
            self.fail(StateCode::WORKER_STATE_EXCEPTION, true).await;
        }
    }

    async fn on_consult(&mut self, payload: ConsultPayload) {
        self.send(SignalingMessage::ConsultAck { peer: self.local() }).await;
        if payload.ver != ConsultPayload::VERSION {
            tracing::warn!(ver = payload.ver, "Unsupported consult version");
            return;
        }
        if !self.phase.is_in_call() {
            tracing::debug!(phase = ?self.phase, "Consult outside a call ignored");
            return;
        }
        tracing::debug!(media = ?payload.media, operation = ?payload.operation, "Consult");
        match payload.operation {
            ConsultOperation::Open => self.set_track(payload.media, true).await,
            ConsultOperation::Close => self.set_track(payload.media, false).await,
            ConsultOperation::Hold => {
                self.set_all_tracks(false).await;
                self.ctx.delegate.on_call_hold(&self.session);
            }
            ConsultOperation::Resume => self.set_all_tracks(true).await,
        }
    }

    async fn on_reverse_call(&mut self, sdp: String, ice_servers: Vec<IceServer>) {
        if self.phase.is_finished() {
            tracing::warn!("Reverse call for a finished session ignored");
            return;
        }
        let video = has_video(&sdp);
        let mut fresh = match CallSession::incoming(self.session.peer().clone(), self.local(), video) {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(error = %e, "Reverse call rejected");
                return;
            }
        };
        tracing::info!(video, "Reverse call replaces the current attempt");
        self.timers.cancel_all();
        self.teardown_media().await;

        let servers = if ice_servers.is_empty() {
            self.ctx.config.ice_servers.clone()
        } else {
            ice_servers
        };
        fresh.remote_mut().set_session_description(sdp);
        fresh.remote_mut().set_ice_servers(servers);
        fresh.remote_mut().display_name = self.session.remote().display_name.clone();
        fresh.mark_invited(Utc::now());
        fresh.state = self.session.state;
        self.session = fresh;
        self.phase = Phase::Idle;
        self.transition(Phase::Inviting);

        self.ctx.delegate.on_reverse_call(&self.session);
        self.timers.start(TimerKind::AutoAnswer, AUTO_ANSWER_DELAY, &self.tx);
    }

    // ---- media ----

    async fn on_media_acquired(&mut self, epoch: u64, result: Result<LocalMedia, MediaError>) {
        if epoch != self.epoch || self.phase != Phase::AcquiringMedia {
            tracing::debug!(phase = ?self.phase, "Discarding media acquired for a superseded attempt");
            return;
        }
        self.acquisition = None;
        let media = match result {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(error = %e, "Local media unavailable");
                self.fail(StateCode::CAMERA_OPEN_FAILED, true).await;
                return;
            }
        };
        let Some(transport) = self.negotiation.as_ref().map(|n| n.transport().clone()) else {
            return;
        };
        tracing::debug!(audio = media.audio, video = media.video, "Local media ready");
        if let Err(e) = transport.add_local_media(media).await {
            tracing::warn!(error = %e, "Attaching local media failed");
            self.fail(StateCode::WORKER_STATE_EXCEPTION, true).await;
            return;
        }
        if !self.session.is_initiator() {
            self.send_answer().await;
        }
    }

    async fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::NegotiationNeeded => self.send_invite().await,
            MediaEvent::CandidateGenerated(candidate) => {
                if self.phase.is_finished() {
                    return;
                }
                self.session.local_mut().add_candidate(candidate.clone());
                self.publish();
                let message = SignalingMessage::Candidate {
                    peer: self.local(),
                    candidate,
                };
                self.send(message).await;
            }
            MediaEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            MediaEvent::RemoteMediaAdded => {
                tracing::debug!("Remote media added");
                self.mark_connected();
            }
            MediaEvent::RemoteMediaRemoved => {
                tracing::debug!("Remote media removed");
                self.timers.cancel(TimerKind::Ice);
            }
        }
    }

    async fn send_invite(&mut self) {
        if self.phase != Phase::AcquiringMedia {
            tracing::trace!(phase = ?self.phase, "Negotiation request outside invite setup");
            return;
        }
        let Some(negotiation) = self.negotiation.as_mut() else {
            return;
        };
        let offer = match negotiation.on_negotiation_needed().await {
            Ok(Some(offer)) => offer,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Offer creation failed");
                self.fail(StateCode::WORKER_STATE_EXCEPTION, true).await;
                return;
            }
        };

        let servers = self.ctx.config.ice_servers.clone();
        let local = self.session.local_mut();
        local.set_session_description(offer.sdp.clone());
        local.set_ice_servers(servers.clone());
        let invite = SignalingMessage::Invite {
            caller: self.local(),
            callee: self.session.peer().clone(),
            sdp: offer.sdp,
            ice_servers: servers,
            caller_data: self.ctx.profile.clone(),
        };
        if !self.send(invite).await {
            self.fail(StateCode::SIGNALING_START_ERROR, true).await;
            return;
        }
        self.session.mark_invited(Utc::now());
        self.transition(Phase::Inviting);
        tracing::info!("Invite sent");
    }

    async fn send_answer(&mut self) {
        let Some(offer) = self.session.remote().session_description().map(str::to_owned) else {
            self.fail(StateCode::WORKER_STATE_EXCEPTION, true).await;
            return;
        };
        let Some(negotiation) = self.negotiation.as_mut() else {
            return;
        };
        let answer = match negotiate_answer(negotiation, &offer).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "Answer negotiation failed");
                self.fail(StateCode::WORKER_STATE_EXCEPTION, true).await;
                return;
            }
        };

        self.session.local_mut().set_session_description(answer.sdp.clone());
        let message = SignalingMessage::Answer {
            caller: self.session.peer().clone(),
            callee: self.local(),
            sdp: answer.sdp,
        };
        if !self.send(message).await {
            self.fail(StateCode::SIGNALING_START_ERROR, true).await;
            return;
        }
        self.session.mark_in_call(Utc::now());
        self.transition(Phase::InCall {
            connected: false,
            confirmed: false,
        });
        self.timers.start(TimerKind::Ice, self.ctx.config.ice_timeout(), &self.tx);
        tracing::info!("Answer sent");
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        tracing::debug!(?state, "Connection state changed");
        match state {
            ConnectionState::Connected | ConnectionState::Completed => self.mark_connected(),
            ConnectionState::Failed => {
                if self.phase != Phase::Idle && !self.phase.is_finished() {
                    self.fail(StateCode::ICE_CONNECTION_FAILED, true).await;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                if self.phase.is_in_call() {
                    self.finish(Outcome::Ended(EndReason::End)).await;
                }
            }
            ConnectionState::New | ConnectionState::Checking => {}
        }
    }

    fn mark_connected(&mut self) {
        self.timers.cancel(TimerKind::Ice);
        if let Phase::InCall {
            connected: false,
            confirmed,
        } = self.phase
        {
            self.transition(Phase::InCall {
                connected: true,
                confirmed,
            });
            tracing::info!("Media connected");
        }
    }

    async fn set_track(&self, kind: MediaKind, enabled: bool) {
        let Some(negotiation) = self.negotiation.as_ref() else {
            return;
        };
        if let Err(e) = negotiation.transport().set_track_enabled(kind, enabled).await {
            tracing::warn!(error = %e, ?kind, enabled, "Track toggle failed");
        }
    }

    async fn set_all_tracks(&self, enabled: bool) {
        self.set_track(MediaKind::Audio, enabled).await;
        if self.session.local().video_enabled() {
            self.set_track(MediaKind::Video, enabled).await;
        }
    }

    async fn open_transport(&mut self, initiator: bool) -> bool {
        self.epoch += 1;
        let epoch = self.epoch;
        let tx = self.tx.clone();
        let sink = MediaEventSink::new(move |event| {
            let _ = tx.send(SessionEvent::Media { epoch, event });
        });
        let servers = if self.session.remote().ice_servers().is_empty() {
            self.ctx.config.ice_servers.clone()
        } else {
            self.session.remote().ice_servers().to_vec()
        };

        let transport = match self.ctx.media.create(self.session.peer(), &servers, sink) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, "Media transport initialization failed");
                self.fail(StateCode::RTC_INITIALIZE_FAILED, true).await;
                return false;
            }
        };
        let hints = *self.ctx.bandwidth.read();
        let mut negotiation = NegotiationCoordinator::new(transport, initiator, hints);
        for candidate in self.session.remote().candidates().to_vec() {
            // Queued until negotiation is stable; never fails here
            let _ = negotiation.add_remote_candidate(candidate).await;
        }
        self.negotiation = Some(negotiation);
        true
    }

    fn acquire(&mut self, constraints: MediaConstraints) {
        let Some(transport) = self.negotiation.as_ref().map(|n| n.transport().clone()) else {
            return;
        };
        if let Some(previous) = self.acquisition.take() {
            previous.abort();
        }
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.acquisition = Some(tokio::spawn(async move {
            let result = transport.acquire_local_media(&constraints).await;
            let _ = tx.send(SessionEvent::MediaAcquired { epoch, result });
        }));
    }

    async fn teardown_media(&mut self) {
        if let Some(task) = self.acquisition.take() {
            task.abort();
        }
        self.epoch += 1;
        if let Some(mut negotiation) = self.negotiation.take() {
            negotiation.close().await;
        }
    }

    // ---- timers ----

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Hangup => {
                if self.phase == Phase::Terminating {
                    tracing::info!("Hangup not acknowledged in time, assuming delivered");
                    self.finish(Outcome::Ended(EndReason::ByeAck)).await;
                }
            }
            TimerKind::Ice => {
                if let Phase::InCall { connected: false, .. } = self.phase {
                    tracing::warn!("Connectivity not established in time");
                    self.fail(StateCode::ICE_CONNECTION_FAILED, true).await;
                }
            }
            TimerKind::AutoAnswer => {
                self.answer().await;
            }
        }
    }

    // ---- teardown ----

    /// Fail the call; reports `on_call_failed` and never `on_call_ended`
    async fn fail(&mut self, code: StateCode, hang_up_remote: bool) {
        if self.phase.is_finished() {
            tracing::debug!(code = %code, "Failure after the session finished ignored");
            return;
        }
        tracing::warn!(code = %code, phase = ?self.phase, "Call failed");
        if hang_up_remote && self.peer_aware() {
            let message = if self.phase.is_in_call() {
                SignalingMessage::Bye { peer: self.local() }
            } else {
                SignalingMessage::Cancel {
                    peer: self.local(),
                    reason: None,
                }
            };
            self.send(message).await;
        }
        self.finish(Outcome::Failed(code)).await;
    }

    async fn finish(&mut self, outcome: Outcome) {
        self.timers.cancel_all();
        self.teardown_media().await;
        self.session.mark_ended(Utc::now());
        self.transition(Phase::Ended);
        self.ctx.release(self.session.peer(), self.generation);

        let delegate: &dyn CallDelegate = self.ctx.delegate.as_ref();
        match outcome {
            Outcome::Ended(reason) => {
                tracing::info!(%reason, duration = ?self.session.duration(), "Call ended");
                delegate.on_call_ended(&self.session, reason);
            }
            Outcome::Failed(code) => delegate.on_call_failed(&self.session, code),
        }
    }

    // ---- helpers ----

    fn transition(&mut self, next: Phase) {
        if self.phase == Phase::Ended || (self.phase.is_finished() && !next.is_finished()) {
            tracing::warn!(phase = ?self.phase, next = ?next, "Refusing to leave a finished session");
            return;
        }
        let old_state = self.session.state;
        self.phase = next;
        self.session.state = next.signaling_state();
        tracing::debug!(
            old_state = %old_state,
            new_state = %self.session.state,
            phase = ?next,
            "Session transition"
        );
        self.publish();
    }

    fn publish(&self) {
        *self.shared.snapshot.write() = self.session.clone();
        self.shared
            .hangup_pending
            .store(self.phase == Phase::Terminating, Ordering::Release);
    }

    /// Whether the remote side knows this call exists
    fn peer_aware(&self) -> bool {
        !self.session.is_initiator() || self.session.invite_timestamp().is_some()
    }

    fn local(&self) -> PeerId {
        self.ctx.local.clone()
    }

    async fn send(&self, message: SignalingMessage) -> bool {
        match self.ctx.signaling.send_message(self.session.peer(), message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Signaling send failed");
                false
            }
        }
    }
}

async fn negotiate_answer(
    negotiation: &mut NegotiationCoordinator,
    offer: &str,
) -> Result<SessionDescription, NegotiationError> {
    negotiation.apply_remote_offer(offer).await?;
    negotiation.create_answer().await
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_maps_to_public_state() {
        assert_eq!(Phase::Idle.signaling_state(), SignalingState::None);
        assert_eq!(Phase::AcquiringMedia.signaling_state(), SignalingState::Progress);
        assert_eq!(Phase::Inviting.signaling_state(), SignalingState::Invite);
        assert_eq!(Phase::Ringing.signaling_state(), SignalingState::Ringing);
        assert_eq!(
            Phase::InCall {
                connected: true,
                confirmed: false
            }
            .signaling_state(),
            SignalingState::Incall
        );
        assert_eq!(Phase::Terminating.signaling_state(), SignalingState::End);
        assert!(Phase::Terminating.is_finished());
        assert!(!Phase::Ringing.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_timer_invalidates_previous_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::default();
        timers.start(TimerKind::Ice, Duration::from_millis(100), &tx);
        timers.start(TimerKind::Ice, Duration::from_millis(200), &tx);

        let Some(SessionEvent::TimerFired { kind, generation }) = rx.recv().await else {
            panic!("expected a timer event");
        };
        assert_eq!(kind, TimerKind::Ice);
        assert_eq!(generation, 2);
        assert!(timers.expire(kind, generation));
        assert!(!timers.expire(kind, generation));
        assert!(!timers.expire(TimerKind::Ice, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::default();
        timers.start(TimerKind::Hangup, Duration::from_millis(50), &tx);
        timers.cancel_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
