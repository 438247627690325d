//! In-process collaborators
//!
//! [`LoopbackNetwork`] connects engines living in the same process, and
//! [`SimulatedMediaFactory`] stands in for a real peer connection. Together
//! they let two engines hold a complete call without sockets or devices,
//! which is what the CLI demos and the integration tests run on.

use crate::candidate_buffer::CandidateSink;
use crate::identity::PeerId;
use crate::media::{
    ConnectionState, LocalMedia, MediaError, MediaEvent, MediaEventSink, MediaTransport, MediaTransportFactory,
};
use crate::sdp::has_video;
use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{IceCandidate, IceServer, MediaConstraints, MediaKind, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Inbox = mpsc::UnboundedSender<(PeerId, SignalingMessage)>;

/// Decides whether a message is lost in transit: `(from, to, message) -> drop`
pub type DropFilter = Arc<dyn Fn(&PeerId, &PeerId, &SignalingMessage) -> bool + Send + Sync>;

/// One message seen by the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender
    pub from: PeerId,
    /// Addressee
    pub to: PeerId,
    /// Payload
    pub message: SignalingMessage,
    /// Lost to the drop filter
    pub dropped: bool,
}

#[derive(Default)]
struct NetworkInner {
    peers: RwLock<HashMap<PeerId, Inbox>>,
    filter: RwLock<Option<DropFilter>>,
    log: Mutex<Vec<Envelope>>,
}

/// In-memory signaling network
///
/// Delivery is ordered per sender/receiver pair. Messages to peers that have
/// not joined fail with [`SignalingError::PeerUnreachable`].
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `peer` and return its transport
    ///
    /// Joining again under the same identity replaces the previous inbox.
    pub fn join(&self, peer: impl Into<PeerId>) -> LoopbackTransport {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.peers.write().insert(peer.clone(), tx);
        tracing::debug!(peer = %peer, "Joined loopback network");
        LoopbackTransport {
            local: peer,
            network: self.inner.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Detach `peer`; its transport reports [`SignalingError::Closed`] once drained
    pub fn leave(&self, peer: &PeerId) {
        self.inner.peers.write().remove(peer);
    }

    /// Lose every message for which `filter` returns true
    pub fn set_drop_filter(&self, filter: impl Fn(&PeerId, &PeerId, &SignalingMessage) -> bool + Send + Sync + 'static) {
        *self.inner.filter.write() = Some(Arc::new(filter));
    }

    /// Deliver everything again
    pub fn clear_drop_filter(&self) {
        *self.inner.filter.write() = None;
    }

    /// Every message sent so far, in send order
    pub fn log(&self) -> Vec<Envelope> {
        self.inner.log.lock().clone()
    }

    /// Number of delivered messages with the given action name
    pub fn delivered(&self, action: &str) -> usize {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|e| !e.dropped && e.message.action() == action)
            .count()
    }
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("peers", &self.inner.peers.read().len())
            .finish_non_exhaustive()
    }
}

/// One peer's attachment to a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    local: PeerId,
    network: Arc<NetworkInner>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(PeerId, SignalingMessage)>>,
}

impl LoopbackTransport {
    /// Identity this transport sends as
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    type Error = SignalingError;

    async fn send_message(&self, peer: &PeerId, message: SignalingMessage) -> Result<(), SignalingError> {
        let dropped = self
            .network
            .filter
            .read()
            .as_ref()
            .is_some_and(|filter| filter(&self.local, peer, &message));
        self.network.log.lock().push(Envelope {
            from: self.local.clone(),
            to: peer.clone(),
            message: message.clone(),
            dropped,
        });
        if dropped {
            tracing::debug!(to = %peer, action = message.action(), "Message lost in transit");
            return Ok(());
        }

        let inbox = self.network.peers.read().get(peer).cloned();
        match inbox {
            Some(inbox) => inbox
                .send((self.local.clone(), message))
                .map_err(|_| SignalingError::PeerUnreachable(peer.clone())),
            None => Err(SignalingError::PeerUnreachable(peer.clone())),
        }
    }

    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), SignalingError> {
        self.inbox.lock().await.recv().await.ok_or(SignalingError::Closed)
    }
}

/// Behaviour knobs of [`SimulatedMediaFactory`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedMediaOptions {
    /// Transport creation fails
    pub fail_create: bool,
    /// Local media acquisition is denied
    pub deny_media: bool,
    /// Remote descriptions are rejected
    pub reject_remote: bool,
    /// Never report connectivity
    pub stall_connectivity: bool,
    /// Time local media acquisition takes
    pub acquire_delay: Option<Duration>,
}

/// Factory of [`SimulatedMediaTransport`]s
#[derive(Default)]
pub struct SimulatedMediaFactory {
    options: RwLock<SimulatedMediaOptions>,
    created: Mutex<Vec<Arc<SimulatedMediaTransport>>>,
    sessions: AtomicU64,
}

impl SimulatedMediaFactory {
    /// Factory whose transports connect as soon as they can
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the given behaviour
    pub fn with_options(options: SimulatedMediaOptions) -> Self {
        Self {
            options: RwLock::new(options),
            ..Self::default()
        }
    }

    /// Change the behaviour of transports created from now on
    pub fn set_options(&self, options: SimulatedMediaOptions) {
        *self.options.write() = options;
    }

    /// Every transport created so far
    pub fn transports(&self) -> Vec<Arc<SimulatedMediaTransport>> {
        self.created.lock().clone()
    }

    /// Most recently created transport
    pub fn last(&self) -> Option<Arc<SimulatedMediaTransport>> {
        self.created.lock().last().cloned()
    }
}

impl MediaTransportFactory for SimulatedMediaFactory {
    fn create(
        &self,
        peer: &PeerId,
        ice_servers: &[IceServer],
        events: MediaEventSink,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        let options = self.options.read().clone();
        if options.fail_create {
            return Err(MediaError::InitFailed("simulated initialization failure".into()));
        }
        let session_id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(peer = %peer, servers = ice_servers.len(), session_id, "Simulated transport created");
        let transport = Arc::new(SimulatedMediaTransport {
            peer: peer.clone(),
            session_id,
            options,
            events,
            state: Mutex::new(TransportState::default()),
            calls: Mutex::new(Vec::new()),
        });
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct TransportState {
    media: Option<LocalMedia>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    tracks: HashMap<MediaKind, bool>,
    connected: bool,
    closed: bool,
}

impl TransportState {
    fn ready_to_connect(&self) -> bool {
        !self.connected && !self.closed && self.local.is_some() && self.remote.is_some() && self.remote_candidates > 0
    }
}

/// Deterministic stand-in for a peer connection
///
/// Produces fixed SDP, gathers one host candidate per media line when the
/// local description is committed and reports `Connected` once both
/// descriptions and at least one remote candidate are in place. Every
/// operation is recorded and can be inspected with
/// [`SimulatedMediaTransport::calls`].
pub struct SimulatedMediaTransport {
    peer: PeerId,
    session_id: u64,
    options: SimulatedMediaOptions,
    events: MediaEventSink,
    state: Mutex<TransportState>,
    calls: Mutex<Vec<String>>,
}

impl SimulatedMediaTransport {
    /// Operations received so far, oldest first
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Whether connectivity was reported
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Whether [`MediaTransport::close`] was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Current enabled flag of the local track of `kind`
    pub fn track_enabled(&self, kind: MediaKind) -> Option<bool> {
        self.state.lock().tracks.get(&kind).copied()
    }

    /// Number of remote candidates applied
    pub fn remote_candidates(&self) -> usize {
        self.state.lock().remote_candidates
    }

    /// Peer the transport was created for
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Simulate the remote side withdrawing its media
    pub fn remove_remote_media(&self) {
        self.record("remove_remote_media");
        self.events.emit(MediaEvent::RemoteMediaRemoved);
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn describe(&self, kind: SdpKind, video: bool) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=mid:audio\r\na=rtpmap:111 opus/48000/2\r\n",
            self.session_id
        );
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=mid:video\r\na=rtpmap:96 VP8/90000\r\n");
        }
        if kind == SdpKind::Answer {
            sdp.push_str("a=setup:active\r\n");
        } else {
            sdp.push_str("a=setup:actpass\r\n");
        }
        sdp
    }

    /// Connectivity events to emit once the transport has everything it needs
    fn maybe_connect(&self, state: &mut TransportState) -> Vec<MediaEvent> {
        if self.options.stall_connectivity || !state.ready_to_connect() {
            return Vec::new();
        }
        state.connected = true;
        vec![
            MediaEvent::ConnectionStateChanged(ConnectionState::Checking),
            MediaEvent::ConnectionStateChanged(ConnectionState::Connected),
            MediaEvent::RemoteMediaAdded,
        ]
    }

    fn emit_all(&self, events: Vec<MediaEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

impl fmt::Debug for SimulatedMediaTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedMediaTransport")
            .field("peer", &self.peer)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CandidateSink for SimulatedMediaTransport {
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(format!("add_candidate:{}", candidate.sdp_mid.as_deref().unwrap_or("-")));
        let events = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            state.remote_candidates += 1;
            self.maybe_connect(&mut state)
        };
        self.emit_all(events);
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for SimulatedMediaTransport {
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        self.record(format!("acquire_local_media:video={}", constraints.video));
        if let Some(delay) = self.options.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.options.deny_media {
            return Err(MediaError::DeviceUnavailable("permission denied".into()));
        }
        Ok(LocalMedia {
            id: format!("local-{}", self.session_id),
            audio: constraints.audio,
            video: constraints.video,
        })
    }

    async fn add_local_media(&self, media: LocalMedia) -> Result<(), MediaError> {
        self.record("add_local_media");
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            state.tracks.insert(MediaKind::Audio, media.audio);
            if media.video {
                state.tracks.insert(MediaKind::Video, true);
            }
            state.media = Some(media);
        }
        self.events.emit(MediaEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_offer");
        let state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        let video = state.media.as_ref().is_some_and(|m| m.video);
        Ok(SessionDescription::offer(self.describe(SdpKind::Offer, video)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_answer");
        let state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        let Some(remote) = state.remote.as_ref() else {
            return Err(MediaError::Rejected("no remote offer".into()));
        };
        let video = has_video(&remote.sdp) && state.media.as_ref().is_some_and(|m| m.video);
        Ok(SessionDescription::answer(self.describe(SdpKind::Answer, video)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.record(format!("set_local_description:{:?}", description.kind));
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            events.push(MediaEvent::CandidateGenerated(IceCandidate::new(
                "audio",
                0,
                format!("candidate:{} 1 udp 2130706431 127.0.0.1 5000 typ host", self.session_id),
            )));
            if has_video(&description.sdp) {
                events.push(MediaEvent::CandidateGenerated(IceCandidate::new(
                    "video",
                    1,
                    format!("candidate:{} 1 udp 2130706431 127.0.0.1 5002 typ host", self.session_id),
                )));
            }
            state.local = Some(description);
            events.extend(self.maybe_connect(&mut state));
        }
        self.emit_all(events);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.record(format!("set_remote_description:{:?}", description.kind));
        if self.options.reject_remote {
            return Err(MediaError::Rejected("simulated remote description failure".into()));
        }
        let events = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            state.remote = Some(description);
            self.maybe_connect(&mut state)
        };
        self.emit_all(events);
        Ok(())
    }

    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<(), MediaError> {
        self.record(format!("set_track_enabled:{kind:?}={enabled}"));
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.tracks.insert(kind, enabled);
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::VideoResolution;

    fn bye(peer: &str) -> SignalingMessage {
        SignalingMessage::Bye { peer: PeerId::new(peer) }
    }

    #[tokio::test]
    async fn test_network_routes_between_peers() {
        let network = LoopbackNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");

        alice.send_message(&PeerId::new("bob"), bye("alice")).await.unwrap();
        let (from, message) = bob.receive_message().await.unwrap();
        assert_eq!(from.as_str(), "alice");
        assert_eq!(message, bye("alice"));
        assert_eq!(network.delivered("bye"), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let network = LoopbackNetwork::new();
        let alice = network.join("alice");
        let err = alice.send_message(&PeerId::new("carol"), bye("alice")).await.unwrap_err();
        assert_eq!(err, SignalingError::PeerUnreachable(PeerId::new("carol")));
    }

    #[tokio::test]
    async fn test_drop_filter_loses_messages() {
        let network = LoopbackNetwork::new();
        let alice = network.join("alice");
        let bob = network.join("bob");
        network.set_drop_filter(|_, _, m| matches!(m, SignalingMessage::Bye { .. }));

        alice.send_message(&PeerId::new("bob"), bye("alice")).await.unwrap();
        network.clear_drop_filter();
        alice
            .send_message(&PeerId::new("bob"), SignalingMessage::ByeAck { peer: PeerId::new("alice") })
            .await
            .unwrap();

        let (_, message) = bob.receive_message().await.unwrap();
        assert_eq!(message.action(), "bye_ack");
        assert_eq!(network.delivered("bye"), 0);
        assert!(network.log()[0].dropped);
    }

    fn collecting_sink() -> (MediaEventSink, Arc<Mutex<Vec<MediaEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        (MediaEventSink::new(move |e| seen_clone.lock().push(e)), seen)
    }

    #[tokio::test]
    async fn test_simulated_transport_connects_after_candidate() {
        let factory = SimulatedMediaFactory::new();
        let (sink, seen) = collecting_sink();
        let transport = factory.create(&PeerId::new("bob"), &[], sink).unwrap();

        let media = transport
            .acquire_local_media(&MediaConstraints::video_call(VideoResolution::QVGA240))
            .await
            .unwrap();
        transport.add_local_media(media).await.unwrap();
        let offer = transport.create_offer().await.unwrap();
        assert!(has_video(&offer.sdp));
        transport.set_local_description(offer).await.unwrap();
        transport
            .set_remote_description(SessionDescription::answer("v=0\r\nm=audio 9 x\r\n"))
            .await
            .unwrap();
        assert!(!factory.last().unwrap().is_connected());

        transport
            .add_candidate(IceCandidate::new("audio", 0, "candidate:9 1 udp 1 10.0.0.2 9 typ host"))
            .await
            .unwrap();

        let simulated = factory.last().unwrap();
        assert!(simulated.is_connected());
        let events = seen.lock().clone();
        assert_eq!(events[0], MediaEvent::NegotiationNeeded);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, MediaEvent::CandidateGenerated(_)))
                .count(),
            2
        );
        assert!(events.contains(&MediaEvent::ConnectionStateChanged(ConnectionState::Connected)));
        assert_eq!(simulated.track_enabled(MediaKind::Video), Some(true));
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let factory = SimulatedMediaFactory::with_options(SimulatedMediaOptions {
            fail_create: true,
            ..Default::default()
        });
        assert!(matches!(
            factory.create(&PeerId::new("bob"), &[], MediaEventSink::noop()),
            Err(MediaError::InitFailed(_))
        ));

        factory.set_options(SimulatedMediaOptions {
            deny_media: true,
            ..Default::default()
        });
        let transport = factory.create(&PeerId::new("bob"), &[], MediaEventSink::noop()).unwrap();
        assert!(matches!(
            transport.acquire_local_media(&MediaConstraints::audio_only()).await,
            Err(MediaError::DeviceUnavailable(_))
        ));

        transport.close().await;
        assert!(factory.last().unwrap().is_closed());
        assert_eq!(transport.create_offer().await, Err(MediaError::Closed));
    }
}
