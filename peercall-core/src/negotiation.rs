//! Offer/answer sequencing against the media transport
//!
//! The coordinator owns the order of operations for one session:
//!
//! ```text
//!  initiator:  Idle --negotiation needed / create+commit offer--> HaveLocalOffer
//!              HaveLocalOffer --apply remote answer--> Stable
//!  responder:  Idle --apply remote offer--> HaveRemoteOffer
//!              HaveRemoteOffer --create+commit answer--> Stable
//! ```
//!
//! Remote candidates are queued in a [`CandidateBuffer`] until the phase is
//! `Stable`, i.e. until the local description has been created and committed
//! and the remote description has been applied. The buffer is drained right
//! after the transition into `Stable`.

use crate::candidate_buffer::CandidateBuffer;
use crate::media::{MediaError, MediaTransport};
use crate::sdp::{apply_bandwidth, BandwidthHints};
use crate::types::{IceCandidate, SessionDescription};
use std::sync::Arc;
use thiserror::Error;

/// Negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Operation invoked in the wrong phase or role
    #[error("{operation} not allowed in phase {phase:?}")]
    OutOfOrder {
        /// Rejected operation
        operation: &'static str,
        /// Phase at the time
        phase: NegotiationPhase,
    },

    /// The media transport rejected an operation
    #[error("Media transport fault: {0}")]
    Transport(#[from] MediaError),
}

/// Offer/answer progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Nothing applied yet
    Idle,
    /// Local offer committed, waiting for the remote answer
    HaveLocalOffer,
    /// Remote offer applied, local answer not committed yet
    HaveRemoteOffer,
    /// Both descriptions in place; candidates flow straight through
    Stable,
    /// The transport rejected an operation
    Failed,
    /// Torn down
    Closed,
}

/// Sequences description and candidate operations for one session
pub struct NegotiationCoordinator {
    transport: Arc<dyn MediaTransport>,
    initiator: bool,
    phase: NegotiationPhase,
    buffer: CandidateBuffer,
    hints: BandwidthHints,
}

impl NegotiationCoordinator {
    /// Coordinator for a fresh negotiation round
    pub fn new(transport: Arc<dyn MediaTransport>, initiator: bool, hints: BandwidthHints) -> Self {
        Self {
            transport,
            initiator,
            phase: NegotiationPhase::Idle,
            buffer: CandidateBuffer::new(),
            hints,
        }
    }

    /// The media transport being driven
    pub fn transport(&self) -> &Arc<dyn MediaTransport> {
        &self.transport
    }

    /// Current phase
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Whether this side creates the offer
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Whether remote candidates may go straight to the transport
    pub fn can_add_ice_candidate(&self) -> bool {
        self.phase == NegotiationPhase::Stable
    }

    /// Candidates still waiting in the buffer
    pub fn pending_candidates(&self) -> usize {
        self.buffer.len()
    }

    /// React to the transport asking for negotiation
    ///
    /// Creates, annotates and commits the offer on the initiator's first
    /// request of the round. Returns `None` when this side does not offer or
    /// the offer for this round already exists.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects offer creation or commit
    #[tracing::instrument(skip(self), fields(phase = ?self.phase))]
    pub async fn on_negotiation_needed(&mut self) -> Result<Option<SessionDescription>, NegotiationError> {
        if !self.initiator || self.phase != NegotiationPhase::Idle {
            tracing::trace!("Negotiation request ignored");
            return Ok(None);
        }

        tracing::debug!("Creating offer");
        let offer = self.guard(self.transport.create_offer().await)?;
        let offer = self.annotate(offer);
        self.guard(self.transport.set_local_description(offer.clone()).await)?;
        self.phase = NegotiationPhase::HaveLocalOffer;
        Ok(Some(offer))
    }

    /// Apply the remote offer (responder side)
    ///
    /// # Errors
    ///
    /// Returns error if called out of order or the transport rejects it
    #[tracing::instrument(skip(self, sdp), fields(phase = ?self.phase, sdp_len = sdp.len()))]
    pub async fn apply_remote_offer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        self.expect("apply_remote_offer", !self.initiator, NegotiationPhase::Idle)?;
        self.guard(
            self.transport
                .set_remote_description(SessionDescription::offer(sdp))
                .await,
        )?;
        self.phase = NegotiationPhase::HaveRemoteOffer;
        Ok(())
    }

    /// Create, annotate and commit the answer, then drain queued candidates
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer was applied or the transport fails
    #[tracing::instrument(skip(self), fields(phase = ?self.phase))]
    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.expect("create_answer", !self.initiator, NegotiationPhase::HaveRemoteOffer)?;
        tracing::debug!("Creating answer");
        let answer = self.guard(self.transport.create_answer().await)?;
        let answer = self.annotate(answer);
        self.guard(self.transport.set_local_description(answer.clone()).await)?;
        self.enter_stable().await?;
        Ok(answer)
    }

    /// Apply the remote answer (initiator side), then drain queued candidates
    ///
    /// # Errors
    ///
    /// Returns error if no local offer is pending or the transport rejects it
    #[tracing::instrument(skip(self, sdp), fields(phase = ?self.phase, sdp_len = sdp.len()))]
    pub async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        self.expect("apply_remote_answer", self.initiator, NegotiationPhase::HaveLocalOffer)?;
        self.guard(
            self.transport
                .set_remote_description(SessionDescription::answer(sdp))
                .await,
        )?;
        self.enter_stable().await
    }

    /// Apply a remote candidate now if negotiation allows, else queue it
    ///
    /// Returns `true` if the candidate went to the transport immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the candidate
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<bool, NegotiationError> {
        match self.phase {
            NegotiationPhase::Stable => {
                self.guard(self.transport.add_candidate(candidate).await)?;
                Ok(true)
            }
            NegotiationPhase::Failed | NegotiationPhase::Closed => {
                tracing::debug!(phase = ?self.phase, "Dropping candidate for finished negotiation");
                Ok(false)
            }
            _ => {
                self.buffer.enqueue(candidate);
                tracing::trace!(queued = self.buffer.len(), "Candidate queued");
                Ok(false)
            }
        }
    }

    /// Drop queued candidates and shut the transport down
    pub async fn close(&mut self) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }
        self.buffer.clear();
        self.phase = NegotiationPhase::Closed;
        self.transport.close().await;
    }

    async fn enter_stable(&mut self) -> Result<(), NegotiationError> {
        self.phase = NegotiationPhase::Stable;
        let drained = self.buffer.drain(self.transport.as_ref()).await;
        let drained = self.guard(drained)?;
        if drained > 0 {
            tracing::debug!(drained, "Applied queued candidates");
        }
        Ok(())
    }

    fn annotate(&self, mut description: SessionDescription) -> SessionDescription {
        description.sdp = apply_bandwidth(&description.sdp, self.hints);
        description
    }

    fn expect(&self, operation: &'static str, role_ok: bool, phase: NegotiationPhase) -> Result<(), NegotiationError> {
        if role_ok && self.phase == phase {
            Ok(())
        } else {
            Err(NegotiationError::OutOfOrder {
                operation,
                phase: self.phase,
            })
        }
    }

    fn guard<T>(&mut self, result: Result<T, MediaError>) -> Result<T, NegotiationError> {
        result.map_err(|e| {
            tracing::warn!(error = %e, "Negotiation fault");
            self.phase = NegotiationPhase::Failed;
            NegotiationError::Transport(e)
        })
    }
}

impl std::fmt::Debug for NegotiationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationCoordinator")
            .field("initiator", &self.initiator)
            .field("phase", &self.phase)
            .field("pending_candidates", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::candidate_buffer::CandidateSink;
    use crate::media::LocalMedia;
    use crate::types::{MediaConstraints, MediaKind, SdpKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct ScriptedTransport {
        log: Mutex<Vec<String>>,
        reject_remote: bool,
    }

    impl ScriptedTransport {
        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl CandidateSink for ScriptedTransport {
        async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
            self.log.lock().push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }
    }

    #[async_trait]
    impl MediaTransport for ScriptedTransport {
        async fn acquire_local_media(&self, _c: &MediaConstraints) -> Result<LocalMedia, MediaError> {
            unreachable!("not used by the coordinator")
        }
        async fn add_local_media(&self, _m: LocalMedia) -> Result<(), MediaError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
            self.log.lock().push("create_offer".into());
            Ok(SessionDescription::offer("v=0\r\nm=audio 9 x\r\na=mid:audio\r\n"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
            self.log.lock().push("create_answer".into());
            Ok(SessionDescription::answer("v=0\r\nm=audio 9 x\r\na=mid:audio\r\n"))
        }
        async fn set_local_description(&self, d: SessionDescription) -> Result<(), MediaError> {
            self.log.lock().push(format!("set_local:{:?}", d.kind));
            Ok(())
        }
        async fn set_remote_description(&self, d: SessionDescription) -> Result<(), MediaError> {
            if self.reject_remote {
                return Err(MediaError::Rejected("malformed".into()));
            }
            self.log.lock().push(format!("set_remote:{:?}", d.kind));
            Ok(())
        }
        async fn set_track_enabled(&self, _k: MediaKind, _e: bool) -> Result<(), MediaError> {
            Ok(())
        }
        async fn close(&self) {
            self.log.lock().push("close".into());
        }
    }

    fn cand(s: &str) -> IceCandidate {
        IceCandidate::new("audio", 0, s)
    }

    #[tokio::test]
    async fn test_initiator_queues_until_answer_applied() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut coord = NegotiationCoordinator::new(transport.clone(), true, BandwidthHints::default());

        assert!(!coord.add_remote_candidate(cand("early")).await.unwrap());
        let offer = coord.on_negotiation_needed().await.unwrap().unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("b=AS:70"));
        assert_eq!(coord.phase(), NegotiationPhase::HaveLocalOffer);

        // Still not stable: local committed, remote missing
        assert!(!coord.add_remote_candidate(cand("second")).await.unwrap());
        assert_eq!(coord.pending_candidates(), 2);

        coord.apply_remote_answer("v=0\r\n").await.unwrap();
        assert!(coord.can_add_ice_candidate());
        assert_eq!(coord.pending_candidates(), 0);
        assert!(coord.add_remote_candidate(cand("late")).await.unwrap());

        assert_eq!(
            transport.log(),
            vec![
                "create_offer",
                "set_local:Offer",
                "set_remote:Answer",
                "candidate:early",
                "candidate:second",
                "candidate:late",
            ]
        );
    }

    #[tokio::test]
    async fn test_offer_created_once_per_round() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut coord = NegotiationCoordinator::new(transport.clone(), true, BandwidthHints::default());
        assert!(coord.on_negotiation_needed().await.unwrap().is_some());
        assert!(coord.on_negotiation_needed().await.unwrap().is_none());
        assert_eq!(transport.log().iter().filter(|l| *l == "create_offer").count(), 1);
    }

    #[tokio::test]
    async fn test_responder_never_offers() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut coord = NegotiationCoordinator::new(transport.clone(), false, BandwidthHints::default());
        assert!(coord.on_negotiation_needed().await.unwrap().is_none());
        assert!(transport.log().is_empty());
    }

    #[tokio::test]
    async fn test_responder_drains_after_answer_commit() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut coord = NegotiationCoordinator::new(transport.clone(), false, BandwidthHints::default());

        // Answer before any remote offer is out of order
        let err = coord.create_answer().await.unwrap_err();
        assert!(matches!(err, NegotiationError::OutOfOrder { operation: "create_answer", .. }));

        coord.apply_remote_offer("v=0\r\nm=video 9 x\r\n").await.unwrap();
        coord.add_remote_candidate(cand("c1")).await.unwrap();
        assert!(!coord.can_add_ice_candidate());

        let answer = coord.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(coord.can_add_ice_candidate());
        assert_eq!(
            transport.log(),
            vec![
                "set_remote:Offer",
                "create_answer",
                "set_local:Answer",
                "candidate:c1",
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_rejection_is_a_fault() {
        let transport = Arc::new(ScriptedTransport {
            reject_remote: true,
            ..Default::default()
        });
        let mut coord = NegotiationCoordinator::new(transport, true, BandwidthHints::default());
        coord.on_negotiation_needed().await.unwrap();
        let err = coord.apply_remote_answer("garbage").await.unwrap_err();
        assert!(matches!(err, NegotiationError::Transport(MediaError::Rejected(_))));
        assert_eq!(coord.phase(), NegotiationPhase::Failed);
        assert!(!coord.can_add_ice_candidate());
    }

    #[tokio::test]
    async fn test_close_discards_queue_once() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut coord = NegotiationCoordinator::new(transport.clone(), true, BandwidthHints::default());
        coord.add_remote_candidate(cand("c1")).await.unwrap();
        coord.close().await;
        coord.close().await;
        assert_eq!(coord.pending_candidates(), 0);
        assert_eq!(transport.log(), vec!["close"]);
        assert!(!coord.add_remote_candidate(cand("c2")).await.unwrap());
    }
}
