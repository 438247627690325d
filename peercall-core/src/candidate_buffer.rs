//! Pending connectivity candidates
//!
//! Candidates can arrive from the remote peer before the local negotiation
//! state is able to consume them. They are parked here in arrival order and
//! flushed once the negotiation coordinator says so. The buffer itself does
//! not know when that is.

use crate::media::MediaError;
use crate::types::IceCandidate;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Destination of drained candidates
#[async_trait]
pub trait CandidateSink: Send + Sync {
    /// Apply one remote candidate
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;
}

/// FIFO of candidates waiting for negotiation to become ready
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate; never fails
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Number of queued candidates
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything without applying it
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Flush all queued candidates into `sink` in arrival order
    ///
    /// Returns how many candidates were applied. A no-op on an empty buffer.
    ///
    /// # Errors
    ///
    /// Stops at the first candidate the sink rejects. That candidate is
    /// consumed; the ones behind it stay queued.
    pub async fn drain<S: CandidateSink + ?Sized>(&mut self, sink: &S) -> Result<usize, MediaError> {
        let mut applied = 0;
        while let Some(candidate) = self.queue.pop_front() {
            sink.add_candidate(candidate).await?;
            applied += 1;
        }
        if applied > 0 {
            tracing::trace!(applied, "Drained candidate buffer");
        }
        Ok(applied)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<String>>,
        reject: Option<String>,
    }

    #[async_trait]
    impl CandidateSink for RecordingSink {
        async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
            if self.reject.as_deref() == Some(candidate.candidate.as_str()) {
                return Err(MediaError::Rejected("bad candidate".to_string()));
            }
            self.applied.lock().push(candidate.candidate);
            Ok(())
        }
    }

    fn cand(s: &str) -> IceCandidate {
        IceCandidate::new("audio", 0, s)
    }

    #[tokio::test]
    async fn test_drain_applies_in_order_and_empties() {
        let mut buffer = CandidateBuffer::new();
        buffer.enqueue(cand("c1"));
        buffer.enqueue(cand("c2"));
        buffer.enqueue(cand("c3"));
        assert_eq!(buffer.len(), 3);

        let sink = RecordingSink::default();
        assert_eq!(buffer.drain(&sink).await.unwrap(), 3);
        assert!(buffer.is_empty());
        assert_eq!(*sink.applied.lock(), vec!["c1", "c2", "c3"]);

        // Second drain is a no-op
        assert_eq!(buffer.drain(&sink).await.unwrap(), 0);
        assert_eq!(sink.applied.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_drain_stops_at_rejected_candidate() {
        let mut buffer = CandidateBuffer::new();
        for c in ["c1", "bad", "c3"] {
            buffer.enqueue(cand(c));
        }
        let sink = RecordingSink {
            reject: Some("bad".to_string()),
            ..Default::default()
        };
        assert!(buffer.drain(&sink).await.is_err());
        assert_eq!(*sink.applied.lock(), vec!["c1"]);
        assert_eq!(buffer.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_drain_preserves_fifo_order(items in proptest::collection::vec("[a-z0-9]{1,8}", 0..32)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let mut buffer = CandidateBuffer::new();
            for item in &items {
                buffer.enqueue(cand(item));
            }
            let sink = RecordingSink::default();
            let applied = rt.block_on(buffer.drain(&sink)).unwrap();
            prop_assert_eq!(applied, items.len());
            prop_assert_eq!(sink.applied.lock().clone(), items);
        }
    }
}
