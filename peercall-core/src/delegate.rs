//! Lifecycle notifications
//!
//! The engine reports every call milestone to a [`CallDelegate`]. Methods are
//! synchronous and run on the session task; implementations must not block.

use crate::types::{CallSession, EndReason, StateCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Receiver of call lifecycle events
///
/// Each method fires at most once per logical event. Every session that is
/// announced eventually gets exactly one of `on_call_ended` or
/// `on_call_failed`.
pub trait CallDelegate: Send + Sync {
    /// A call was placed (`Outgoing`) or an invite arrived (`Incoming`)
    fn on_call(&self, _session: &CallSession, _video: bool) {}

    /// Media acquisition started for the session
    fn on_in_progress(&self, _session: &CallSession) {}

    /// The remote side is ringing
    fn on_call_ringing(&self, _session: &CallSession) {}

    /// The call is established
    fn on_call_connected(&self, _session: &CallSession) {}

    /// The remote side put the call on hold
    fn on_call_hold(&self, _session: &CallSession) {}

    /// The call ended normally
    fn on_call_ended(&self, _session: &CallSession, _reason: EndReason) {}

    /// The call failed
    fn on_call_failed(&self, _session: &CallSession, _code: StateCode) {}

    /// The remote side turned the call around and is now offering
    fn on_reverse_call(&self, _session: &CallSession) {}
}

/// Delegate that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl CallDelegate for NoopDelegate {}

/// Owned form of a delegate callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// See [`CallDelegate::on_call`]
    Call {
        /// Session snapshot
        session: CallSession,
        /// Whether video was requested or offered
        video: bool,
    },
    /// See [`CallDelegate::on_in_progress`]
    InProgress {
        /// Session snapshot
        session: CallSession,
    },
    /// See [`CallDelegate::on_call_ringing`]
    Ringing {
        /// Session snapshot
        session: CallSession,
    },
    /// See [`CallDelegate::on_call_connected`]
    Connected {
        /// Session snapshot
        session: CallSession,
    },
    /// See [`CallDelegate::on_call_hold`]
    Hold {
        /// Session snapshot
        session: CallSession,
    },
    /// See [`CallDelegate::on_call_ended`]
    Ended {
        /// Session snapshot
        session: CallSession,
        /// Why it ended
        reason: EndReason,
    },
    /// See [`CallDelegate::on_call_failed`]
    Failed {
        /// Session snapshot
        session: CallSession,
        /// Failure code
        code: StateCode,
    },
    /// See [`CallDelegate::on_reverse_call`]
    ReverseCall {
        /// Session snapshot
        session: CallSession,
    },
}

impl CallEvent {
    /// Session snapshot taken when the event fired
    pub fn session(&self) -> &CallSession {
        match self {
            Self::Call { session, .. }
            | Self::InProgress { session }
            | Self::Ringing { session }
            | Self::Connected { session }
            | Self::Hold { session }
            | Self::Ended { session, .. }
            | Self::Failed { session, .. }
            | Self::ReverseCall { session } => session,
        }
    }

    /// Short event name, used in logs and test assertions
    pub fn name(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::InProgress { .. } => "in_progress",
            Self::Ringing { .. } => "ringing",
            Self::Connected { .. } => "connected",
            Self::Hold { .. } => "hold",
            Self::Ended { .. } => "ended",
            Self::Failed { .. } => "failed",
            Self::ReverseCall { .. } => "reverse_call",
        }
    }

    /// Whether this is the session's final notification
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Failed { .. })
    }
}

/// Delegate that republishes every callback on a broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastDelegate {
    event_sender: broadcast::Sender<CallEvent>,
}

impl BroadcastDelegate {
    /// Delegate with room for `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (event_sender, _) = broadcast::channel(capacity);
        Self { event_sender }
    }

    /// Subscribe to call events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    fn publish(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }
}

impl Default for BroadcastDelegate {
    fn default() -> Self {
        Self::new(256)
    }
}

impl CallDelegate for BroadcastDelegate {
    fn on_call(&self, session: &CallSession, video: bool) {
        self.publish(CallEvent::Call {
            session: session.clone(),
            video,
        });
    }

    fn on_in_progress(&self, session: &CallSession) {
        self.publish(CallEvent::InProgress {
            session: session.clone(),
        });
    }

    fn on_call_ringing(&self, session: &CallSession) {
        self.publish(CallEvent::Ringing {
            session: session.clone(),
        });
    }

    fn on_call_connected(&self, session: &CallSession) {
        self.publish(CallEvent::Connected {
            session: session.clone(),
        });
    }

    fn on_call_hold(&self, session: &CallSession) {
        self.publish(CallEvent::Hold {
            session: session.clone(),
        });
    }

    fn on_call_ended(&self, session: &CallSession, reason: EndReason) {
        self.publish(CallEvent::Ended {
            session: session.clone(),
            reason,
        });
    }

    fn on_call_failed(&self, session: &CallSession, code: StateCode) {
        self.publish(CallEvent::Failed {
            session: session.clone(),
            code,
        });
    }

    fn on_reverse_call(&self, session: &CallSession) {
        self.publish(CallEvent::ReverseCall {
            session: session.clone(),
        });
    }
}

/// Delegate that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingDelegate {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far, oldest first
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().clone()
    }

    /// Event names so far, oldest first
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(CallEvent::name).collect()
    }

    /// Number of recorded events named `name`
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: CallEvent) {
        self.events.lock().push(event);
    }
}

impl CallDelegate for RecordingDelegate {
    fn on_call(&self, session: &CallSession, video: bool) {
        self.record(CallEvent::Call {
            session: session.clone(),
            video,
        });
    }

    fn on_in_progress(&self, session: &CallSession) {
        self.record(CallEvent::InProgress {
            session: session.clone(),
        });
    }

    fn on_call_ringing(&self, session: &CallSession) {
        self.record(CallEvent::Ringing {
            session: session.clone(),
        });
    }

    fn on_call_connected(&self, session: &CallSession) {
        self.record(CallEvent::Connected {
            session: session.clone(),
        });
    }

    fn on_call_hold(&self, session: &CallSession) {
        self.record(CallEvent::Hold {
            session: session.clone(),
        });
    }

    fn on_call_ended(&self, session: &CallSession, reason: EndReason) {
        self.record(CallEvent::Ended {
            session: session.clone(),
            reason,
        });
    }

    fn on_call_failed(&self, session: &CallSession, code: StateCode) {
        self.record(CallEvent::Failed {
            session: session.clone(),
            code,
        });
    }

    fn on_reverse_call(&self, session: &CallSession) {
        self.record(CallEvent::ReverseCall {
            session: session.clone(),
        });
    }
}
