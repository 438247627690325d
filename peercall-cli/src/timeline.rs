//! Console rendering of call events

use peercall_core::{CallDirection, CallEvent};
use std::time::Instant;

/// Relative timestamps for events printed during one demo run
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    start: Instant,
}

impl Timeline {
    /// Timeline starting now
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// One console line for `event` seen by `party`
    pub fn line(&self, party: &str, event: &CallEvent) -> String {
        let elapsed = self.start.elapsed();
        format!(
            "[{:>6.3}s] {:<10} {} {}",
            elapsed.as_secs_f64(),
            party,
            icon(event),
            describe(event)
        )
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

fn icon(event: &CallEvent) -> &'static str {
    match event {
        CallEvent::Call { .. } | CallEvent::ReverseCall { .. } => "📞",
        CallEvent::InProgress { .. } => "🎙️",
        CallEvent::Ringing { .. } => "🔔",
        CallEvent::Connected { .. } => "✅",
        CallEvent::Hold { .. } => "⏸️",
        CallEvent::Ended { .. } => "👋",
        CallEvent::Failed { .. } => "❌",
    }
}

/// Human-readable description of an event
pub fn describe(event: &CallEvent) -> String {
    let session = event.session();
    let peer = session.peer();
    match event {
        CallEvent::Call { video, .. } => {
            let kind = if *video { "video" } else { "audio" };
            match session.direction() {
                CallDirection::Outgoing => format!("calling {peer} ({kind})"),
                CallDirection::Incoming => format!("incoming {kind} call from {peer}"),
            }
        }
        CallEvent::InProgress { .. } => "acquiring local media".to_string(),
        CallEvent::Ringing { .. } => format!("{peer} is ringing"),
        CallEvent::Connected { .. } => format!("connected with {peer}"),
        CallEvent::Hold { .. } => format!("{peer} put the call on hold"),
        CallEvent::Ended { reason, .. } => match session.duration() {
            Some(d) => format!(
                "call with {peer} ended ({reason}) after {}.{:03}s",
                d.num_seconds(),
                d.num_milliseconds() % 1000
            ),
            None => format!("call with {peer} ended ({reason})"),
        },
        CallEvent::Failed { code, .. } => format!("call with {peer} failed with code {code}"),
        CallEvent::ReverseCall { .. } => format!("{peer} turned the call around"),
    }
}
