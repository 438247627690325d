//! Session description helpers
//!
//! Pure string transforms applied to descriptions before they leave the
//! engine. The engine never parses SDP beyond these line-level checks.

use serde::{Deserialize, Serialize};

/// Bandwidth caps written into outgoing descriptions as `b=AS:` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthHints {
    /// Audio cap in kbps
    pub audio_kbps: u32,
    /// Video cap in kbps
    pub video_kbps: u32,
}

impl Default for BandwidthHints {
    fn default() -> Self {
        Self {
            audio_kbps: 70,
            video_kbps: 512,
        }
    }
}

const AUDIO_MIDS: [&str; 2] = ["a=mid:audio", "a=mid:sdparta_0"];
const VIDEO_MIDS: [&str; 2] = ["a=mid:video", "a=mid:sdparta_1"];
const BANDWIDTH_PREFIX: &str = "b=AS:";

fn cap_for(line: &str, hints: BandwidthHints) -> Option<u32> {
    if AUDIO_MIDS.contains(&line) {
        Some(hints.audio_kbps)
    } else if VIDEO_MIDS.contains(&line) {
        Some(hints.video_kbps)
    } else {
        None
    }
}

/// Insert a `b=AS:` line after every audio/video `a=mid:` line
///
/// An existing `b=AS:` line directly after the mid line is rewritten rather
/// than duplicated, so applying the transform twice yields the same text.
/// Mid lines without a line terminator are left alone.
pub fn apply_bandwidth(sdp: &str, hints: BandwidthHints) -> String {
    let mut out = String::with_capacity(sdp.len() + 32);
    let mut pending: Option<(u32, &str)> = None;

    for line in sdp.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        if let Some((kbps, eol)) = pending.take() {
            out.push_str(BANDWIDTH_PREFIX);
            out.push_str(&kbps.to_string());
            out.push_str(eol);
            if content.starts_with(BANDWIDTH_PREFIX) {
                continue;
            }
        }
        out.push_str(line);

        let eol = &line[content.len()..];
        if eol.is_empty() {
            continue;
        }
        if let Some(kbps) = cap_for(content, hints) {
            pending = Some((kbps, eol));
        }
    }

    if let Some((kbps, eol)) = pending {
        out.push_str(BANDWIDTH_PREFIX);
        out.push_str(&kbps.to_string());
        out.push_str(eol);
    }
    out
}

/// Whether a description offers a video stream
pub fn has_video(sdp: &str) -> bool {
    sdp.contains("m=video")
}
