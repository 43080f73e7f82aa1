//! Latency metric logging.
//!
//! Each derived metric is logged at the moment its event fires, exactly
//! once per turn; the timeline's first-write-wins marks are what make the
//! "exactly once" hold even when more fragments or chunks arrive later.

use std::time::Duration;

use tracing::{debug, info, warn};
use tts_core::{FirstAudioLatency, SharedTimeline};

use crate::pipeline::TurnReport;

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

pub fn log_first_token(latency: Duration) {
    info!(target: "metrics", "time to first token: {:.2} ms", millis(latency));
}

pub fn log_token_interval(gap: Duration) {
    debug!(target: "metrics", "time since last token: {:.2} ms", millis(gap));
}

pub fn log_first_audio(latency: &FirstAudioLatency) {
    info!(target: "metrics", "time to first audio: {:.2} ms", millis(latency.since_text_start));
    if let Some(gap) = latency.since_first_token {
        info!(target: "metrics", "first token to first audio: {:.2} ms", millis(gap));
    }
}

/// End-of-turn summary: total wall time, plus a warning when the turn never
/// produced audio at all.
pub fn log_turn(report: &TurnReport, timeline: &SharedTimeline) {
    info!(target: "metrics", "total turn time: {:.2} ms", millis(report.elapsed));
    if timeline.lock().unwrap().time_to_first_audio().is_none() {
        warn!(target: "metrics", "no audio received for this turn");
    }
}
