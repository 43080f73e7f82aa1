//! Per-turn latency timeline.
//!
//! One `SessionTimeline` exists per conversational turn and is shared
//! between the pipeline tasks and the audio callback. Every field is
//! first-write-wins except `last_token`, which tracks the most recent
//! fragment so inter-token gaps can be derived.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct SessionTimeline {
    text_start: Option<Instant>,
    first_token: Option<Instant>,
    last_token: Option<Instant>,
    first_audio: Option<Instant>,
}

pub type SharedTimeline = Arc<Mutex<SessionTimeline>>;

/// Outcome of stamping a fragment arrival.
#[derive(Debug, Clone, Copy)]
pub enum TokenMark {
    /// First fragment of the turn; carries the time since text start.
    First(Duration),
    /// A later fragment; carries the gap since the previous one.
    Interval(Duration),
}

/// Latencies derived when the first audio chunk of a turn arrives.
#[derive(Debug, Clone, Copy)]
pub struct FirstAudioLatency {
    pub since_text_start: Duration,
    pub since_first_token: Option<Duration>,
}

impl SessionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_text_start(&mut self) {
        if self.text_start.is_none() {
            self.text_start = Some(Instant::now());
        }
    }

    /// Stamp a fragment arrival. Returns what the stamp means so the caller
    /// can log the derived latency exactly once.
    pub fn mark_token(&mut self) -> Option<TokenMark> {
        let now = Instant::now();
        let mark = if self.first_token.is_none() {
            self.first_token = Some(now);
            self.text_start.map(|start| TokenMark::First(now - start))
        } else {
            self.last_token.map(|prev| TokenMark::Interval(now - prev))
        };
        self.last_token = Some(now);
        mark
    }

    /// Stamp the first audio arrival. Returns the derived latencies on the
    /// first call of a turn and `None` on every later one.
    pub fn mark_first_audio(&mut self) -> Option<FirstAudioLatency> {
        if self.first_audio.is_some() {
            return None;
        }
        let start = self.text_start?;
        let now = Instant::now();
        self.first_audio = Some(now);
        Some(FirstAudioLatency {
            since_text_start: now - start,
            since_first_token: self.first_token.map(|token| now - token),
        })
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        match (self.text_start, self.first_token) {
            (Some(start), Some(token)) => Some(token - start),
            _ => None,
        }
    }

    pub fn time_to_first_audio(&self) -> Option<Duration> {
        match (self.text_start, self.first_audio) {
            (Some(start), Some(audio)) => Some(audio - start),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
