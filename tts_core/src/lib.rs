mod realtime;
mod sink;
mod timeline;
mod wav;

pub use realtime::{
    AudioCallback, ClientEvent, ServerEvent, SessionSettings, SpeechSession, TtsError,
    TtsRealtimeClient, TtsSessionConfig,
};
pub use sink::AudioSink;
pub use timeline::{FirstAudioLatency, SessionTimeline, SharedTimeline, TokenMark};

/// PCM format produced by the realtime synthesizer and persisted to disk.
pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;
