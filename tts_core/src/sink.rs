//! Audio sink: live playback plus durable accumulation.
//!
//! Chunks arrive from the speech session's message-handling task, so every
//! entry point here must tolerate being called while the pipeline is
//! running. Playback is best-effort; the accumulation buffer is not.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use anyhow::{bail, Context};
use tracing::{debug, warn};

use crate::timeline::{FirstAudioLatency, SharedTimeline};
use crate::wav;

#[derive(Default)]
struct Accumulated {
    data: Vec<u8>,
    chunks: usize,
}

/// Accepts synthesized PCM chunks as they arrive: plays them when an output
/// device is available and always appends them to the in-memory buffer for
/// the end-of-turn recording.
pub struct AudioSink {
    sample_rate: u32,
    inner: Mutex<Accumulated>,
    playback: Option<mpsc::Sender<Vec<f32>>>,
    timeline: SharedTimeline,
}

impl AudioSink {
    pub fn new(sample_rate: u32, timeline: SharedTimeline) -> Self {
        Self {
            sample_rate,
            inner: Mutex::new(Accumulated::default()),
            playback: spawn_playback(sample_rate),
            timeline,
        }
    }

    /// Buffer-only sink for environments without an output device.
    pub fn without_playback(sample_rate: u32, timeline: SharedTimeline) -> Self {
        Self {
            sample_rate,
            inner: Mutex::new(Accumulated::default()),
            playback: None,
            timeline,
        }
    }

    /// Accept one chunk of little-endian 16-bit mono PCM. Never fails:
    /// playback problems are logged and the chunk is buffered regardless.
    /// Returns the derived first-audio latencies on the first chunk of a
    /// turn so the caller can log them exactly once.
    pub fn handle_chunk(&self, chunk: &[u8]) -> Option<FirstAudioLatency> {
        {
            let mut acc = self.inner.lock().unwrap();
            acc.data.extend_from_slice(chunk);
            acc.chunks += 1;
            debug!(bytes = chunk.len(), buffered = acc.data.len(), "audio chunk received");
        }

        if let Some(playback) = &self.playback {
            let samples: Vec<f32> = chunk
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
                .collect();
            if playback.send(samples).is_err() {
                warn!("playback thread is gone, keeping buffer only");
            }
        }

        self.timeline.lock().unwrap().mark_first_audio()
    }

    /// Persist the accumulated buffer as a mono 16-bit wave file. Refuses
    /// to touch the filesystem when nothing was accumulated.
    pub fn flush(&self, path: &Path) -> anyhow::Result<()> {
        let data = {
            let acc = self.inner.lock().unwrap();
            if acc.data.is_empty() {
                bail!("no audio accumulated for this turn");
            }
            acc.data.clone()
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        wav::write_pcm(path, &data, self.sample_rate)
    }

    /// Clear buffered audio and timeline marks for the next turn.
    pub fn reset(&self) {
        {
            let mut acc = self.inner.lock().unwrap();
            acc.data.clear();
            acc.chunks = 0;
        }
        self.timeline.lock().unwrap().reset();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().unwrap().chunks
    }
}

/// The rodio stream handle is not `Send`, so playback lives on its own
/// thread fed through a channel. A missing device downgrades the sink to
/// buffer-only.
fn spawn_playback(sample_rate: u32) -> Option<mpsc::Sender<Vec<f32>>> {
    let (tx, rx) = mpsc::channel::<Vec<f32>>();
    let spawned = thread::Builder::new().name("tts-playback".into()).spawn(move || {
        let stream = match rodio::OutputStreamBuilder::open_default_stream() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("no audio output device, playback disabled: {e}");
                while rx.recv().is_ok() {}
                return;
            }
        };
        let sink = rodio::Sink::connect_new(stream.mixer());
        while let Ok(samples) = rx.recv() {
            sink.append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));
        }
        sink.sleep_until_end();
    });
    match spawned {
        Ok(_) => Some(tx),
        Err(e) => {
            warn!("could not start playback thread: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::SessionTimeline;
    use crate::SAMPLE_RATE;
    use std::sync::Arc;

    fn timeline() -> SharedTimeline {
        Arc::new(Mutex::new(SessionTimeline::new()))
    }

    fn temp_wav(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sink-{}-{}.wav", std::process::id(), name))
    }

    #[test]
    fn chunks_accumulate_in_arrival_order() {
        let sink = AudioSink::without_playback(SAMPLE_RATE, timeline());
        sink.handle_chunk(&[1, 0, 2, 0]);
        sink.handle_chunk(&[3, 0]);
        sink.handle_chunk(&[4, 0, 5, 0]);
        assert_eq!(sink.buffered_bytes(), 10);
        assert_eq!(sink.chunk_count(), 3);

        let path = temp_wav("order");
        sink.flush(&path).unwrap();
        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn flush_without_audio_fails_and_creates_no_file() {
        let sink = AudioSink::without_playback(SAMPLE_RATE, timeline());
        let path = temp_wav("empty");
        assert!(sink.flush(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn flush_failure_leaves_buffer_intact() {
        let sink = AudioSink::without_playback(SAMPLE_RATE, timeline());
        sink.handle_chunk(&[9, 0]);
        let unwritable = Path::new("/proc/does-not-exist/out.wav");
        assert!(sink.flush(unwritable).is_err());
        assert_eq!(sink.buffered_bytes(), 2);
    }

    #[test]
    fn first_chunk_derives_latency_once() {
        let shared = timeline();
        shared.lock().unwrap().mark_text_start();
        let sink = AudioSink::without_playback(SAMPLE_RATE, shared);
        assert!(sink.handle_chunk(&[0, 0]).is_some());
        assert!(sink.handle_chunk(&[0, 0]).is_none());
    }

    #[test]
    fn reset_clears_buffer_and_timeline() {
        let shared = timeline();
        shared.lock().unwrap().mark_text_start();
        let sink = AudioSink::without_playback(SAMPLE_RATE, Arc::clone(&shared));
        sink.handle_chunk(&[1, 0]);
        sink.reset();
        assert_eq!(sink.buffered_bytes(), 0);
        assert_eq!(sink.chunk_count(), 0);
        assert!(shared.lock().unwrap().time_to_first_audio().is_none());
        let path = temp_wav("reset");
        assert!(sink.flush(&path).is_err());
        assert!(!path.exists());
    }
}
