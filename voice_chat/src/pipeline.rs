//! Streaming pipeline coordinator.
//!
//! One turn runs two tasks against a FIFO queue: the generation task pulls
//! fragments off the model stream and enqueues them, the forwarding loop
//! dequeues and appends them to the speech session. The queue item is a
//! tagged variant so an empty fragment can never be mistaken for the end
//! marker, and the generation task enqueues exactly one end marker on every
//! exit path, which is what guarantees the forwarding loop terminates.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{pin_mut, Stream, StreamExt};
use llm_core::LlmError;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};
use tts_core::{SharedTimeline, SpeechSession, TokenMark};

use crate::error::TurnError;
use crate::metrics;

enum QueueItem {
    Fragment(String),
    EndOfStream,
}

/// Tuning knobs for one turn.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Longest the forwarding loop waits for one queue pop.
    pub pop_timeout: Duration,
    /// How many consecutive pop timeouts are tolerated before the turn is
    /// declared stalled.
    pub pop_retries: u32,
    /// Pause after each forwarded fragment, to pace the transport.
    pub pacing: Duration,
    /// Wait after both tasks finish so trailing audio can play out.
    pub drain_grace: Duration,
    /// Print fragments to stdout as they arrive.
    pub echo_text: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(30),
            pop_retries: 3,
            pacing: Duration::from_millis(50),
            drain_grace: Duration::from_secs(5),
            echo_text: true,
        }
    }
}

/// Outcome of one turn.
#[derive(Debug)]
pub struct TurnReport {
    /// Full assistant reply assembled from the fragments.
    pub reply: String,
    pub fragments_forwarded: usize,
    pub error: Option<TurnError>,
    pub elapsed: Duration,
}

impl TurnReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Run one turn: generation and forwarding concurrently, then the drain
/// grace period. All failures are folded into the report instead of
/// crossing task boundaries.
pub async fn run_turn<S>(
    stream: S,
    session: Arc<dyn SpeechSession>,
    timeline: SharedTimeline,
    config: &PipelineConfig,
) -> TurnReport
where
    S: Stream<Item = Result<String, LlmError>> + Send + 'static,
{
    let started = Instant::now();
    timeline.lock().unwrap().mark_text_start();

    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let generator = tokio::spawn(pump_fragments(stream, queue_tx, timeline.clone(), config.echo_text));
    let forwarder = tokio::spawn(forward_fragments(queue_rx, session, config.clone()));

    let (fragments_forwarded, forward_error) = match forwarder.await {
        Ok(outcome) => outcome,
        Err(e) => (0, Some(TurnError::Synthesis(format!("forwarding task failed: {e}")))),
    };

    // A stalled producer may never complete on its own; everything else
    // unwinds once the queue's receiving side is gone.
    if matches!(forward_error, Some(TurnError::StalledProducer)) {
        generator.abort();
    }
    let (reply, generation_error) = match generator.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => (String::new(), None),
        Err(e) => (String::new(), Some(TurnError::Generation(format!("generation task failed: {e}")))),
    };

    sleep(config.drain_grace).await;

    TurnReport {
        reply,
        fragments_forwarded,
        error: generation_error.or(forward_error),
        elapsed: started.elapsed(),
    }
}

/// Drain the model stream into the queue. Always enqueues exactly one end
/// marker, whether the stream completed, failed, or the consumer went away.
async fn pump_fragments<S>(
    stream: S,
    queue: mpsc::UnboundedSender<QueueItem>,
    timeline: SharedTimeline,
    echo: bool,
) -> (String, Option<TurnError>)
where
    S: Stream<Item = Result<String, LlmError>> + Send,
{
    pin_mut!(stream);
    let mut reply = String::new();
    let mut failure = None;
    while let Some(next) = stream.next().await {
        match next {
            Ok(fragment) => {
                match timeline.lock().unwrap().mark_token() {
                    Some(TokenMark::First(latency)) => metrics::log_first_token(latency),
                    Some(TokenMark::Interval(gap)) => metrics::log_token_interval(gap),
                    None => {}
                }
                if echo {
                    print!("{fragment}");
                    let _ = std::io::stdout().flush();
                }
                reply.push_str(&fragment);
                if queue.send(QueueItem::Fragment(fragment)).is_err() {
                    debug!("forwarding loop ended early, stopping generation");
                    break;
                }
            }
            Err(e) => {
                failure = Some(TurnError::Generation(e.to_string()));
                break;
            }
        }
    }
    let _ = queue.send(QueueItem::EndOfStream);
    if echo && !reply.is_empty() {
        println!();
    }
    (reply, failure)
}

/// Pop queue items and feed the speech session. The session's finish
/// operation is invoked exactly once on every exit path.
async fn forward_fragments(
    mut queue: mpsc::UnboundedReceiver<QueueItem>,
    session: Arc<dyn SpeechSession>,
    config: PipelineConfig,
) -> (usize, Option<TurnError>) {
    let mut forwarded = 0usize;
    let mut stalls = 0u32;
    let mut failure = None;
    let mut finished = false;
    loop {
        match timeout(config.pop_timeout, queue.recv()).await {
            Ok(Some(QueueItem::Fragment(text))) => {
                stalls = 0;
                if let Err(e) = session.append_text(&text).await {
                    failure = Some(TurnError::Synthesis(e.to_string()));
                    break;
                }
                forwarded += 1;
                sleep(config.pacing).await;
            }
            Ok(Some(QueueItem::EndOfStream)) => {
                if let Err(e) = session.finish_session().await {
                    warn!("finish_session failed: {e}");
                    if failure.is_none() {
                        failure = Some(TurnError::Synthesis(e.to_string()));
                    }
                }
                finished = true;
                break;
            }
            Ok(None) => {
                // The producer always sends the end marker before dropping
                // its handle, so a bare close means it died abnormally.
                warn!("fragment queue closed before the end marker");
                break;
            }
            Err(_) => {
                stalls += 1;
                if stalls > config.pop_retries {
                    error!("producer stalled {stalls} times, giving up on this turn");
                    failure = Some(TurnError::StalledProducer);
                    break;
                }
                warn!(
                    attempt = stalls,
                    max = config.pop_retries,
                    "no fragment within {:?}, waiting again",
                    config.pop_timeout
                );
            }
        }
    }
    if !finished {
        if let Err(e) = session.finish_session().await {
            warn!("finish_session failed during teardown: {e}");
        }
    }
    (forwarded, failure)
}
