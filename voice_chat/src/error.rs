use thiserror::Error;

/// Ways a single turn can fail. None of these abort the process; they are
/// carried in the turn report and rendered by the caller.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("text generation failed: {0}")]
    Generation(String),

    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("text producer stalled beyond the retry budget")]
    StalledProducer,
}
