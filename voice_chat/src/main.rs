use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing::{error, info, warn};

use llm_core::{ChatMessage, LlmClient, LlmConfig};
use tts_core::{
    AudioCallback, AudioSink, SessionTimeline, SharedTimeline, SpeechSession, TtsRealtimeClient,
    TtsSessionConfig, SAMPLE_RATE,
};
use voice_chat::config::AppConfig;
use voice_chat::metrics;
use voice_chat::pipeline::{self, TurnReport};

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const EXIT_KEYWORDS: &[&str] = &["exit", "quit"];

#[derive(Parser, Debug)]
#[command(
    name = "voice-chat",
    about = "Stream LLM replies into a realtime TTS voice, with live playback and per-turn recordings"
)]
struct Args {
    /// Prompt to run as a single turn; omit for an interactive session
    #[arg(trailing_var_arg = true)]
    prompt: Vec<String>,

    /// Where per-turn WAV recordings are written (overrides OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    let args = Args::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    let mut history = vec![ChatMessage::system(SYSTEM_PROMPT)];

    if args.prompt.is_empty() {
        interactive_loop(&config, &mut history).await
    } else {
        let prompt = args.prompt.join(" ");
        let report = run_voice_turn(&config, &mut history, &prompt).await?;
        if let Some(err) = &report.error {
            error!("turn failed: {err}");
            std::process::exit(1);
        }
        Ok(())
    }
}

async fn interactive_loop(config: &AppConfig, history: &mut Vec<ChatMessage>) -> Result<()> {
    println!("Interactive voice chat. Type 'exit' or 'quit' to leave.");
    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if EXIT_KEYWORDS.contains(&prompt.to_lowercase().as_str()) {
            break;
        }

        match run_voice_turn(config, history, prompt).await {
            Ok(report) => {
                if let Some(err) = &report.error {
                    error!("turn failed: {err}");
                }
            }
            Err(e) => error!("turn aborted: {e:#}"),
        }
        println!("{}", "-".repeat(50));
    }
    Ok(())
}

/// One full turn: connect the speech session, stream the model reply
/// through the pipeline, then drain the recording and reset for the next
/// prompt. Per-turn state (timeline, sink, session) is created here and
/// dropped here.
async fn run_voice_turn(
    config: &AppConfig,
    history: &mut Vec<ChatMessage>,
    prompt: &str,
) -> Result<TurnReport> {
    let timeline: SharedTimeline = Arc::new(Mutex::new(SessionTimeline::new()));
    let sink = Arc::new(AudioSink::new(SAMPLE_RATE, Arc::clone(&timeline)));

    let callback: AudioCallback = {
        let sink = Arc::clone(&sink);
        Arc::new(move |chunk: Bytes| {
            if let Some(latency) = sink.handle_chunk(&chunk) {
                metrics::log_first_audio(&latency);
            }
        })
    };

    let llm = LlmClient::new(LlmConfig {
        api_key: config.api_key.clone(),
        base_url: config.llm_base_url.clone(),
        model: config.llm_model.clone(),
        request_timeout: config.llm_timeout(),
    })
    .context("building LLM client")?;

    let client = Arc::new(TtsRealtimeClient::new(
        TtsSessionConfig {
            url: config.tts_url.clone(),
            api_key: config.api_key.clone(),
            voice: config.tts_voice.clone(),
            language: config.tts_language.clone(),
            sample_rate: SAMPLE_RATE,
        },
        callback,
    ));
    info!("connecting to the speech service");
    client.connect().await.context("speech session connect failed")?;

    // Audio is delivered only while this task runs.
    let message_handler = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.handle_messages().await }
    });

    history.push(ChatMessage::user(prompt));
    let stream = llm.chat_stream(history.clone());

    print!("Assistant: ");
    std::io::stdout().flush()?;

    let session: Arc<dyn SpeechSession> = client.clone();
    let report = pipeline::run_turn(stream, session, Arc::clone(&timeline), &config.pipeline()).await;

    // The grace period already ran inside the pipeline; anything the remote
    // session still holds is dropped, not drained.
    client.close().await;
    message_handler.abort();
    let _ = message_handler.await;

    if report.is_ok() {
        history.push(ChatMessage::assistant(report.reply.clone()));
    } else {
        history.pop();
    }

    metrics::log_turn(&report, &timeline);

    let filename = format!("turn-{}.wav", chrono::Local::now().format("%Y%m%d-%H%M%S"));
    let output_path = config.output_dir.join(filename);
    match sink.flush(&output_path) {
        Ok(()) => info!(path = %output_path.display(), "audio saved"),
        Err(e) => warn!("audio not saved: {e:#}"),
    }
    sink.reset();

    Ok(report)
}
