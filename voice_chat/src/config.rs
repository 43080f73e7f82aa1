// Configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::pipeline::PipelineConfig;

const DEFAULT_LLM_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
const DEFAULT_TTS_URL: &str =
    "wss://dashscope.aliyuncs.com/api-ws/v1/realtime?model=qwen3-tts-flash-realtime";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub tts_url: String,
    pub tts_voice: String,
    pub tts_language: String,
    pub output_dir: PathBuf,
    pub pop_timeout_secs: u64,
    pub pop_retries: u32,
    pub pacing_ms: u64,
    pub drain_grace_secs: u64,
}

impl AppConfig {
    /// Read configuration from the environment. The API credential is the
    /// only required value; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("DASHSCOPE_API_KEY")
            .map_err(|_| anyhow!("DASHSCOPE_API_KEY is not set; export it or add it to a .env file"))?;
        Ok(Self {
            api_key,
            llm_base_url: env_or("LLM_BASE_URL", DEFAULT_LLM_BASE_URL),
            llm_model: env_or("LLM_MODEL", "qwen3-max"),
            llm_timeout_secs: env_parse("LLM_TIMEOUT_SECS", 120),
            tts_url: env_or("TTS_URL", DEFAULT_TTS_URL),
            tts_voice: env_or("TTS_VOICE", "Cherry"),
            tts_language: env_or("TTS_LANGUAGE", "Auto"),
            output_dir: PathBuf::from(env_or("OUTPUT_DIR", "outputs")),
            pop_timeout_secs: env_parse("QUEUE_POP_TIMEOUT_SECS", 30),
            pop_retries: env_parse("QUEUE_POP_RETRIES", 3),
            pacing_ms: env_parse("FORWARD_PACING_MS", 50),
            drain_grace_secs: env_parse("DRAIN_GRACE_SECS", 5),
        })
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            pop_timeout: Duration::from_secs(self.pop_timeout_secs),
            pop_retries: self.pop_retries,
            pacing: Duration::from_millis(self.pacing_ms),
            drain_grace: Duration::from_secs(self.drain_grace_secs),
            echo_text: true,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
