use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the streaming chat client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed stream payload: {0}")]
    Decode(String),

    #[error("stream interrupted: {0}")]
    Stream(String),
}

/// Message author, as tagged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the role-tagged conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    /// OpenAI-compatible endpoint root, e.g. DashScope's compatible mode.
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

/// Incremental text deltas for one completion. Ends after the `[DONE]`
/// marker or when the transport closes.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Structure for the streaming chat completions request
#[derive(Serialize)]
struct StreamChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// One SSE payload of the streaming response
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    /// Start a streaming completion for the given history. The request is
    /// issued lazily, when the returned stream is first polled.
    pub fn chat_stream(&self, messages: Vec<ChatMessage>) -> TextStream {
        let http = self.http.clone();
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let api_key = self.config.api_key.clone();
        let model = self.config.model.clone();

        Box::pin(try_stream! {
            let request = StreamChatRequest { model: &model, messages: &messages, stream: true };
            let response = http
                .post(&url)
                .bearer_auth(&api_key)
                .json(&request)
                .send()
                .await
                .map_err(LlmError::Http)?;
            let response = check_status(response).await?;

            let body = response.bytes_stream().map(|chunk| chunk.map_err(LlmError::Http));
            let mut deltas = sse_deltas(body);
            while let Some(delta) = deltas.next().await {
                yield delta?;
            }
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(LlmError::Api { status: status.as_u16(), message })
}

enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

/// Turn a raw SSE byte stream into content deltas. Lines may be split
/// across transport chunks, so a partial tail is carried between reads.
/// Split out from the HTTP call so the parser can be exercised without a
/// live endpoint.
fn sse_deltas<S>(body: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, LlmError>> + Send + 'static,
{
    Box::pin(try_stream! {
        let mut pending = String::new();
        let mut done = false;
        for await chunk in body {
            let chunk = chunk?;
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                match parse_sse_line(line.trim())? {
                    SseEvent::Delta(text) => yield text,
                    SseEvent::Done => {
                        done = true;
                        break;
                    }
                    SseEvent::Skip => {}
                }
            }
            if done {
                break;
            }
        }
        if !done {
            debug!("stream ended without a [DONE] marker");
        }
    })
}

fn parse_sse_line(line: &str) -> Result<SseEvent, LlmError> {
    // Comments, blank keep-alives and "event:" lines carry no content.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| LlmError::Decode(format!("{e}: {data}")))?;
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(content) if !content.is_empty() => Ok(SseEvent::Delta(content)),
        _ => Ok(SseEvent::Skip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::stream;

    fn deltas_from(chunks: &[&str]) -> Vec<Result<String, LlmError>> {
        let body = stream::iter(
            chunks
                .iter()
                .map(|c| Ok::<_, LlmError>(Bytes::copy_from_slice(c.as_bytes())))
                .collect::<Vec<_>>(),
        );
        block_on(sse_deltas(body).collect::<Vec<_>>())
    }

    fn delta_payload(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n"
        )
    }

    #[test]
    fn yields_deltas_in_order() {
        let body = format!(
            "{}{}data: [DONE]\n",
            delta_payload("Hello"),
            delta_payload(" world")
        );
        let out = deltas_from(&[&body]);
        let texts: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Hello", " world"]);
    }

    #[test]
    fn done_marker_ends_the_stream() {
        let body = format!("{}data: [DONE]\n{}", delta_payload("a"), delta_payload("b"));
        let out = deltas_from(&[&body]);
        let texts: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["a"]);
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let body = delta_payload("split");
        let (head, tail) = body.split_at(17);
        let out = deltas_from(&[head, tail, "data: [DONE]\n"]);
        let texts: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["split"]);
    }

    #[test]
    fn keepalives_and_empty_deltas_are_skipped() {
        let body = format!(
            ": keep-alive\n\ndata: {{\"choices\":[]}}\ndata: {{\"choices\":[{{\"delta\":{{}}}}]}}\n{}data: [DONE]\n",
            delta_payload("x")
        );
        let out = deltas_from(&[&body]);
        let texts: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["x"]);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let out = deltas_from(&["data: {not json}\n"]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(LlmError::Decode(_))));
    }

    #[test]
    fn request_serializes_lowercase_roles() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let request = StreamChatRequest { model: "qwen3-max", messages: &messages, stream: true };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["stream"], true);
    }
}
