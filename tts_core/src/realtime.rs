//! Realtime speech synthesis session over WebSocket.
//!
//! The protocol is event-based JSON in both directions: the client appends
//! text fragments and finally finishes the session; the server pushes
//! base64-encoded PCM deltas at its own pace. `handle_messages` must run
//! concurrently with the appends for the whole session, since audio
//! delivery is independent of append timing.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("session is not connected")]
    NotConnected,

    #[error("event encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("session error: {0}")]
    Session(String),
}

/// Invoked once per decoded PCM chunk, from the message-handling task.
pub type AudioCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// The narrow surface the pipeline forwards fragments through.
#[async_trait]
pub trait SpeechSession: Send + Sync {
    async fn append_text(&self, text: &str) -> Result<(), TtsError>;
    async fn finish_session(&self) -> Result<(), TtsError>;
}

#[derive(Debug, Clone)]
pub struct TtsSessionConfig {
    pub url: String,
    pub api_key: String,
    pub voice: String,
    pub language: String,
    pub sample_rate: u32,
}

/// Session settings sent with `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

/// Events sent to the synthesizer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_text_buffer.append")]
    AppendText { text: String },

    #[serde(rename = "session.finish")]
    FinishSession {},
}

/// Events received from the synthesizer. Types this client does not react
/// to collapse into `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: serde_json::Value,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: serde_json::Value,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "session.finished")]
    SessionFinished {
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },

    #[serde(other)]
    Other,
}

pub struct TtsRealtimeClient {
    config: TtsSessionConfig,
    audio_callback: AudioCallback,
    writer: Mutex<Option<WsWriter>>,
    reader: Mutex<Option<WsReader>>,
}

impl TtsRealtimeClient {
    pub fn new(config: TtsSessionConfig, audio_callback: AudioCallback) -> Self {
        Self {
            config,
            audio_callback,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Open the WebSocket and configure the session.
    pub async fn connect(&self) -> Result<(), TtsError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let bearer = format!("Bearer {}", self.config.api_key);
        let auth = HeaderValue::from_str(&bearer)
            .map_err(|_| TtsError::Session("api key contains invalid header characters".into()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (socket, response) = connect_async(request).await?;
        debug!(status = %response.status(), "websocket handshake complete");
        let (writer, reader) = socket.split();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);

        let settings = SessionSettings {
            voice: Some(self.config.voice.clone()),
            language_type: Some(self.config.language.clone()),
            mode: Some("server_commit".into()),
            response_format: Some("pcm".into()),
            sample_rate: Some(self.config.sample_rate),
        };
        self.send_event(&ClientEvent::SessionUpdate { session: settings }).await?;
        info!(voice = %self.config.voice, "speech session configured");
        Ok(())
    }

    pub async fn append_text(&self, text: &str) -> Result<(), TtsError> {
        self.send_event(&ClientEvent::AppendText { text: text.to_string() }).await
    }

    pub async fn finish_session(&self) -> Result<(), TtsError> {
        self.send_event(&ClientEvent::FinishSession {}).await
    }

    /// Best-effort close; fragments the server has not yet synthesized are
    /// dropped on its side, not drained.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!("close frame not delivered: {e}");
            }
        }
    }

    /// Drive server events until the session finishes or the transport
    /// closes. Must be running for audio to be delivered.
    pub async fn handle_messages(&self) {
        let taken = self.reader.lock().await.take();
        let Some(mut reader) = taken else {
            warn!("handle_messages called without a connected session");
            return;
        };
        while let Some(next) = reader.next().await {
            match next {
                Ok(Message::Text(payload)) => {
                    if !self.dispatch(payload.as_str()) {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server closed the session");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("speech session transport error: {e}");
                    break;
                }
            }
        }
        debug!("message handling loop ended");
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<(), TtsError> {
        let payload = serde_json::to_string(event)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TtsError::NotConnected)?;
        writer.send(Message::Text(payload.into())).await?;
        Ok(())
    }

    /// Returns false when the loop should stop.
    fn dispatch(&self, payload: &str) -> bool {
        match serde_json::from_str::<ServerEvent>(payload) {
            Ok(ServerEvent::AudioDelta { delta }) => {
                match general_purpose::STANDARD.decode(delta.as_bytes()) {
                    Ok(pcm) => (self.audio_callback)(Bytes::from(pcm)),
                    Err(e) => warn!("audio delta was not valid base64: {e}"),
                }
                true
            }
            Ok(ServerEvent::AudioDone { .. }) => {
                debug!("audio response complete");
                true
            }
            Ok(ServerEvent::SessionFinished { .. }) => {
                info!("speech session finished");
                false
            }
            Ok(ServerEvent::Error { error }) => {
                error!("speech session error event: {error}");
                true
            }
            Ok(ServerEvent::SessionCreated { .. }) | Ok(ServerEvent::SessionUpdated { .. }) => {
                debug!("session acknowledged");
                true
            }
            Ok(ServerEvent::Other) => true,
            Err(e) => {
                debug!("ignoring unparseable event: {e}");
                true
            }
        }
    }
}

#[async_trait]
impl SpeechSession for TtsRealtimeClient {
    async fn append_text(&self, text: &str) -> Result<(), TtsError> {
        TtsRealtimeClient::append_text(self, text).await
    }

    async fn finish_session(&self) -> Result<(), TtsError> {
        TtsRealtimeClient::finish_session(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn test_client(received: Arc<StdMutex<Vec<Bytes>>>) -> TtsRealtimeClient {
        let callback: AudioCallback = Arc::new(move |chunk| {
            received.lock().unwrap().push(chunk);
        });
        TtsRealtimeClient::new(
            TtsSessionConfig {
                url: "wss://example.invalid/realtime".into(),
                api_key: "key".into(),
                voice: "Cherry".into(),
                language: "Auto".into(),
                sample_rate: crate::SAMPLE_RATE,
            },
            callback,
        )
    }

    #[test]
    fn append_event_carries_dotted_type_and_text() {
        let event = ClientEvent::AppendText { text: "hello".into() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "input_text_buffer.append");
        assert_eq!(value["text"], "hello");
    }

    #[test]
    fn finish_event_is_type_only() {
        let value = serde_json::to_value(&ClientEvent::FinishSession {}).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "session.finish" }));
    }

    #[test]
    fn session_update_skips_unset_fields() {
        let event = ClientEvent::SessionUpdate {
            session: SessionSettings {
                voice: Some("Cherry".into()),
                language_type: None,
                mode: Some("server_commit".into()),
                response_format: None,
                sample_rate: None,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["session"]["voice"], "Cherry");
        assert!(value["session"].get("language_type").is_none());
        assert!(value["session"].get("sample_rate").is_none());
    }

    #[test]
    fn audio_delta_is_decoded_and_delivered() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let client = test_client(Arc::clone(&received));
        let payload = format!(
            r#"{{"type":"response.audio.delta","response_id":"r1","delta":"{}"}}"#,
            general_purpose::STANDARD.encode([1u8, 2, 3, 4])
        );
        assert!(client.dispatch(&payload));
        let chunks = received.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn session_finished_stops_the_loop() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let client = test_client(received);
        assert!(!client.dispatch(r#"{"type":"session.finished","session_id":"s1"}"#));
    }

    #[test]
    fn unknown_and_malformed_events_keep_the_loop_running() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let client = test_client(Arc::clone(&received));
        assert!(client.dispatch(r#"{"type":"response.created"}"#));
        assert!(client.dispatch("not json at all"));
        assert!(received.lock().unwrap().is_empty());
    }
}
