//! Persistent connection to the realtime speech backend.
//!
//! One request is in flight at a time: `submit` frames a persona + text
//! utterance, the backend streams PCM deltas back, and the reader task turns
//! the wire messages into ordered [`ChannelEvent`]s — zero or more
//! `AudioDelta`s followed by exactly one terminal event. Errors terminate the
//! in-flight request but leave the connection usable for the next one.

use crate::config::{RealtimeConfig, SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::script::Voice;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Events delivered to the sequencer, in wire order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    AudioDelta { item_id: String, samples: Vec<i16> },
    ItemComplete { item_id: String },
    Interrupted,
    Error(String),
    /// Connection dropped mid-stream. Terminal for any in-flight request.
    Disconnected,
}

/// Per-session (and per-event, for the voice) synthesis settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub voice: Voice,
    pub instructions: Option<String>,
    pub turn_detection: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            voice: Voice::default(),
            instructions: None,
            turn_detection: false,
        }
    }
}

/// What the sequencer needs from a speech backend. `RealtimeChannel` is the
/// wire implementation; tests drive the sequencer with a scripted fake.
#[async_trait]
pub trait SpeechChannel: Send + Sync {
    /// Applies session settings. Must run after connect and before the next
    /// `submit`; called between events to switch voices.
    async fn configure(&self, options: &SessionOptions) -> Result<()>;

    /// Sends one synthesis request: assume the persona described by
    /// `instructions`, speak exactly `text`.
    async fn submit(&self, instructions: &str, text: &str) -> Result<()>;

    /// Cancels the in-flight item, telling the backend how much audio was
    /// actually heard.
    async fn cancel(&self, item_id: &str, sample_offset: u64) -> Result<()>;
}

struct Connection {
    writer: Arc<Mutex<WsSink>>,
    reader: tokio::task::JoinHandle<()>,
}

pub struct RealtimeChannel {
    config: RealtimeConfig,
    connection: Mutex<Option<Connection>>,
    event_tx: mpsc::Sender<ChannelEvent>,
}

impl RealtimeChannel {
    /// Creates the channel and the receiving end of its event queue.
    pub fn new(config: RealtimeConfig) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        (
            Self {
                config,
                connection: Mutex::new(None),
                event_tx,
            },
            event_rx,
        )
    }

    /// Establishes the connection. Idempotent: an existing live connection is
    /// reused, and concurrent callers share one attempt (they queue on the
    /// connection lock rather than opening duplicate sockets).
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.reader.is_finished() {
                return Ok(());
            }
            // Reader gone means the socket died; reconnect below.
            *slot = None;
        }

        let request = self.client_request()?;
        let (ws, _) = connect_async(request).await.map_err(map_connect_error)?;
        let (writer, mut reader) = ws.split();

        wait_for_session_created(&mut reader).await?;
        debug!("realtime session established");

        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(read_loop(reader, event_tx));

        *slot = Some(Connection {
            writer: Arc::new(Mutex::new(writer)),
            reader,
        });
        Ok(())
    }

    /// Tears the connection down. Safe to call repeatedly or before connect.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.reader.abort();
            let mut writer = conn.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
    }

    fn client_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let url = match (&self.config.endpoint, &self.config.credential) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(_)) => format!("{}?model={}", DEFAULT_REALTIME_URL, self.config.model),
            (None, None) => {
                return Err(Error::Connection(
                    "either a relay endpoint or a credential is required".into(),
                ))
            }
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Connection(e.to_string()))?;
        if self.config.endpoint.is_none() {
            if let Some(credential) = &self.config.credential {
                let bearer = format!("Bearer {}", credential);
                request.headers_mut().insert(
                    "Authorization",
                    bearer
                        .parse()
                        .map_err(|_| Error::Connection("credential is not a valid header".into()))?,
                );
                request
                    .headers_mut()
                    .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
            }
        }
        Ok(request)
    }

    async fn send_json(&self, payload: serde_json::Value) -> Result<()> {
        let slot = self.connection.lock().await;
        let Some(conn) = slot.as_ref() else {
            return Err(Error::Connection("not connected".into()));
        };
        let writer = conn.writer.clone();
        drop(slot);

        let result = writer
            .lock()
            .await
            .send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| Error::Connection(e.to_string()));
        result
    }
}

#[async_trait]
impl SpeechChannel for RealtimeChannel {
    async fn configure(&self, options: &SessionOptions) -> Result<()> {
        self.send_json(session_update_payload(options)).await
    }

    async fn submit(&self, instructions: &str, text: &str) -> Result<()> {
        self.send_json(json!({
            "type": "session.update",
            "session": { "instructions": instructions },
        }))
        .await?;
        self.send_json(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            },
        }))
        .await?;
        self.send_json(json!({ "type": "response.create" })).await
    }

    async fn cancel(&self, item_id: &str, sample_offset: u64) -> Result<()> {
        self.send_json(json!({ "type": "response.cancel" })).await?;
        self.send_json(json!({
            "type": "conversation.item.truncate",
            "item_id": item_id,
            "content_index": 0,
            "audio_end_ms": audio_end_ms(sample_offset),
        }))
        .await
    }
}

// --- Wire payloads ---

fn session_update_payload(options: &SessionOptions) -> serde_json::Value {
    let turn_detection = if options.turn_detection {
        json!({ "type": "server_vad" })
    } else {
        serde_json::Value::Null
    };
    let mut session = json!({
        "modalities": ["text", "audio"],
        "voice": options.voice.as_str(),
        "output_audio_format": "pcm16",
        "turn_detection": turn_detection,
    });
    if let Some(instructions) = &options.instructions {
        session["instructions"] = json!(instructions);
    }
    json!({ "type": "session.update", "session": session })
}

/// Milliseconds of audio actually heard, for `conversation.item.truncate`.
fn audio_end_ms(sample_offset: u64) -> u64 {
    sample_offset * 1000 / SAMPLE_RATE as u64
}

fn decode_pcm16(delta: &str) -> Result<Vec<i16>> {
    let bytes = BASE64
        .decode(delta)
        .map_err(|e| Error::Synthesis(format!("bad audio delta: {}", e)))?;
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.audio.delta")]
    AudioDelta { item_id: String, delta: String },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseBody,
    },
    #[serde(rename = "error")]
    ErrorEvent { error: ErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) if response.status().as_u16() == 401 => {
            Error::Authentication("backend rejected the credential".into())
        }
        other => Error::Connection(other.to_string()),
    }
}

async fn wait_for_session_created(reader: &mut WsSource) -> Result<()> {
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(message) = reader.next().await {
            let message = message.map_err(|e| Error::Connection(e.to_string()))?;
            let Message::Text(text) = message else {
                continue;
            };
            match serde_json::from_str::<ServerEvent>(&text) {
                Ok(ServerEvent::SessionCreated) => return Ok(()),
                Ok(ServerEvent::ErrorEvent { error }) => {
                    let failed = format!("{}: {}", error.code, error.message);
                    return if error.code.contains("auth") || error.code.contains("key") {
                        Err(Error::Authentication(failed))
                    } else {
                        Err(Error::Connection(failed))
                    };
                }
                _ => continue,
            }
        }
        Err(Error::Connection("closed during handshake".into()))
    })
    .await;

    match handshake {
        Ok(result) => result,
        Err(_) => Err(Error::Connection("handshake timed out".into())),
    }
}

async fn read_loop(mut reader: WsSource, event_tx: mpsc::Sender<ChannelEvent>) {
    // response.done does not always repeat the item id; remember the one the
    // deltas carried.
    let mut last_item_id = String::new();

    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let event = match serde_json::from_str::<ServerEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                debug!("unhandled realtime message ({}): {}", e, text.as_str());
                continue;
            }
        };

        let outgoing = match event {
            ServerEvent::AudioDelta { item_id, delta } => match decode_pcm16(&delta) {
                Ok(samples) => {
                    last_item_id = item_id.clone();
                    ChannelEvent::AudioDelta { item_id, samples }
                }
                Err(e) => ChannelEvent::Error(e.to_string()),
            },
            ServerEvent::ResponseDone { response } => {
                let item_id = response
                    .output
                    .first()
                    .map(|o| o.id.clone())
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| last_item_id.clone());
                match response.status.as_str() {
                    "cancelled" => ChannelEvent::Interrupted,
                    "failed" | "incomplete" => {
                        ChannelEvent::Error(format!("response {}", response.status))
                    }
                    _ => ChannelEvent::ItemComplete { item_id },
                }
            }
            ServerEvent::ErrorEvent { error } => {
                warn!("realtime error {}: {}", error.code, error.message);
                ChannelEvent::Error(error.message)
            }
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated | ServerEvent::Other => {
                continue
            }
        };

        if event_tx.send(outgoing).await.is_err() {
            return; // Receiver dropped; nobody is listening anymore.
        }
    }

    let _ = event_tx.send(ChannelEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_requires_credential_or_endpoint() {
        let (channel, _events) = RealtimeChannel::new(RealtimeConfig::default());
        let err = channel.client_request().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn hosted_request_carries_bearer_and_model() {
        let config = RealtimeConfig {
            credential: Some("sk-test".into()),
            ..Default::default()
        };
        let (channel, _events) = RealtimeChannel::new(config);
        let request = channel.client_request().unwrap();
        assert!(request.uri().to_string().contains("model="));
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer sk-test"
        );
    }

    #[test]
    fn relay_endpoint_skips_auth_header() {
        let config = RealtimeConfig {
            endpoint: Some("ws://localhost:8081".into()),
            ..Default::default()
        };
        let (channel, _events) = RealtimeChannel::new(config);
        let request = channel.client_request().unwrap();
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn session_update_shape() {
        let options = SessionOptions {
            voice: Voice::Ash,
            instructions: Some("You are Captain Zip".into()),
            turn_detection: false,
        };
        let payload = session_update_payload(&options);
        assert_eq!(payload["type"], "session.update");
        assert_eq!(payload["session"]["voice"], "ash");
        assert_eq!(payload["session"]["output_audio_format"], "pcm16");
        assert!(payload["session"]["turn_detection"].is_null());
        assert_eq!(payload["session"]["instructions"], "You are Captain Zip");
    }

    #[test]
    fn audio_end_ms_uses_pipeline_rate() {
        assert_eq!(audio_end_ms(0), 0);
        assert_eq!(audio_end_ms(24_000), 1000);
        assert_eq!(audio_end_ms(12_000), 500);
    }

    #[test]
    fn decodes_little_endian_pcm() {
        let encoded = BASE64.encode([0x01u8, 0x00, 0xFF, 0x7F]);
        let samples = decode_pcm16(&encoded).unwrap();
        assert_eq!(samples, vec![1, i16::MAX]);
    }

    #[test]
    fn rejects_malformed_delta() {
        assert!(matches!(
            decode_pcm16("not base64!!").unwrap_err(),
            Error::Synthesis(_)
        ));
    }

    #[test]
    fn parses_server_events() {
        let delta: ServerEvent = serde_json::from_str(
            r#"{"type":"response.audio.delta","item_id":"item_7","delta":"AAA="}"#,
        )
        .unwrap();
        assert!(matches!(delta, ServerEvent::AudioDelta { item_id, .. } if item_id == "item_7"));

        let done: ServerEvent = serde_json::from_str(
            r#"{"type":"response.done","response":{"status":"completed","output":[{"id":"item_7"}]}}"#,
        )
        .unwrap();
        assert!(matches!(done, ServerEvent::ResponseDone { .. }));

        let unknown: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated"}"#).unwrap();
        assert!(matches!(unknown, ServerEvent::Other));
    }
}
