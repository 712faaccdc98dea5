//! The realtime speech-to-speech backend: wire protocol, session
//! negotiation, and connection establishment.

use crate::config::Config;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::client::IntoClientRequest,
};
use tracing::info;

/// A connected backend WebSocket stream.
pub type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Backend event kinds that are worth a diagnostic log line. Audio deltas are
/// deliberately absent: their payloads are forwarded, never logged.
pub const LOG_EVENT_TYPES: &[&str] = &[
    "response.content.done",
    "rate_limits.updated",
    "response.done",
    "input_audio_buffer.committed",
    "input_audio_buffer.speech_stopped",
    "input_audio_buffer.speech_started",
    "session.created",
];

/// A message sent from the relay to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: Session },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
}

/// The one-time session configuration, sent before any audio is forwarded.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub turn_detection: TurnDetection,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub voice: String,
    pub instructions: String,
    pub modalities: Vec<String>,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f64,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

/// An event received from the backend. Kinds the relay does not know about
/// fall through to `Other` rather than failing the stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted,
    #[serde(rename = "input_audio_buffer.speech_started")]
    InputAudioBufferSpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    InputAudioBufferSpeechStopped,
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated,
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: Option<String> },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "response.content.done")]
    ResponseContentDone,
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// The wire tag of this event, used against the log allow-list.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionUpdated => "session.updated",
            Self::InputAudioBufferCommitted => "input_audio_buffer.committed",
            Self::InputAudioBufferSpeechStarted => "input_audio_buffer.speech_started",
            Self::InputAudioBufferSpeechStopped => "input_audio_buffer.speech_stopped",
            Self::RateLimitsUpdated => "rate_limits.updated",
            Self::ResponseAudioDelta { .. } => "response.audio.delta",
            Self::ResponseDone => "response.done",
            Self::ResponseContentDone => "response.content.done",
            Self::Other => "unrecognized",
        }
    }
}

/// Builds the one-time session configuration from static settings.
///
/// Both audio legs are configured for the same narrow-band telephone codec,
/// so audio payloads pass through the relay without transcoding.
pub fn session_update(config: &Config, instructions: &str) -> ClientEvent {
    ClientEvent::SessionUpdate {
        session: Session {
            turn_detection: TurnDetection::ServerVad {
                threshold: config.vad_threshold,
                prefix_padding_ms: config.vad_prefix_padding_ms,
                silence_duration_ms: config.vad_silence_duration_ms,
            },
            input_audio_format: "g711_ulaw".to_string(),
            output_audio_format: "g711_ulaw".to_string(),
            voice: config.voice.clone(),
            instructions: instructions.to_string(),
            modalities: vec!["text".to_string(), "audio".to_string()],
            temperature: config.temperature,
        },
    }
}

/// Opens the WebSocket connection to the realtime backend, authenticating
/// with the configured bearer credential. A failure here is fatal to the
/// session; the caller does not retry.
pub async fn connect(config: &Config) -> Result<BackendStream> {
    let url = format!("{}?model={}", REALTIME_URL, config.realtime_model);
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.openai_api_key).parse()?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse()?);

    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to realtime backend WebSocket")?;
    info!(model = %config.realtime_model, "Connected to realtime backend.");
    Ok(ws_stream)
}
