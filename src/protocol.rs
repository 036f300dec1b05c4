//! Wire protocol between the app and the live inference service
//!
//! Both directions use a JSON envelope. Outbound messages look like
//! `{"type": ..., "data": ..., "timestamp": <epoch ms>}`, inbound ones like
//! `{"type": ..., "data": ...}`. Audio travels as base64 encoded 16-bit
//! little-endian PCM.

use base64::engine::general_purpose;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::LiveError;

/// Prompt attached to an image when the caller does not supply one.
pub const DEFAULT_IMAGE_PROMPT: &str = "Analyze this crop image for diseases or issues";

/// Payload of an outbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPayload {
    /// Base64 encoded PCM.
    AudioChunk(String),
    /// Base64 encoded image plus the question to ask about it.
    Image { image: String, prompt: String },
    Text(String),
    Interrupt,
}

/// One application message headed for the server, stamped when it was created.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: OutboundPayload,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl OutboundMessage {
    pub fn new(payload: OutboundPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Raw PCM bytes, base64 encoded for transport.
    pub fn audio_chunk(pcm: &[u8]) -> Self {
        Self::new(OutboundPayload::AudioChunk(
            general_purpose::STANDARD.encode(pcm),
        ))
    }

    pub fn image(image: &[u8], prompt: Option<&str>) -> Self {
        Self::new(OutboundPayload::Image {
            image: general_purpose::STANDARD.encode(image),
            prompt: prompt.unwrap_or(DEFAULT_IMAGE_PROMPT).to_string(),
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OutboundPayload::Text(text.into()))
    }

    pub fn interrupt() -> Self {
        Self::new(OutboundPayload::Interrupt)
    }

    /// Envelope type tag.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            OutboundPayload::AudioChunk(_) => "audio_chunk",
            OutboundPayload::Image { .. } => "image",
            OutboundPayload::Text(_) => "text",
            OutboundPayload::Interrupt => "interrupt",
        }
    }

    pub fn to_json(&self) -> Value {
        match &self.payload {
            OutboundPayload::AudioChunk(data) => json!({
                "type": self.kind(),
                "data": data,
                "timestamp": self.timestamp,
            }),
            OutboundPayload::Image { image, prompt } => json!({
                "type": self.kind(),
                "data": { "image": image, "prompt": prompt },
                "timestamp": self.timestamp,
            }),
            OutboundPayload::Text(text) => json!({
                "type": self.kind(),
                "data": text,
                "timestamp": self.timestamp,
            }),
            OutboundPayload::Interrupt => json!({
                "type": self.kind(),
                "timestamp": self.timestamp,
            }),
        }
    }

    /// Serialized text frame.
    pub fn to_frame(&self) -> String {
        self.to_json().to_string()
    }
}

/// Session info pushed by the server once it is ready for input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReadyInfo {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Speech-to-text result for audio we streamed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
}

/// Error reported by the server inside a well-formed frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InterruptedPayload {
    #[serde(default)]
    message: Option<String>,
}

/// A parsed unit of server-pushed data.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Ready(ReadyInfo),
    /// Decoded PCM bytes (24 kHz mono, 16-bit little-endian).
    AudioData(Vec<u8>),
    TextData(String),
    TurnComplete,
    Interrupted(Option<String>),
    FunctionCall(Value),
    FunctionResponse(Value),
    TranscriptionResult(Transcript),
    ImageAnalysisResult(Value),
    Error(ServerError),
}

/// Why an inbound frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON envelope: {source}")]
    Envelope {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid `{kind}` payload: {reason}")]
    Payload {
        raw: String,
        kind: String,
        reason: String,
    },

    #[error("invalid base64 audio: {source}")]
    Audio {
        raw: String,
        #[source]
        source: base64::DecodeError,
    },
}

impl ProtocolError {
    pub fn raw(&self) -> &str {
        match self {
            Self::Envelope { raw, .. } | Self::Payload { raw, .. } | Self::Audio { raw, .. } => raw,
        }
    }
}

impl From<ProtocolError> for LiveError {
    fn from(e: ProtocolError) -> Self {
        LiveError::Protocol {
            raw: e.raw().to_string(),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Parse one inbound text frame.
///
/// Returns `Ok(None)` for a well-formed envelope with a type tag we do not
/// know; such frames are logged and dropped.
pub fn parse_frame(raw: &str) -> Result<Option<InboundEvent>, ProtocolError> {
    let envelope: RawEnvelope =
        serde_json::from_str(raw).map_err(|source| ProtocolError::Envelope {
            raw: raw.to_string(),
            source,
        })?;

    let data = envelope.data;
    let payload_error = |reason: String| ProtocolError::Payload {
        raw: raw.to_string(),
        kind: envelope.kind.clone(),
        reason,
    };

    let event = match envelope.kind.as_str() {
        "ready" => InboundEvent::Ready(
            decode_object(data)
                .map_err(|e| payload_error(e.to_string()))?
                .unwrap_or_default(),
        ),
        "audio" => {
            let encoded = data
                .as_ref()
                .and_then(Value::as_str)
                .ok_or_else(|| payload_error("expected a base64 string".to_string()))?;
            let pcm = general_purpose::STANDARD
                .decode(encoded)
                .map_err(|source| ProtocolError::Audio {
                    raw: raw.to_string(),
                    source,
                })?;
            InboundEvent::AudioData(pcm)
        }
        "text" => {
            let text = data
                .as_ref()
                .and_then(Value::as_str)
                .ok_or_else(|| payload_error("expected a string".to_string()))?;
            InboundEvent::TextData(text.to_string())
        }
        "turn_complete" => InboundEvent::TurnComplete,
        "interrupted" => {
            let payload: InterruptedPayload = decode_object(data)
                .map_err(|e| payload_error(e.to_string()))?
                .unwrap_or_default();
            InboundEvent::Interrupted(payload.message)
        }
        "function_call" => InboundEvent::FunctionCall(data.unwrap_or(Value::Null)),
        "function_response" => InboundEvent::FunctionResponse(data.unwrap_or(Value::Null)),
        "transcription" => {
            let transcript = decode_object::<Transcript>(data)
                .map_err(|e| payload_error(e.to_string()))?
                .ok_or_else(|| payload_error("missing transcription data".to_string()))?;
            InboundEvent::TranscriptionResult(transcript)
        }
        "image_analysis" => InboundEvent::ImageAnalysisResult(data.unwrap_or(Value::Null)),
        "error" => {
            let error = match data {
                // Some servers send a bare message string.
                Some(Value::String(message)) => ServerError {
                    message,
                    error_type: None,
                },
                other => decode_object(other)
                    .map_err(|e| payload_error(e.to_string()))?
                    .unwrap_or(ServerError {
                        message: String::new(),
                        error_type: None,
                    }),
            };
            InboundEvent::Error(error)
        }
        unknown => {
            warn!("Ignoring frame with unknown type: {}", unknown);
            return Ok(None);
        }
    };

    debug!("Parsed inbound `{}` frame", envelope.kind);
    Ok(Some(event))
}

fn decode_object<T: serde::de::DeserializeOwned>(
    data: Option<Value>,
) -> Result<Option<T>, serde_json::Error> {
    match data {
        None => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_envelopes() {
        let audio = OutboundMessage::audio_chunk(&[1, 2, 3]);
        let parsed: Value = serde_json::from_str(&audio.to_frame()).unwrap();
        assert_eq!(parsed["type"], "audio_chunk");
        assert_eq!(parsed["data"], general_purpose::STANDARD.encode([1u8, 2, 3]));
        assert_eq!(parsed["timestamp"], audio.timestamp);

        let text = OutboundMessage::text("check my tomato crop");
        let parsed = text.to_json();
        assert_eq!(parsed["type"], "text");
        assert_eq!(parsed["data"], "check my tomato crop");

        let interrupt = OutboundMessage::interrupt().to_json();
        assert_eq!(interrupt["type"], "interrupt");
        assert!(interrupt.get("data").is_none());
        assert!(interrupt["timestamp"].is_i64());
    }

    #[test]
    fn test_image_prompt_defaults() {
        let without = OutboundMessage::image(&[0xff, 0xd8], None).to_json();
        assert_eq!(without["type"], "image");
        assert_eq!(without["data"]["prompt"], DEFAULT_IMAGE_PROMPT);
        assert_eq!(without["data"]["image"], "/9g=");

        let with = OutboundMessage::image(&[0xff, 0xd8], Some("Is this blight?")).to_json();
        assert_eq!(with["data"]["prompt"], "Is this blight?");
    }

    #[test]
    fn test_parse_known_types() {
        let ready = parse_frame(r#"{"type":"ready","data":{"session_id":"client_1"}}"#).unwrap();
        assert_eq!(
            ready,
            Some(InboundEvent::Ready(ReadyInfo {
                session_id: Some("client_1".to_string()),
                timestamp: None,
            }))
        );

        let audio = format!(
            r#"{{"type":"audio","data":"{}"}}"#,
            general_purpose::STANDARD.encode([9u8, 8, 7, 6])
        );
        assert_eq!(
            parse_frame(&audio).unwrap(),
            Some(InboundEvent::AudioData(vec![9, 8, 7, 6]))
        );

        assert_eq!(
            parse_frame(r#"{"type":"text","data":"Namaste"}"#).unwrap(),
            Some(InboundEvent::TextData("Namaste".to_string()))
        );
        assert_eq!(
            parse_frame(r#"{"type":"turn_complete"}"#).unwrap(),
            Some(InboundEvent::TurnComplete)
        );
        assert_eq!(
            parse_frame(r#"{"type":"interrupted","data":{"message":"Conversation interrupted"}}"#)
                .unwrap(),
            Some(InboundEvent::Interrupted(Some(
                "Conversation interrupted".to_string()
            )))
        );
        assert_eq!(
            parse_frame(r#"{"type":"transcription","data":{"text":"hello","is_final":true}}"#)
                .unwrap(),
            Some(InboundEvent::TranscriptionResult(Transcript {
                text: "hello".to_string(),
                is_final: true,
            }))
        );

        match parse_frame(r#"{"type":"function_call","data":{"name":"get_price"}}"#).unwrap() {
            Some(InboundEvent::FunctionCall(call)) => assert_eq!(call["name"], "get_price"),
            other => panic!("Unexpected event: {:?}", other),
        }
        match parse_frame(r#"{"type":"image_analysis","data":{"disease":"leaf curl"}}"#).unwrap() {
            Some(InboundEvent::ImageAnalysisResult(result)) => {
                assert_eq!(result["disease"], "leaf curl")
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(matches!(
            parse_frame(r#"{"type":"function_response","data":[1]}"#).unwrap(),
            Some(InboundEvent::FunctionResponse(_))
        ));
    }

    #[test]
    fn test_parse_server_errors() {
        assert_eq!(
            parse_frame(r#"{"type":"error","data":{"message":"Error processing audio","error_type":"audio_error"}}"#)
                .unwrap(),
            Some(InboundEvent::Error(ServerError {
                message: "Error processing audio".to_string(),
                error_type: Some("audio_error".to_string()),
            }))
        );
        assert_eq!(
            parse_frame(r#"{"type":"error","data":"quota exceeded"}"#).unwrap(),
            Some(InboundEvent::Error(ServerError {
                message: "quota exceeded".to_string(),
                error_type: None,
            }))
        );
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        assert_eq!(parse_frame(r#"{"type":"weather","data":{}}"#).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        let err = parse_frame("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Envelope { .. }));
        assert_eq!(err.raw(), "not json");

        let err = parse_frame(r#"{"data":"no type"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Envelope { .. }));

        let err = parse_frame(r#"{"type":"audio","data":"%%%"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Audio { .. }));

        let err = parse_frame(r#"{"type":"text","data":42}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Payload { .. }));

        let live: LiveError = parse_frame(r#"{"type":"transcription"}"#)
            .unwrap_err()
            .into();
        match live {
            LiveError::Protocol { raw, .. } => assert_eq!(raw, r#"{"type":"transcription"}"#),
            other => panic!("Unexpected error: {:?}", other),
        }
    }
}
