//! Side-channel message protocol.
//!
//! Inbound frames decode leniently into [`InboundEvent`]: anything malformed
//! or unknown becomes [`InboundEvent::Unrecognized`]. Outbound messages are
//! typed [`ClientEvent`]s serialized with a `type` tag.

use crate::config::{SessionConfig, TurnDetectionConfig};
use crate::error::{Result, SessionError};
use crate::persona::{self, Persona};
use crate::viseme::{ResponseId, VisemeFrame, resolve_hint_label};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Modalities requested for every response.
pub const MODALITIES: [&str; 2] = ["audio", "text"];

/// Substituted when the user submits blank text.
pub const EMPTY_TEXT_PROMPT: &str = "Please continue the conversation.";

/// Decoded inbound side-channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `response.audio_transcript.done`
    TranscriptComplete {
        response_id: ResponseId,
        transcript: String,
    },
    /// `response.text.done` without a transcript.
    TextComplete { response_id: ResponseId, text: String },
    /// `output_audio_buffer.started`
    AudioStarted { response_id: ResponseId },
    /// `output_audio_buffer.stopped`
    AudioStopped,
    /// `output_audio_buffer.cleared`, usually a user interruption.
    AudioCleared,
    /// `response.viseme` / `response.phoneme`
    VisemeHint(VisemeFrame),
    /// `error`
    ServiceError { message: String },
    /// Anything else, including malformed frames.
    Unrecognized,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    response_id: Option<Value>,
    id: Option<Value>,
    transcript: Option<Value>,
    text: Option<Value>,
    viseme: Option<Value>,
    phoneme: Option<Value>,
    label: Option<Value>,
    value: Option<Value>,
    error: Option<Value>,
}

/// Non-empty string or number rendered as text.
fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RawFrame {
    fn response_id(&self) -> ResponseId {
        text_of(self.response_id.as_ref())
            .or_else(|| text_of(self.id.as_ref()))
            .map(ResponseId::new)
            .unwrap_or_else(ResponseId::synthesize)
    }

    fn hint(&self) -> VisemeFrame {
        let label = [&self.viseme, &self.phoneme, &self.label, &self.id]
            .into_iter()
            .find_map(|v| text_of(v.as_ref()))
            .unwrap_or_else(|| "SIL".to_owned());
        let intensity = self
            .value
            .as_ref()
            .and_then(Value::as_f64)
            .map_or(1.0, |v| v as f32);
        VisemeFrame::new(resolve_hint_label(&label), intensity)
    }
}

impl InboundEvent {
    /// Decode one frame. Never fails.
    pub fn decode(frame: &str) -> Self {
        let raw: RawFrame = match serde_json::from_str(frame) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("Ignoring unparseable side-channel frame: {e}");
                return Self::Unrecognized;
            }
        };
        let Some(kind) = raw.kind.as_deref() else {
            return Self::Unrecognized;
        };

        match kind {
            "response.audio_transcript.done" => match text_of(raw.transcript.as_ref()) {
                Some(transcript) => Self::TranscriptComplete {
                    response_id: raw.response_id(),
                    transcript,
                },
                None => Self::Unrecognized,
            },
            "response.text.done" => {
                if text_of(raw.transcript.as_ref()).is_some() {
                    return Self::Unrecognized;
                }
                match text_of(raw.text.as_ref()) {
                    Some(text) => Self::TextComplete {
                        response_id: raw.response_id(),
                        text,
                    },
                    None => Self::Unrecognized,
                }
            }
            "output_audio_buffer.started" => Self::AudioStarted {
                response_id: raw.response_id(),
            },
            "output_audio_buffer.stopped" => Self::AudioStopped,
            "output_audio_buffer.cleared" => Self::AudioCleared,
            "response.viseme" | "response.phoneme" => Self::VisemeHint(raw.hint()),
            "error" => {
                let message = raw
                    .error
                    .as_ref()
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("AI service error")
                    .to_owned();
                Self::ServiceError { message }
            }
            other => {
                tracing::trace!(kind = other, "ignoring side-channel event");
                Self::Unrecognized
            }
        }
    }
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
    pub interrupt_response: bool,
}

impl From<&TurnDetectionConfig> for TurnDetection {
    fn from(config: &TurnDetectionConfig) -> Self {
        Self {
            kind: "server_vad".to_owned(),
            threshold: config.threshold,
            prefix_padding_ms: config.prefix_padding_ms,
            silence_duration_ms: config.silence_duration_ms,
            create_response: config.create_response,
            interrupt_response: config.interrupt_response,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub turn_detection: TurnDetection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub instructions: String,
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
}

/// Outbound side-channel message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseRequest },
}

fn modalities() -> Vec<String> {
    MODALITIES.iter().map(|m| (*m).to_owned()).collect()
}

impl ClientEvent {
    /// Voice, turn detection, interruption policy and persona instructions.
    pub fn session_update(
        session: &SessionConfig,
        turn_detection: &TurnDetectionConfig,
        instructions: String,
    ) -> Self {
        Self::SessionUpdate {
            session: SessionSettings {
                modalities: modalities(),
                voice: session.voice.clone(),
                instructions,
                turn_detection: turn_detection.into(),
            },
        }
    }

    /// Ask for an opening line.
    pub fn greeting(prompt: &str) -> Self {
        Self::ResponseCreate {
            response: ResponseRequest {
                model: None,
                instructions: prompt.to_owned(),
                modalities: modalities(),
                conversation: None,
            },
        }
    }

    /// Inject typed user text into the conversation.
    pub fn user_text(model: &str, instructions: &str, text: &str) -> Self {
        let content = match text.trim() {
            "" => EMPTY_TEXT_PROMPT,
            trimmed => trimmed,
        };
        Self::ResponseCreate {
            response: ResponseRequest {
                model: Some(model.to_owned()),
                instructions: format!("{instructions} User says: \"{content}\""),
                modalities: modalities(),
                conversation: Some("auto".to_owned()),
            },
        }
    }

    /// Switch character mid-conversation.
    pub fn persona_change(persona: Persona, scenario: Option<&str>) -> Self {
        let mut instructions = persona.instructions().to_owned();
        if let Some(scenario) = scenario.map(str::trim).filter(|s| !s.is_empty()) {
            instructions.push_str(" Scenario: ");
            instructions.push_str(scenario);
        }
        instructions
            .push_str(" Please acknowledge the character change and continue in your new role.");
        Self::ResponseCreate {
            response: ResponseRequest {
                model: None,
                instructions,
                modalities: modalities(),
                conversation: None,
            },
        }
    }

    /// Apply a new scenario to the current persona.
    pub fn scenario_update(model: &str, persona: Persona, scenario: Option<&str>) -> Self {
        let instructions = format!(
            "{} Please acknowledge the new scenario and adapt accordingly.",
            persona::build_instructions(persona, scenario)
        );
        Self::ResponseCreate {
            response: ResponseRequest {
                model: Some(model.to_owned()),
                instructions,
                modalities: modalities(),
                conversation: Some("auto".to_owned()),
            },
        }
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Protocol`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SessionError::Protocol(e.to_string()))
    }
}
