//! Configuration types for the realtime session engine.

use crate::persona::Persona;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable consulted when `session.api_key` is unset.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Microphone capture and remote audio output settings.
    pub audio: AudioConfig,
    /// Viseme scheduling and playback heuristics.
    pub lipsync: LipSyncConfig,
    /// Remote session, signaling and reconnection settings.
    pub session: SessionConfig,
    /// Server-side voice activity detection parameters.
    pub turn_detection: TurnDetectionConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Requested capture sample rate in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz for the remote audio track.
    pub output_sample_rate: u32,
    /// Channel count requested from the microphone (1 = mono). Devices that
    /// cannot open it at their native rate use their own default; capture
    /// always downmixes to mono.
    pub input_channels: u16,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// RMS level above which the user is considered to be speaking.
    pub listening_threshold: f32,
    /// Capacity of the captured-chunk channel.
    pub chunk_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 48_000,
            output_sample_rate: 24_000,
            input_channels: 1,
            input_device: None,
            output_device: None,
            listening_threshold: 0.01,
            chunk_capacity: 64,
        }
    }
}

/// Lip-sync heuristics.
///
/// Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Estimated speaking time per word.
    pub ms_per_word: f64,
    /// Estimated speaking time per character.
    pub ms_per_char: f64,
    /// Estimated speaking time per phoneme.
    pub ms_per_phoneme: f64,
    /// Floor for a single phoneme's window.
    pub min_phoneme_ms: f64,
    /// Mouth-opening intensity for bilabial closures (P, B, M).
    pub bilabial_intensity: f32,
    /// Mouth-opening intensity for labiodentals (F, V).
    pub labiodental_intensity: f32,
    /// How long playback continues past the sequence end before auto-stop.
    pub trailing_buffer_ms: u64,
    /// Frame cadence of the playback loop (16ms is roughly 60 fps).
    pub frame_interval_ms: u64,
    /// Maximum number of queued sequences waiting for an audio start.
    pub max_pending: usize,
    /// How long a start request for a not-yet-queued response is remembered.
    pub promotion_window_ms: u64,
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            ms_per_word: 400.0,
            ms_per_char: 45.0,
            ms_per_phoneme: 80.0,
            min_phoneme_ms: 80.0,
            bilabial_intensity: 0.7,
            labiodental_intensity: 0.8,
            trailing_buffer_ms: 1_000,
            frame_interval_ms: 16,
            max_pending: 8,
            promotion_window_ms: 5_000,
        }
    }
}

/// Remote session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Realtime model identifier, sent as the `model` query parameter.
    pub model: String,
    /// Signaling endpoint that exchanges an SDP offer for an answer.
    pub signaling_url: String,
    /// Bearer key for direct upstream signaling. Relays need none.
    pub api_key: Option<String>,
    /// Assistant voice.
    pub voice: String,
    /// Character the assistant plays.
    pub persona: Persona,
    /// Optional scenario appended to the persona instructions.
    pub scenario: Option<String>,
    /// Consecutive connection losses tolerated; the loss that reaches this
    /// count ends the session.
    pub max_reconnect_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n * reconnect_backoff_ms`.
    pub reconnect_backoff_ms: u64,
    /// A restored connection that stays up this long clears the loss count.
    pub reconnect_stable_ms: u64,
    /// Upper bound on ICE candidate gathering before the offer is sent anyway.
    pub ice_gathering_timeout_ms: u64,
    /// Delay between an audio-buffer start and viseme promotion.
    pub audio_start_settle_ms: u64,
    /// Start a transcript's sequence after this delay if no audio start arrives.
    pub transcript_start_fallback_ms: Option<u64>,
    /// Prompt sent once the side channel opens. Empty disables the greeting.
    pub greeting: String,
    /// Label of the structured-message data channel.
    pub data_channel_label: String,
    /// STUN servers handed to the peer transport.
    pub ice_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini-realtime-preview-2024-12-17".to_owned(),
            signaling_url: "http://localhost:3000/api/realtime/offer".to_owned(),
            api_key: None,
            voice: "sage".to_owned(),
            persona: Persona::default(),
            scenario: None,
            max_reconnect_attempts: 3,
            reconnect_backoff_ms: 2_000,
            reconnect_stable_ms: 30_000,
            ice_gathering_timeout_ms: 3_000,
            audio_start_settle_ms: 100,
            transcript_start_fallback_ms: Some(50),
            greeting: "Give a one-sentence spoken greeting to start the conversation.".to_owned(),
            data_channel_label: "oai-events".to_owned(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_owned(),
                "stun:stun1.l.google.com:19302".to_owned(),
            ],
        }
    }
}

impl SessionConfig {
    /// Explicit key, else the `OPENAI_API_KEY` environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Server-side turn detection (voice activity) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnDetectionConfig {
    /// Speech probability threshold (0.0 - 1.0).
    pub threshold: f32,
    /// Audio kept before detected speech onset.
    pub prefix_padding_ms: u32,
    /// Silence that ends a user turn.
    pub silence_duration_ms: u32,
    /// Whether the service answers automatically at end of turn.
    pub create_response: bool,
    /// Whether user speech interrupts an in-progress response.
    pub interrupt_response: bool,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.4,
            prefix_padding_ms: 200,
            silence_duration_ms: 600,
            create_response: true,
            interrupt_response: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SessionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/parley/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("parley").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("parley")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/parley-config/config.toml")
        }
    }

    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`](crate::error::SessionError::Config)
    /// naming the first offending field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let bad = |msg: &str| Err(crate::error::SessionError::Config(msg.to_owned()));

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return bad("audio sample rates must be positive");
        }
        if self.audio.input_channels == 0 {
            return bad("audio.input_channels must be at least 1");
        }
        if self.audio.chunk_capacity == 0 {
            return bad("audio.chunk_capacity must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.audio.listening_threshold) {
            return bad("audio.listening_threshold must be within 0.0..=1.0");
        }

        let lip = &self.lipsync;
        for (name, value) in [
            ("ms_per_word", lip.ms_per_word),
            ("ms_per_char", lip.ms_per_char),
            ("ms_per_phoneme", lip.ms_per_phoneme),
            ("min_phoneme_ms", lip.min_phoneme_ms),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(crate::error::SessionError::Config(format!(
                    "lipsync.{name} must be a positive number"
                )));
            }
        }
        for (name, value) in [
            ("bilabial_intensity", lip.bilabial_intensity),
            ("labiodental_intensity", lip.labiodental_intensity),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(crate::error::SessionError::Config(format!(
                    "lipsync.{name} must be within (0.0, 1.0]"
                )));
            }
        }
        if lip.frame_interval_ms == 0 {
            return bad("lipsync.frame_interval_ms must be positive");
        }
        if lip.max_pending == 0 {
            return bad("lipsync.max_pending must be at least 1");
        }

        if self.session.model.trim().is_empty() {
            return bad("session.model must not be empty");
        }
        if self.session.signaling_url.trim().is_empty() {
            return bad("session.signaling_url must not be empty");
        }
        if self.session.data_channel_label.trim().is_empty() {
            return bad("session.data_channel_label must not be empty");
        }

        if !(0.0..=1.0).contains(&self.turn_detection.threshold) {
            return bad("turn_detection.threshold must be within 0.0..=1.0");
        }
        Ok(())
    }
}
