//! Error types for the realtime session engine.

use std::fmt;

/// Why the microphone could not be acquired.
///
/// Capture failures are shown to the user verbatim and are never retried
/// automatically, so each category carries its own actionable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFailure {
    /// The OS or user refused microphone access.
    PermissionDenied,
    /// No input device is connected (or the configured one vanished).
    DeviceMissing,
    /// The device exists but another application holds it.
    DeviceBusy,
    /// Anything the backend reported that fits none of the above.
    Other(String),
}

impl CaptureFailure {
    /// Classify a backend error description.
    ///
    /// Audio backends report these conditions as free-form text, so the
    /// classification is keyword based.
    pub fn from_backend_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if ["permission", "denied", "not authorized", "unauthorized", "not permitted"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Self::PermissionDenied
        } else if ["busy", "in use", "exclusive", "resource unavailable"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Self::DeviceBusy
        } else if [
            "not found",
            "no device",
            "not available",
            "no longer available",
            "no default input",
        ]
            .iter()
            .any(|k| lower.contains(k))
        {
            Self::DeviceMissing
        } else {
            Self::Other(message.to_owned())
        }
    }

    /// User-facing explanation.
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => {
                "Microphone access denied. Please allow the mic and retry.".to_owned()
            }
            Self::DeviceMissing => "No microphone found. Connect one and retry.".to_owned(),
            Self::DeviceBusy => {
                "Microphone busy in another app. Close it (Zoom/Meet/etc.) and retry.".to_owned()
            }
            Self::Other(detail) => format!("Connection failed: {detail}"),
        }
    }
}

impl fmt::Display for CaptureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_message())
    }
}

/// Top-level error type for the session engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Microphone acquisition failed.
    #[error("capture error: {0}")]
    Capture(CaptureFailure),

    /// The offer/answer exchange with the relay failed.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Peer connection or side-channel failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Outbound message could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio device or stream error outside of acquisition.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error (engine task gone).
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
