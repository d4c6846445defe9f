//! Session events emitted by the engine for UI and observability.
//!
//! Payloads are small so the engine can broadcast without blocking.

use crate::session::SessionState;
use std::time::Duration;

/// Events describing what the session is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Lifecycle transition.
    State(SessionState),
    /// Human-readable status line.
    Status(String),
    /// Error reported by the remote service. The session keeps running.
    ServiceError(String),
    /// Microphone level, sent when the user starts or stops speaking.
    InputLevel { rms: f32, listening: bool },
    /// Whether a remote audio track is currently attached to the output.
    RemoteAudio(bool),
    /// A reconnection attempt has been scheduled.
    Reconnecting {
        attempt: u32,
        max: u32,
        delay: Duration,
    },
}
