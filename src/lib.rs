//! Parley: realtime voice conversation sessions with lip-sync.
//!
//! The crate drives a speech-to-speech conversation with a remote realtime
//! model and animates a face while the model speaks:
//! Microphone → Peer connection → Remote model → Speaker + Visemes
//!
//! # Architecture
//!
//! - **Audio**: microphone capture and remote-audio playback via `cpal`
//! - **Session**: signaling, side-channel protocol and reconnection, run as a
//!   single actor task
//! - **Viseme**: text → phonemes → timed visemes, played against the audio
//!   clock by a frame-loop task
//! - **Persona**: character instructions sent to the remote model

pub mod audio;
pub mod config;
pub mod error;
pub mod persona;
pub mod runtime;
pub mod session;
pub mod viseme;

pub use config::EngineConfig;
pub use error::{CaptureFailure, Result, SessionError};
pub use persona::Persona;
pub use runtime::SessionEvent;
pub use session::{SessionDeps, SessionEngine, SessionHandle, SessionState, WebRtcTransport};
pub use viseme::{LipSyncDriver, LipSyncHandle, Viseme, VisemeFrame};
