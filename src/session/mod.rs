//! Realtime conversational session.
//!
//! [`SessionEngine`] acquires the microphone, negotiates a peer connection
//! through a [`SignalingClient`], configures the remote model over the side
//! channel and keeps the connection alive with bounded reconnection. Inbound
//! side-channel traffic is decoded by [`protocol`] and drives lip-sync.

pub mod engine;
pub mod protocol;
pub mod signaling;
pub mod state;
pub mod transport;
pub mod rtc;

pub use engine::{SessionDeps, SessionEngine, SessionHandle};
pub use protocol::{ClientEvent, InboundEvent};
pub use signaling::{HttpSignaling, SignalingClient};
pub use state::{FailureReason, ReconnectDecision, ReconnectPolicy, SessionMachine, SessionState};
pub use transport::{PeerLink, PeerSetup, PeerState, PeerTransport, TransportEvent, TransportEvents};
pub use rtc::{WebRtcLink, WebRtcTransport};
