//! Peer transport seam.
//!
//! The engine drives a peer connection through [`PeerTransport`] and
//! [`PeerLink`] and learns about its lifecycle from [`TransportEvent`]s.
//! [`WebRtcTransport`](super::WebRtcTransport) is the real implementation;
//! tests use scripted doubles.

use crate::audio::{AudioChunk, LocalAudio};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from an open peer.
#[derive(Debug)]
pub enum TransportEvent {
    PeerState(PeerState),
    /// The remote audio track arrived. Chunks are decoded PCM.
    RemoteTrack(mpsc::Receiver<AudioChunk>),
    /// The side channel is open and accepts messages.
    ChannelOpen,
    /// One inbound side-channel frame.
    ChannelMessage(String),
    ChannelError(String),
    ChannelClosed,
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Parameters for opening a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSetup {
    pub ice_servers: Vec<String>,
    /// Label of the structured-message side channel.
    pub data_channel_label: String,
}

/// One open peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the local offer and apply it as the local description.
    async fn create_offer(&self) -> Result<()>;

    /// Resolve once candidate gathering completes. The caller bounds this
    /// with a timeout.
    async fn wait_gathering_complete(&self);

    /// Current local SDP, including any gathered candidates.
    async fn local_description(&self) -> Result<String>;

    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Send one side-channel message.
    async fn send(&self, message: String) -> Result<()>;

    /// Close the side channel and the peer. Best effort.
    async fn close(&self);
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open a peer carrying `local` as its outgoing audio track, with a
    /// receive-capable audio transceiver and a side channel. Events flow to
    /// `events` until the link is closed.
    async fn open(
        &self,
        setup: &PeerSetup,
        local: &mut LocalAudio,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerLink>>;
}
