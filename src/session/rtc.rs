//! [`PeerTransport`] over webrtc-rs.
//!
//! Each link is one `RTCPeerConnection` with a send/receive PCMU audio track
//! and an ordered data channel for the structured side channel. Captured
//! microphone audio is packetized onto the local track; the remote track is
//! decoded and handed to the engine as an [`AudioChunk`] stream.

use super::transport::{
    PeerLink, PeerSetup, PeerState, PeerTransport, TransportEvent, TransportEvents,
};
use crate::audio::g711::{self, FRAME_DURATION, PCMU_RATE, PcmuPacketizer};
use crate::audio::{AudioChunk, LocalAudio};
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Static payload type for PCMU.
const PCMU_PAYLOAD_TYPE: u8 = 0;

/// Decoded remote chunks buffered ahead of the audio output.
const REMOTE_CHUNK_CAPACITY: usize = 64;

fn transport_err(context: &str, e: impl std::fmt::Display) -> SessionError {
    SessionError::Transport(format!("{context}: {e}"))
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Map the stack's connection state onto the engine's.
pub(crate) fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

/// Opens webrtc-rs peer connections.
pub struct WebRtcTransport {
    api: API,
}

impl WebRtcTransport {
    /// Build the media engine (PCMU only) and the default interceptors.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] if codec or interceptor
    /// registration fails.
    pub fn new() -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_codec(
                RTCRtpCodecParameters {
                    capability: pcmu_capability(),
                    payload_type: PCMU_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| transport_err("register PCMU", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| transport_err("register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn open(
        &self,
        setup: &PeerSetup,
        local: &mut LocalAudio,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerLink>> {
        let ice_servers = if setup.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: setup.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| transport_err("create peer connection", e))?;

        let link = WebRtcLink {
            peer: Arc::new(peer),
            channel: Mutex::new(None),
            gathering: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        // From here on a failure must still close the peer.
        match link.wire(setup, local, events).await {
            Ok(channel) => {
                *link.channel.lock().await = Some(channel);
                Ok(Arc::new(link))
            }
            Err(e) => {
                link.close().await;
                Err(e)
            }
        }
    }
}

/// One webrtc-rs peer connection.
pub struct WebRtcLink {
    peer: Arc<RTCPeerConnection>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
    /// Stops the capture pump and the remote track reader.
    cancel: CancellationToken,
}

impl WebRtcLink {
    /// Attach audio, callbacks and the side channel to a fresh peer.
    async fn wire(
        &self,
        setup: &PeerSetup,
        local: &mut LocalAudio,
        events: TransportEvents,
    ) -> Result<Arc<RTCDataChannel>> {
        let state_events = events.clone();
        self.peer
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(%state, "peer connection state");
                let _ = state_events.send(TransportEvent::PeerState(peer_state(state)));
                Box::pin(async {})
            }));

        let track_events = events.clone();
        let track_cancel = self.cancel.clone();
        self.peer.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let cancel = track_cancel.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    let (tx, rx) = mpsc::channel(REMOTE_CHUNK_CAPACITY);
                    let _ = events.send(TransportEvent::RemoteTrack(rx));
                    tokio::spawn(read_remote_track(track, tx, cancel));
                })
            },
        ));

        self.attach_local_audio(local).await?;

        let channel = self
            .peer
            .create_data_channel(&setup.data_channel_label, None)
            .await
            .map_err(|e| transport_err("create data channel", e))?;
        wire_channel(&channel, events);
        Ok(channel)
    }

    async fn attach_local_audio(&self, local: &mut LocalAudio) -> Result<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_owned(),
            "parley".to_owned(),
        ));
        let sender = self
            .peer
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| transport_err("add local track", e))?;

        // RTCP has to be drained for the interceptors to run.
        let rtcp_cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = rtcp_cancel.cancelled() => break,
                    read = sender.read(&mut buf) => {
                        if read.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        match local.take_chunks() {
            Some(chunks) => {
                tokio::spawn(pump_local_audio(
                    chunks,
                    local.sample_rate(),
                    track,
                    self.cancel.clone(),
                ));
            }
            None => warn!("local audio already taken; sending no microphone audio"),
        }
        Ok(())
    }
}

fn wire_channel(channel: &Arc<RTCDataChannel>, events: TransportEvents) {
    let label = channel.label().to_owned();

    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        info!(label = %label, "side channel open");
        let _ = open_events.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(frame) => {
                let _ = message_events.send(TransportEvent::ChannelMessage(frame));
            }
            Err(_) => debug!(bytes = msg.data.len(), "non-UTF-8 side channel frame ignored"),
        }
        Box::pin(async {})
    }));

    let error_events = events.clone();
    channel.on_error(Box::new(move |e: webrtc::Error| {
        let _ = error_events.send(TransportEvent::ChannelError(e.to_string()));
        Box::pin(async {})
    }));

    channel.on_close(Box::new(move || {
        let _ = events.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

/// Packetize captured audio onto the local track until cancelled.
async fn pump_local_audio(
    mut chunks: mpsc::Receiver<AudioChunk>,
    input_rate: u32,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) {
    let mut packetizer = PcmuPacketizer::new(input_rate);
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        for frame in packetizer.push(&chunk.samples) {
            let sample = Sample {
                data: Bytes::from(frame),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("local audio write failed: {e}");
            }
        }
    }
    debug!("local audio pump stopped");
}

/// Decode remote RTP into chunks until the track ends or the link closes.
async fn read_remote_track(
    track: Arc<TrackRemote>,
    tx: mpsc::Sender<AudioChunk>,
    cancel: CancellationToken,
) {
    let mime = track.codec().capability.mime_type;
    if !mime.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
        warn!(%mime, "remote track codec not supported; audio dropped");
    }
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read_rtp() => read,
        };
        let packet = match read {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!("remote track ended: {e}");
                break;
            }
        };
        if !mime.eq_ignore_ascii_case(MIME_TYPE_PCMU) || packet.payload.is_empty() {
            continue;
        }
        let chunk = AudioChunk {
            samples: g711::decode(&packet.payload),
            sample_rate: PCMU_RATE,
            captured_at: std::time::Instant::now(),
        };
        if tx.send(chunk).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<()> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(|e| transport_err("create offer", e))?;
        // Subscribe before applying, so completion cannot be missed.
        let gathering = self.peer.gathering_complete_promise().await;
        self.peer
            .set_local_description(offer)
            .await
            .map_err(|e| transport_err("set local description", e))?;
        *self.gathering.lock().await = Some(gathering);
        Ok(())
    }

    async fn wait_gathering_complete(&self) {
        let Some(mut gathering) = self.gathering.lock().await.take() else {
            return;
        };
        let _ = gathering.recv().await;
        debug!("ICE gathering complete");
    }

    async fn local_description(&self) -> Result<String> {
        self.peer
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| SessionError::Transport("no local description".to_owned()))
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| transport_err("parse answer", e))?;
        self.peer
            .set_remote_description(answer)
            .await
            .map_err(|e| transport_err("set remote description", e))
    }

    async fn send(&self, message: String) -> Result<()> {
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::Transport("side channel not created".to_owned()))?;
        channel
            .send_text(message)
            .await
            .map(|_| ())
            .map_err(|e| transport_err("side channel send", e))
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(channel) = self.channel.lock().await.take()
            && let Err(e) = channel.close().await
        {
            debug!("side channel close failed: {e}");
        }
        if let Err(e) = self.peer.close().await {
            debug!("peer close failed: {e}");
        }
    }
}
