//! Scripted doubles for the session engine's collaborators.

use async_trait::async_trait;
use parley::audio::{AudioChunk, AudioOutput, LocalAudio, LocalAudioFeed, MediaCapture};
use parley::config::EngineConfig;
use parley::error::{CaptureFailure, Result, SessionError};
use parley::session::{
    PeerLink, PeerSetup, PeerState, PeerTransport, SessionDeps, SessionEngine, SessionHandle,
    SessionState, SignalingClient, TransportEvent, TransportEvents,
};
use parley::viseme::{AudioProgress, VisemeFrame};
use parley::SessionEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Microphone that either hands out a feedable track or fails.
#[derive(Default)]
pub(crate) struct FakeCapture {
    pub failure: Mutex<Option<CaptureFailure>>,
    pub feeds: Mutex<Vec<LocalAudioFeed>>,
    pub stops: Mutex<Vec<CancellationToken>>,
    pub acquired: AtomicUsize,
}

impl FakeCapture {
    pub fn failing(failure: CaptureFailure) -> Self {
        Self {
            failure: Mutex::new(Some(failure)),
            ..Self::default()
        }
    }

    pub fn last_feed(&self) -> LocalAudioFeed {
        self.feeds.lock().unwrap().last().cloned().expect("no track acquired")
    }

    /// Whether the most recently acquired track has been released.
    pub fn last_released(&self) -> bool {
        self.stops
            .lock()
            .unwrap()
            .last()
            .expect("no track acquired")
            .is_cancelled()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self) -> std::result::Result<LocalAudio, CaptureFailure> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failure.lock().unwrap().clone() {
            return Err(failure);
        }
        let (feed, local) = LocalAudio::channel(48_000, 16, 0.01);
        self.feeds.lock().unwrap().push(feed);
        self.stops.lock().unwrap().push(local.stop_token());
        Ok(local)
    }
}

/// How a scripted peer behaves once opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkScript {
    /// Open the side channel and report connected after the answer.
    Connect,
    /// Accept everything but never report progress.
    Silent,
    /// Fail to open the peer at all.
    FailOpen,
    /// Like `Connect`, but candidate gathering never completes.
    StallGathering,
}

pub(crate) struct FakeLink {
    script: LinkScript,
    events: TransportEvents,
    pub sent: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    pub answer: Mutex<Option<String>>,
}

impl FakeLink {
    /// Inject a transport event as if the peer produced it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_gathering_complete(&self) {
        if self.script == LinkScript::StallGathering {
            std::future::pending::<()>().await;
        }
    }

    async fn local_description(&self) -> Result<String> {
        Ok("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_owned())
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        *self.answer.lock().unwrap() = Some(sdp);
        if matches!(self.script, LinkScript::Connect | LinkScript::StallGathering) {
            self.emit(TransportEvent::ChannelOpen);
            self.emit(TransportEvent::PeerState(PeerState::Connected));
        }
        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Peer factory that follows a per-attempt script.
pub(crate) struct FakeTransport {
    scripts: Mutex<VecDeque<LinkScript>>,
    fallback: LinkScript,
    pub links: Mutex<Vec<Arc<FakeLink>>>,
    pub opened: AtomicUsize,
    pub setups: Mutex<Vec<PeerSetup>>,
    pub tracks: Mutex<Vec<mpsc::Receiver<AudioChunk>>>,
}

impl FakeTransport {
    pub fn new(scripts: impl IntoIterator<Item = LinkScript>, fallback: LinkScript) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            fallback,
            links: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            setups: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn connecting() -> Self {
        Self::new([], LinkScript::Connect)
    }

    pub fn link(&self, index: usize) -> Arc<FakeLink> {
        Arc::clone(&self.links.lock().unwrap()[index])
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn open(
        &self,
        setup: &PeerSetup,
        local: &mut LocalAudio,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerLink>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.setups.lock().unwrap().push(setup.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if script == LinkScript::FailOpen {
            return Err(SessionError::Transport("peer refused".to_owned()));
        }
        if let Some(track) = local.take_chunks() {
            self.tracks.lock().unwrap().push(track);
        }
        let link = Arc::new(FakeLink {
            script,
            events,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            answer: Mutex::new(None),
        });
        self.links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }
}

/// Signaling relay that answers every offer, or fails the first `failures`.
#[derive(Default)]
pub(crate) struct FakeSignaling {
    pub failures: AtomicUsize,
    pub offers: Mutex<Vec<String>>,
    pub offered_at: Mutex<Vec<Instant>>,
}

impl FakeSignaling {
    pub fn failing(times: usize) -> Self {
        Self {
            failures: AtomicUsize::new(times),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SignalingClient for FakeSignaling {
    async fn exchange(&self, offer_sdp: String) -> Result<String> {
        self.offers.lock().unwrap().push(offer_sdp);
        self.offered_at.lock().unwrap().push(Instant::now());
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SessionError::Signaling("relay HTTP 500: boom".to_owned()));
        }
        Ok("v=0\r\no=- answer\r\n".to_owned())
    }
}

/// Audio progress that never advances, so lip-sync stays on wall time.
struct StalledProgress;

impl AudioProgress for StalledProgress {
    fn is_paused(&self) -> bool {
        true
    }

    fn position(&self) -> Duration {
        Duration::ZERO
    }
}

/// Output that accepts tracks without playing them.
#[derive(Default)]
pub(crate) struct FakeOutput {
    pub attached: AtomicUsize,
    pub detached: AtomicUsize,
}

impl AudioOutput for FakeOutput {
    fn attach(&self, _track: mpsc::Receiver<AudioChunk>) -> Arc<dyn AudioProgress> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        Arc::new(StalledProgress)
    }

    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
}

/// Frames received by the lip-sync sink.
pub(crate) type Frames = Arc<Mutex<Vec<VisemeFrame>>>;

pub(crate) struct Harness {
    pub handle: SessionHandle,
    pub events: broadcast::Receiver<SessionEvent>,
    pub capture: Arc<FakeCapture>,
    pub transport: Arc<FakeTransport>,
    pub signaling: Arc<FakeSignaling>,
    pub output: Arc<FakeOutput>,
    pub frames: Frames,
    pub cancel: CancellationToken,
}

pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.session.max_reconnect_attempts = 3;
    config.session.reconnect_backoff_ms = 2_000;
    config
}

pub(crate) fn spawn_engine(
    config: EngineConfig,
    capture: FakeCapture,
    transport: FakeTransport,
    signaling: FakeSignaling,
) -> Harness {
    let capture = Arc::new(capture);
    let transport = Arc::new(transport);
    let signaling = Arc::new(signaling);
    let output = Arc::new(FakeOutput::default());
    let frames: Frames = Arc::default();
    let sink_frames = Arc::clone(&frames);
    let cancel = CancellationToken::new();

    let deps = SessionDeps {
        capture: capture.clone(),
        transport: transport.clone(),
        signaling: signaling.clone(),
        output: Some(output.clone()),
    };
    let (handle, _task) = SessionEngine::spawn(
        config,
        deps,
        move |frame: VisemeFrame| sink_frames.lock().unwrap().push(frame),
        cancel.clone(),
    );
    let events = handle.subscribe();
    Harness {
        handle,
        events,
        capture,
        transport,
        signaling,
        output,
        frames,
        cancel,
    }
}

/// Wait until the session reaches a state matching `pred`.
pub(crate) async fn wait_for_state(
    handle: &SessionHandle,
    pred: impl Fn(&SessionState) -> bool,
) -> SessionState {
    let mut rx = handle.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("engine dropped its state channel");
    state.clone()
}

/// Drain all pending events from the broadcast receiver into a Vec.
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        events.push(evt);
    }
    events
}

/// Let spawned tasks run without advancing the paused clock far.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
