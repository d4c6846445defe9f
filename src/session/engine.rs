//! Session actor: establishes, supervises and tears down the realtime session.
//!
//! All session state lives on one task. Control calls from [`SessionHandle`]
//! and everything produced by the current connection attempt arrive as
//! messages; attempt-scoped messages carry a generation number so results
//! from a superseded attempt are discarded.

use super::protocol::{ClientEvent, InboundEvent};
use super::signaling::SignalingClient;
use super::state::{FailureReason, ReconnectDecision, ReconnectPolicy, SessionMachine, SessionState};
use super::transport::{PeerLink, PeerSetup, PeerState, PeerTransport, TransportEvent};
use crate::audio::{AudioOutput, InputLevel, LocalAudio, MediaCapture};
use crate::config::EngineConfig;
use crate::error::{Result, SessionError};
use crate::persona::{self, Persona};
use crate::runtime::SessionEvent;
use crate::viseme::{LipSyncDriver, LipSyncHandle, UtteranceScheduler, VisemeSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// External collaborators of the engine.
#[derive(Clone)]
pub struct SessionDeps {
    pub capture: Arc<dyn MediaCapture>,
    pub transport: Arc<dyn PeerTransport>,
    pub signaling: Arc<dyn SignalingClient>,
    /// Where the remote track is played. `None` leaves the lip-sync clock on
    /// wall time.
    pub output: Option<Arc<dyn AudioOutput>>,
}

enum SessionCommand {
    Start,
    Stop,
    SetMuted(bool),
    SendText(String),
    SetPersona(Persona),
    SetScenario(Option<String>),
    Shutdown,
}

/// Cloneable control surface for a running engine.
///
/// Control calls enqueue and return immediately; the engine applies them in
/// order on its next turn.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    lipsync: LipSyncHandle,
}

impl SessionHandle {
    /// Start a session, tearing down any live one first.
    pub fn start(&self) -> Result<()> {
        self.send(SessionCommand::Start)
    }

    /// Tear everything down and return to idle.
    pub fn stop(&self) -> Result<()> {
        self.send(SessionCommand::Stop)
    }

    /// Silence outgoing audio without renegotiating.
    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.send(SessionCommand::SetMuted(muted))
    }

    /// Inject typed text. Ignored while the side channel is closed.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send(SessionCommand::SendText(text.to_owned()))
    }

    pub fn set_persona(&self, persona: Persona) -> Result<()> {
        self.send(SessionCommand::SetPersona(persona))
    }

    /// Replace the scenario. Blank text clears it.
    pub fn set_scenario(&self, scenario: impl Into<String>) -> Result<()> {
        let scenario = scenario.into();
        let scenario = (!scenario.trim().is_empty()).then_some(scenario);
        self.send(SessionCommand::SetScenario(scenario))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The lip-sync driver fed by this session.
    pub fn lipsync(&self) -> &LipSyncHandle {
        &self.lipsync
    }

    /// Stop the session and end the engine task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown)
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Channel("session engine has stopped".to_owned()))
    }
}

/// Messages produced on behalf of one connection attempt.
enum AttemptMessage {
    Stage(SessionState),
    LinkOpened {
        link: Arc<dyn PeerLink>,
        local: LocalAudio,
    },
    Negotiated,
    Failed(SessionError),
    Transport(TransportEvent),
    Level(InputLevel),
}

struct Internal {
    generation: u64,
    message: AttemptMessage,
}

/// Resources held by the current connection attempt.
struct Attempt {
    generation: u64,
    cancel: CancellationToken,
    reconnecting: bool,
    link: Option<Arc<dyn PeerLink>>,
    local: Option<LocalAudio>,
    channel_open: bool,
    remote_audio: bool,
}

pub struct SessionEngine {
    config: EngineConfig,
    deps: SessionDeps,
    lipsync: LipSyncHandle,
    scheduler: UtteranceScheduler,
    machine: SessionMachine,
    persona: Persona,
    scenario: Option<String>,
    muted: bool,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    cancel: CancellationToken,
    generation: u64,
    attempt: Option<Attempt>,
    reconnect_at: Option<Instant>,
    /// When the restored connection counts as stable again.
    stable_at: Option<Instant>,
}

impl SessionEngine {
    /// Spawn the engine and its lip-sync driver.
    ///
    /// Runs until [`SessionHandle::shutdown`], every handle is dropped, or
    /// `cancel` fires.
    pub fn spawn(
        config: EngineConfig,
        deps: SessionDeps,
        sink: impl VisemeSink + 'static,
        cancel: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (lipsync, _lipsync_task) =
            LipSyncDriver::spawn(&config.lipsync, sink, cancel.child_token());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let policy = ReconnectPolicy {
            max_attempts: config.session.max_reconnect_attempts,
            backoff_step: Duration::from_millis(config.session.reconnect_backoff_ms),
        };
        let engine = Self {
            scheduler: UtteranceScheduler::new(config.lipsync.clone()),
            persona: config.session.persona,
            scenario: config.session.scenario.clone(),
            config,
            deps,
            lipsync: lipsync.clone(),
            machine: SessionMachine::new(policy),
            muted: false,
            state_tx,
            events: events.clone(),
            internal_tx,
            cancel: cancel.clone(),
            generation: 0,
            attempt: None,
            reconnect_at: None,
            stable_at: None,
        };

        let handle = SessionHandle {
            commands: commands_tx,
            state: state_rx,
            events,
            lipsync,
        };
        let task = tokio::spawn(engine.run(commands_rx, internal_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            let reconnect_at = self.reconnect_at;
            let stable_at = self.stable_at;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(msg) = internal.recv() => self.handle_internal(msg).await,
                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)),
                    if reconnect_at.is_some() =>
                {
                    self.reconnect_at = None;
                    self.begin_attempt();
                }
                _ = tokio::time::sleep_until(stable_at.unwrap_or_else(Instant::now)),
                    if stable_at.is_some() =>
                {
                    self.stable_at = None;
                    self.machine.on_stable();
                    debug!("connection stable; loss count cleared");
                }
            }
        }

        self.teardown_attempt().await;
        self.lipsync.stop();
        self.set_state(SessionState::Idle);
        self.cancel.cancel();
        info!("session engine stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start => {
                if self.attempt.is_some() || self.reconnect_at.is_some() {
                    debug!("start while live; tearing down the current session first");
                    self.teardown_attempt().await;
                    self.reconnect_at = None;
                }
                self.machine.reset();
                self.lipsync.stop();
                self.begin_attempt();
            }
            SessionCommand::Stop => {
                self.set_state(SessionState::Stopped);
                self.teardown_attempt().await;
                self.reconnect_at = None;
                self.machine.reset();
                self.lipsync.stop();
                self.set_state(SessionState::Idle);
            }
            SessionCommand::SetMuted(muted) => {
                self.muted = muted;
                if let Some(local) = self.attempt.as_ref().and_then(|a| a.local.as_ref()) {
                    local.set_enabled(!muted);
                }
                debug!(muted, "microphone mute changed");
            }
            SessionCommand::SendText(text) => {
                let instructions = self.instructions();
                let event = ClientEvent::user_text(&self.config.session.model, &instructions, &text);
                self.send_if_open(event, "user text").await;
            }
            SessionCommand::SetPersona(persona) => {
                self.persona = persona;
                let event = ClientEvent::persona_change(persona, self.scenario.as_deref());
                self.send_if_open(event, "persona change").await;
            }
            SessionCommand::SetScenario(scenario) => {
                self.scenario = scenario;
                let event = ClientEvent::scenario_update(
                    &self.config.session.model,
                    self.persona,
                    self.scenario.as_deref(),
                );
                self.send_if_open(event, "scenario update").await;
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn instructions(&self) -> String {
        persona::build_instructions(self.persona, self.scenario.as_deref())
    }

    fn begin_attempt(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let cancel = self.cancel.child_token();
        let reconnecting = self.machine.attempts() > 0;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        self.attempt = Some(Attempt {
            generation,
            cancel: cancel.clone(),
            reconnecting,
            link: None,
            local: None,
            channel_open: false,
            remote_audio: false,
        });
        if reconnecting {
            self.set_state(SessionState::Connecting);
        }
        info!(generation, reconnecting, "starting connection attempt");

        // Transport events join the engine's queue tagged with this attempt.
        let forward_tx = self.internal_tx.clone();
        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = forward_cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let msg = Internal {
                    generation,
                    message: AttemptMessage::Transport(event),
                };
                if forward_tx.send(msg).is_err() {
                    break;
                }
            }
        });

        let ctx = EstablishContext {
            generation,
            deps: self.deps.clone(),
            setup: PeerSetup {
                ice_servers: self.config.session.ice_servers.clone(),
                data_channel_label: self.config.session.data_channel_label.clone(),
            },
            gathering_timeout: Duration::from_millis(self.config.session.ice_gathering_timeout_ms),
            internal: self.internal_tx.clone(),
            events: events_tx,
        };
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = ctx.establish() => result,
            };
            if let Err(error) = result {
                ctx.report(AttemptMessage::Failed(error));
            }
        });
    }

    async fn handle_internal(&mut self, msg: Internal) {
        let current = self.attempt.as_ref().map(|a| a.generation);
        if current != Some(msg.generation) {
            debug!(generation = msg.generation, "dropping message from a superseded attempt");
            if let AttemptMessage::LinkOpened { link, .. } = msg.message {
                link.close().await;
            }
            return;
        }

        match msg.message {
            AttemptMessage::Stage(state) => {
                if self.attempt.as_ref().is_some_and(|a| !a.reconnecting) {
                    self.set_state(state);
                }
            }
            AttemptMessage::LinkOpened { link, local } => {
                local.set_enabled(!self.muted);
                self.watch_level(&local, msg.generation);
                let open_already = match self.attempt.as_mut() {
                    Some(attempt) => {
                        attempt.link = Some(link);
                        attempt.local = Some(local);
                        attempt.channel_open
                    }
                    None => false,
                };
                if open_already {
                    self.configure_session().await;
                }
            }
            AttemptMessage::Negotiated => {
                self.status("Connected: waiting for audio...");
            }
            AttemptMessage::Failed(error) => self.attempt_failed(error).await,
            AttemptMessage::Transport(event) => self.handle_transport(event).await,
            AttemptMessage::Level(level) => {
                let _ = self.events.send(SessionEvent::InputLevel {
                    rms: level.rms,
                    listening: level.listening,
                });
            }
        }
    }

    fn watch_level(&self, local: &LocalAudio, generation: u64) {
        let Some(cancel) = self.attempt.as_ref().map(|a| a.cancel.clone()) else {
            return;
        };
        let mut level = local.level();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = level.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *level.borrow_and_update();
                        let msg = Internal {
                            generation,
                            message: AttemptMessage::Level(current),
                        };
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerState(PeerState::Connected) => {
                self.machine.on_connected();
                if self.machine.attempts() > 0 {
                    let stable = Duration::from_millis(self.config.session.reconnect_stable_ms);
                    self.stable_at = Some(Instant::now() + stable);
                }
                self.set_state(SessionState::Connected);
            }
            TransportEvent::PeerState(PeerState::Disconnected | PeerState::Failed) => {
                self.connection_lost("peer connection lost".to_owned()).await;
            }
            TransportEvent::PeerState(PeerState::Closed) => {
                if self.current_state() == SessionState::Connected {
                    self.disconnected().await;
                }
            }
            TransportEvent::PeerState(state) => debug!(?state, "peer state"),
            TransportEvent::RemoteTrack(track) => {
                let Some(output) = self.deps.output.clone() else {
                    debug!("no audio output configured; remote track ignored");
                    return;
                };
                let progress = output.attach(track);
                self.lipsync.attach_audio(Some(progress));
                if let Some(attempt) = self.attempt.as_mut() {
                    attempt.remote_audio = true;
                }
                let _ = self.events.send(SessionEvent::RemoteAudio(true));
            }
            TransportEvent::ChannelOpen => {
                let has_link = match self.attempt.as_mut() {
                    Some(attempt) => {
                        attempt.channel_open = true;
                        attempt.link.is_some()
                    }
                    None => false,
                };
                if has_link {
                    self.configure_session().await;
                }
            }
            TransportEvent::ChannelMessage(frame) => {
                let event = InboundEvent::decode(&frame);
                self.dispatch(event);
            }
            TransportEvent::ChannelError(error) => {
                warn!("side channel error: {error}");
                self.status("Data channel error: trying to reconnect...");
                self.connection_lost(format!("side channel error: {error}")).await;
            }
            TransportEvent::ChannelClosed => {
                if let Some(attempt) = self.attempt.as_mut() {
                    attempt.channel_open = false;
                }
                if self.current_state() == SessionState::Connected {
                    self.disconnected().await;
                }
            }
        }
    }

    /// Send session configuration and the greeting request.
    async fn configure_session(&mut self) {
        self.status("Connected: configuring AI...");
        let update = ClientEvent::session_update(
            &self.config.session,
            &self.config.turn_detection,
            self.instructions(),
        );
        self.send_if_open(update, "session update").await;

        let greeting = self.config.session.greeting.trim().to_owned();
        if !greeting.is_empty() {
            self.send_if_open(ClientEvent::greeting(&greeting), "greeting").await;
        }
    }

    fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::TranscriptComplete {
                response_id,
                transcript,
            } => {
                debug!(response = %response_id, "transcript complete");
                let sequence = self.scheduler.schedule(&transcript, None);
                self.lipsync.queue(response_id.clone(), sequence);
                if let Some(ms) = self.config.session.transcript_start_fallback_ms {
                    self.lipsync
                        .schedule_start_after(response_id, Duration::from_millis(ms));
                }
            }
            InboundEvent::TextComplete { response_id, text } => {
                debug!(response = %response_id, "text complete");
                let sequence = self.scheduler.schedule(&text, None);
                self.lipsync.queue(response_id, sequence);
            }
            InboundEvent::AudioStarted { response_id } => {
                debug!(response = %response_id, "remote audio buffer started");
                let settle = Duration::from_millis(self.config.session.audio_start_settle_ms);
                self.lipsync.schedule_start_after(response_id, settle);
            }
            InboundEvent::AudioStopped | InboundEvent::AudioCleared => {
                debug!("remote audio buffer ended; stopping lip-sync");
                self.lipsync.stop();
            }
            InboundEvent::VisemeHint(frame) => self.lipsync.hint(frame),
            InboundEvent::ServiceError { message } => {
                warn!("remote service error: {message}");
                let _ = self.events.send(SessionEvent::ServiceError(message));
                self.status("AI Error");
            }
            InboundEvent::Unrecognized => {}
        }
    }

    async fn attempt_failed(&mut self, error: SessionError) {
        warn!("connection attempt failed: {error}");
        match error {
            SessionError::Capture(failure) => {
                self.teardown_attempt().await;
                self.fail(FailureReason::Capture(failure.user_message()));
            }
            other if self.machine.ever_connected() => {
                self.connection_lost(other.to_string()).await;
            }
            SessionError::Signaling(detail) => {
                self.teardown_attempt().await;
                self.fail(FailureReason::Signaling(detail));
            }
            other => {
                self.teardown_attempt().await;
                self.fail(FailureReason::Transport(other.to_string()));
            }
        }
    }

    /// The connection dropped, or an attempt to restore it failed.
    async fn connection_lost(&mut self, detail: String) {
        self.teardown_attempt().await;
        if !self.machine.ever_connected() {
            self.fail(FailureReason::Transport(detail));
            return;
        }

        match self.machine.on_connection_lost() {
            ReconnectDecision::Retry { attempt, delay } => {
                let max = self.machine.policy().max_attempts;
                info!(attempt, max, ?delay, "scheduling reconnection: {detail}");
                self.set_state(SessionState::Reconnecting { attempt });
                self.status(&format!("Reconnecting... ({attempt}/{max})"));
                let _ = self
                    .events
                    .send(SessionEvent::Reconnecting { attempt, max, delay });
                self.reconnect_at = Some(Instant::now() + delay);
            }
            ReconnectDecision::GiveUp { attempts } => {
                self.fail(FailureReason::ReconnectExhausted { attempts });
            }
        }
    }

    /// The connection closed cleanly while up.
    async fn disconnected(&mut self) {
        self.teardown_attempt().await;
        self.set_state(SessionState::Disconnected);
    }

    fn fail(&mut self, reason: FailureReason) {
        self.reconnect_at = None;
        self.lipsync.stop();
        let message = reason.to_string();
        self.set_state(SessionState::Failed(reason));
        self.status(&message);
    }

    /// Release everything held by the current attempt. Best effort.
    async fn teardown_attempt(&mut self) {
        self.stable_at = None;
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        attempt.cancel.cancel();
        if let Some(link) = attempt.link {
            link.close().await;
        }
        if let Some(local) = attempt.local {
            local.stop();
        }
        if attempt.remote_audio {
            if let Some(output) = &self.deps.output {
                output.detach();
            }
            self.lipsync.attach_audio(None);
            let _ = self.events.send(SessionEvent::RemoteAudio(false));
        }
        self.lipsync.stop();
        debug!(generation = attempt.generation, "connection attempt torn down");
    }

    async fn send_if_open(&self, event: ClientEvent, what: &str) {
        let Some(link) = self
            .attempt
            .as_ref()
            .filter(|a| a.channel_open)
            .and_then(|a| a.link.clone())
        else {
            debug!("side channel not open; {what} ignored");
            return;
        };
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode {what}: {e}");
                return;
            }
        };
        if let Err(e) = link.send(payload).await {
            warn!("failed to send {what}: {e}");
        }
    }

    fn current_state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!(?state, "session state");
        let status = state.status_text();
        self.state_tx.send_replace(state.clone());
        let _ = self.events.send(SessionEvent::State(state));
        let _ = self.events.send(SessionEvent::Status(status));
    }

    fn status(&self, text: &str) {
        let _ = self.events.send(SessionEvent::Status(text.to_owned()));
    }
}

/// Everything the establishment task needs, detached from the engine.
struct EstablishContext {
    generation: u64,
    deps: SessionDeps,
    setup: PeerSetup,
    gathering_timeout: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl EstablishContext {
    fn report(&self, message: AttemptMessage) {
        let _ = self.internal.send(Internal {
            generation: self.generation,
            message,
        });
    }

    async fn establish(&self) -> Result<()> {
        self.report(AttemptMessage::Stage(SessionState::RequestingMedia));
        let mut local = self
            .deps
            .capture
            .acquire()
            .await
            .map_err(SessionError::Capture)?;

        self.report(AttemptMessage::Stage(SessionState::Negotiating));
        let link = self
            .deps
            .transport
            .open(&self.setup, &mut local, self.events.clone())
            .await?;
        self.report(AttemptMessage::LinkOpened {
            link: Arc::clone(&link),
            local,
        });

        link.create_offer().await?;
        if tokio::time::timeout(self.gathering_timeout, link.wait_gathering_complete())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.gathering_timeout.as_millis() as u64,
                "ICE gathering timed out; proceeding with the candidates so far"
            );
        }
        let offer = link.local_description().await?;

        self.report(AttemptMessage::Stage(SessionState::Connecting));
        let answer = self.deps.signaling.exchange(offer).await?;
        link.apply_answer(answer).await?;
        self.report(AttemptMessage::Negotiated);
        Ok(())
    }
}
