//! Frame loop task for the viseme player.
//!
//! [`LipSyncDriver::spawn`] moves a [`VisemePlayer`] onto its own task and
//! returns a cloneable [`LipSyncHandle`]. Frames keep flowing while the
//! session awaits network I/O.

use super::clock::AudioProgress;
use super::player::{ResponseId, VisemePlayer, VisemeSink};
use super::schedule::VisemeSequence;
use super::VisemeFrame;
use crate::config::LipSyncConfig;
use crate::error::{Result, SessionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

enum LipSyncCommand {
    Queue {
        id: ResponseId,
        sequence: VisemeSequence,
    },
    Start(ResponseId),
    StartAfter {
        id: ResponseId,
        delay: Duration,
    },
    Stop,
    Hint(VisemeFrame),
    AttachAudio(Option<Arc<dyn AudioProgress>>),
    Snapshot(oneshot::Sender<LipSyncSnapshot>),
}

/// Point-in-time view of the player, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct LipSyncSnapshot {
    pub active: Option<ResponseId>,
    pub pending: usize,
    pub deferred_starts: usize,
    pub last_emitted: Option<VisemeFrame>,
}

/// Control surface for a running lip-sync task.
///
/// Every method except [`snapshot`](Self::snapshot) enqueues and returns
/// immediately.
#[derive(Clone)]
pub struct LipSyncHandle {
    tx: mpsc::UnboundedSender<LipSyncCommand>,
}

impl LipSyncHandle {
    pub fn queue(&self, id: ResponseId, sequence: VisemeSequence) {
        self.send(LipSyncCommand::Queue { id, sequence });
    }

    pub fn start_for_response(&self, id: ResponseId) {
        self.send(LipSyncCommand::Start(id));
    }

    /// Start `id` once `delay` has passed, unless a stop intervenes.
    pub fn schedule_start_after(&self, id: ResponseId, delay: Duration) {
        self.send(LipSyncCommand::StartAfter { id, delay });
    }

    pub fn stop(&self) {
        self.send(LipSyncCommand::Stop);
    }

    pub fn hint(&self, frame: VisemeFrame) {
        self.send(LipSyncCommand::Hint(frame));
    }

    pub fn attach_audio(&self, audio: Option<Arc<dyn AudioProgress>>) {
        self.send(LipSyncCommand::AttachAudio(audio));
    }

    pub async fn snapshot(&self) -> Result<LipSyncSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LipSyncCommand::Snapshot(reply_tx))
            .map_err(|_| SessionError::Channel("lip-sync task has stopped".to_owned()))?;
        reply_rx
            .await
            .map_err(|e| SessionError::Channel(format!("lip-sync snapshot dropped: {e}")))
    }

    fn send(&self, command: LipSyncCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("lip-sync task has stopped; command dropped");
        }
    }
}

pub struct LipSyncDriver;

impl LipSyncDriver {
    /// Spawn the frame loop. It runs until `cancel` fires or every handle is
    /// dropped, and emits silence on the way out.
    pub fn spawn(
        config: &LipSyncConfig,
        sink: impl VisemeSink + 'static,
        cancel: CancellationToken,
    ) -> (LipSyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let player = VisemePlayer::new(config, Box::new(sink));
        let frame_interval = Duration::from_millis(config.frame_interval_ms.max(1));
        let task = tokio::spawn(run(player, rx, frame_interval, cancel));
        (LipSyncHandle { tx }, task)
    }
}

async fn run(
    mut player: VisemePlayer,
    mut rx: mpsc::UnboundedReceiver<LipSyncCommand>,
    frame_interval: Duration,
    cancel: CancellationToken,
) {
    let mut frames = tokio::time::interval(frame_interval);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deferred: Vec<(Instant, ResponseId)> = Vec::new();

    loop {
        let next_deferred = deferred.iter().map(|(at, _)| *at).min();
        let playing = player.is_playing();

        tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => {
                let Some(command) = command else { break };
                handle_command(&mut player, &mut deferred, command);
            }
            _ = frames.tick(), if playing => {
                player.tick(Instant::now());
            }
            _ = tokio::time::sleep_until(next_deferred.unwrap_or_else(Instant::now)), if next_deferred.is_some() => {
                let now = Instant::now();
                let (due, later): (Vec<_>, Vec<_>) =
                    deferred.drain(..).partition(|(at, _)| *at <= now);
                deferred = later;
                for (_, id) in due {
                    start(&mut player, &id, now);
                }
            }
        }
    }

    player.stop();
    tracing::debug!("lip-sync driver exited");
}

fn handle_command(
    player: &mut VisemePlayer,
    deferred: &mut Vec<(Instant, ResponseId)>,
    command: LipSyncCommand,
) {
    let now = Instant::now();
    match command {
        LipSyncCommand::Queue { id, sequence } => {
            if player.queue_sequence(id, sequence, now) {
                player.tick(now);
            }
        }
        LipSyncCommand::Start(id) => start(player, &id, now),
        LipSyncCommand::StartAfter { id, delay } => {
            deferred.retain(|(_, pending)| pending != &id);
            deferred.push((now + delay, id));
        }
        LipSyncCommand::Stop => {
            deferred.clear();
            player.stop();
        }
        LipSyncCommand::Hint(frame) => player.emit_hint(frame),
        LipSyncCommand::AttachAudio(audio) => player.attach_audio(audio),
        LipSyncCommand::Snapshot(reply) => {
            let _ = reply.send(LipSyncSnapshot {
                active: player.active_response().cloned(),
                pending: player.pending_len(),
                deferred_starts: deferred.len(),
                last_emitted: player.last_emitted(),
            });
        }
    }
}

fn start(player: &mut VisemePlayer, id: &ResponseId, now: Instant) {
    if player.start_for_response(id, now) {
        player.tick(now);
    }
}
