//! Session engine lifecycle against scripted transport doubles.

use crate::helpers::{
    FakeCapture, FakeSignaling, FakeTransport, LinkScript, drain_events, settle, spawn_engine,
    test_config, wait_for_state,
};
use parley::SessionEvent;
use parley::error::CaptureFailure;
use parley::session::{FailureReason, PeerState, SessionState, TransportEvent};
use parley::viseme::VisemeFrame;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn message_types(sent: &[String]) -> Vec<String> {
    sent.iter()
        .map(|m| {
            let v: serde_json::Value = serde_json::from_str(m).unwrap();
            v["type"].as_str().unwrap().to_owned()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn start_configures_session_and_requests_greeting() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;
    settle().await;

    let link = h.transport.link(0);
    let sent = link.sent();
    assert_eq!(
        message_types(&sent),
        vec!["session.update".to_owned(), "response.create".to_owned()]
    );

    let update: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(update["session"]["voice"], "sage");
    assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");
    let instructions = update["session"]["instructions"].as_str().unwrap();
    assert!(instructions.ends_with(parley::persona::EMBODY_SUFFIX));

    let greeting: serde_json::Value = serde_json::from_str(&sent[1]).unwrap();
    assert_eq!(
        greeting["response"]["instructions"],
        "Give a one-sentence spoken greeting to start the conversation."
    );
    assert_eq!(h.signaling.offers.lock().unwrap().len(), 1);
    assert!(link.answer.lock().unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn stalled_gathering_sends_the_offer_after_the_timeout() {
    let config = test_config();
    let gathering = Duration::from_millis(config.session.ice_gathering_timeout_ms);
    let h = spawn_engine(
        config,
        FakeCapture::default(),
        FakeTransport::new([LinkScript::StallGathering], LinkScript::Connect),
        FakeSignaling::default(),
    );
    let started = tokio::time::Instant::now();
    h.handle.start().unwrap();

    tokio::time::sleep(gathering - Duration::from_millis(100)).await;
    assert_eq!(h.handle.state(), SessionState::Negotiating);
    assert!(h.signaling.offers.lock().unwrap().is_empty());

    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;
    let offered_at = h.signaling.offered_at.lock().unwrap().clone();
    assert_eq!(offered_at.len(), 1);
    assert!(offered_at[0] - started >= gathering);
    assert_eq!(h.transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn start_walks_through_establishment_states() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    let mut events = h.handle.subscribe();
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    let states: Vec<SessionState> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::State(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::RequestingMedia,
            SessionState::Negotiating,
            SessionState::Connecting,
            SessionState::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn capture_failure_is_terminal_and_not_retried() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::failing(CaptureFailure::PermissionDenied),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    let state = wait_for_state(&h.handle, |s| matches!(s, SessionState::Failed(_))).await;

    assert_eq!(
        state,
        SessionState::Failed(FailureReason::Capture(
            CaptureFailure::PermissionDenied.user_message()
        ))
    );
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.capture.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn signaling_failure_before_first_connect_fails_without_retry() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::failing(1),
    );
    h.handle.start().unwrap();
    let state = wait_for_state(&h.handle, |s| matches!(s, SessionState::Failed(_))).await;

    match state {
        SessionState::Failed(FailureReason::Signaling(detail)) => {
            assert!(detail.contains("500"), "{detail}");
        }
        other => panic!("unexpected state {other:?}"),
    }
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.opened(), 1);
    assert!(h.transport.link(0).is_closed());
}

#[tokio::test(start_paused = true)]
async fn failed_reconnects_back_off_linearly_then_give_up() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::new([LinkScript::Connect], LinkScript::FailOpen),
        FakeSignaling::default(),
    );
    let mut events = h.handle.subscribe();
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport
        .link(0)
        .emit(TransportEvent::PeerState(PeerState::Failed));
    let state = wait_for_state(&h.handle, |s| matches!(s, SessionState::Failed(_))).await;

    assert_eq!(
        state,
        SessionState::Failed(FailureReason::ReconnectExhausted { attempts: 3 })
    );
    assert_eq!(h.transport.opened(), 3);
    assert!(h.transport.link(0).is_closed());

    let scheduled: Vec<(u32, u32, Duration)> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Reconnecting {
                attempt,
                max,
                delay,
            } => Some((attempt, max, delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        scheduled,
        vec![
            (1, 3, Duration::from_secs(2)),
            (2, 3, Duration::from_secs(4)),
        ]
    );
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.opened(), 3);
}

#[tokio::test(start_paused = true)]
async fn three_consecutive_disconnects_end_the_session() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport
        .link(0)
        .emit(TransportEvent::PeerState(PeerState::Disconnected));
    wait_for_state(&h.handle, |s| *s == SessionState::Reconnecting { attempt: 1 }).await;
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport
        .link(1)
        .emit(TransportEvent::PeerState(PeerState::Disconnected));
    wait_for_state(&h.handle, |s| *s == SessionState::Reconnecting { attempt: 2 }).await;
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport
        .link(2)
        .emit(TransportEvent::PeerState(PeerState::Disconnected));
    let state = wait_for_state(&h.handle, |s| matches!(s, SessionState::Failed(_))).await;

    assert_eq!(
        state,
        SessionState::Failed(FailureReason::ReconnectExhausted { attempts: 3 })
    );
    settle().await;
    assert!(h.transport.link(2).is_closed());
    assert!(h.capture.last_released());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.opened(), 3);
}

#[tokio::test(start_paused = true)]
async fn stable_connection_clears_the_loss_count() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport
        .link(0)
        .emit(TransportEvent::PeerState(PeerState::Disconnected));
    wait_for_state(&h.handle, |s| *s == SessionState::Reconnecting { attempt: 1 }).await;
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    let stable = Duration::from_millis(test_config().session.reconnect_stable_ms);
    tokio::time::sleep(stable + Duration::from_secs(1)).await;

    h.transport
        .link(1)
        .emit(TransportEvent::PeerState(PeerState::Disconnected));
    wait_for_state(&h.handle, |s| matches!(s, SessionState::Reconnecting { .. })).await;
    assert_eq!(h.handle.state(), SessionState::Reconnecting { attempt: 1 });
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_restores_the_session() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport
        .link(0)
        .emit(TransportEvent::PeerState(PeerState::Disconnected));
    wait_for_state(&h.handle, |s| *s == SessionState::Reconnecting { attempt: 1 }).await;
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;
    settle().await;

    assert_eq!(h.transport.opened(), 2);
    assert_eq!(h.capture.acquired.load(Ordering::SeqCst), 2);
    // The fresh link is configured from scratch.
    assert_eq!(
        message_types(&h.transport.link(1).sent()),
        vec!["session.update".to_owned(), "response.create".to_owned()]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_releases_resources_and_returns_to_idle() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;
    assert!(!h.capture.last_released());

    h.handle.stop().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Idle).await;
    settle().await;

    assert!(h.transport.link(0).is_closed());
    assert!(h.capture.last_released());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn text_is_only_sent_while_the_channel_is_open() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.send_text("too early").unwrap();
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.handle.send_text("  hello there  ").unwrap();
    settle().await;

    let sent = h.transport.link(0).sent();
    assert_eq!(sent.len(), 3);
    let text: serde_json::Value = serde_json::from_str(&sent[2]).unwrap();
    let instructions = text["response"]["instructions"].as_str().unwrap();
    assert!(instructions.ends_with("User says: \"hello there\""));
    assert_eq!(text["response"]["conversation"], "auto");
    assert!(!sent.iter().any(|m| m.contains("too early")));
}

#[tokio::test(start_paused = true)]
async fn persona_change_is_announced_to_the_model() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.handle.set_persona(parley::Persona::Detective).unwrap();
    h.handle.set_scenario("   ").unwrap();
    settle().await;

    let sent = h.transport.link(0).sent();
    assert_eq!(sent.len(), 4);
    assert!(sent[2].contains("acknowledge the character change"));
    assert!(sent[3].contains("acknowledge the new scenario"));
    assert!(!sent[3].contains("SCENARIO:"));
}

#[tokio::test(start_paused = true)]
async fn mute_survives_until_the_track_is_opened() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.set_muted(true).unwrap();
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    let feed = h.capture.last_feed();
    let mut track = h.transport.tracks.lock().unwrap().pop().unwrap();
    feed.push(vec![0.5; 8]);
    let chunk = track.recv().await.unwrap();
    assert!(chunk.samples.iter().all(|s| *s == 0.0));

    h.handle.set_muted(false).unwrap();
    settle().await;
    feed.push(vec![0.5; 8]);
    let chunk = track.recv().await.unwrap();
    assert!(chunk.samples.iter().all(|s| *s == 0.5));
}

#[tokio::test(start_paused = true)]
async fn remote_track_drives_output_and_events() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    let mut events = h.handle.subscribe();
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    let (_tx, rx) = tokio::sync::mpsc::channel(4);
    h.transport.link(0).emit(TransportEvent::RemoteTrack(rx));
    settle().await;
    assert_eq!(h.output.attached.load(Ordering::SeqCst), 1);

    h.handle.stop().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Idle).await;
    assert_eq!(h.output.detached.load(Ordering::SeqCst), 1);

    let audio: Vec<bool> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::RemoteAudio(on) => Some(on),
            _ => None,
        })
        .collect();
    assert_eq!(audio, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn transcript_animates_and_interruption_silences() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    let link = h.transport.link(0);
    link.emit(TransportEvent::ChannelMessage(
        r#"{"type":"response.audio_transcript.done","response_id":"resp_1","transcript":"Bob"}"#
            .to_owned(),
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = h.handle.lipsync().snapshot().await.unwrap();
    assert_eq!(snapshot.active.as_ref().map(|id| id.as_str()), Some("resp_1"));
    assert!(h.frames.lock().unwrap().iter().any(|f| !f.viseme.is_silence()));

    link.emit(TransportEvent::ChannelMessage(
        r#"{"type":"output_audio_buffer.cleared"}"#.to_owned(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = h.handle.lipsync().snapshot().await.unwrap();
    assert_eq!(snapshot.active, None);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.last_emitted, Some(VisemeFrame::SILENCE));
    assert_eq!(h.frames.lock().unwrap().last(), Some(&VisemeFrame::SILENCE));
}

#[tokio::test(start_paused = true)]
async fn service_errors_are_reported_without_ending_the_session() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    let mut events = h.handle.subscribe();
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport.link(0).emit(TransportEvent::ChannelMessage(
        r#"{"type":"error","error":{"message":"rate limited"}}"#.to_owned(),
    ));
    h.transport
        .link(0)
        .emit(TransportEvent::ChannelMessage("not json".to_owned()));
    settle().await;

    let collected = drain_events(&mut events);
    assert!(collected.contains(&SessionEvent::ServiceError("rate limited".to_owned())));
    assert!(collected.contains(&SessionEvent::Status("AI Error".to_owned())));
    assert_eq!(h.handle.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn clean_close_while_connected_is_a_disconnect() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.transport.link(0).emit(TransportEvent::ChannelClosed);
    wait_for_state(&h.handle, |s| *s == SessionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_supersedes_a_stalled_attempt() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::new([LinkScript::Silent], LinkScript::Connect),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connecting).await;
    settle().await;

    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    assert!(h.transport.link(0).is_closed());
    // Events from the superseded link are ignored.
    h.transport
        .link(0)
        .emit(TransportEvent::PeerState(PeerState::Failed));
    settle().await;
    assert_eq!(h.handle.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_the_engine() {
    let h = spawn_engine(
        test_config(),
        FakeCapture::default(),
        FakeTransport::connecting(),
        FakeSignaling::default(),
    );
    h.handle.start().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Connected).await;

    h.handle.shutdown().unwrap();
    wait_for_state(&h.handle, |s| *s == SessionState::Idle).await;
    settle().await;
    assert!(h.transport.link(0).is_closed());
    assert!(h.cancel.is_cancelled());
}
