//! Engine configuration persistence.

use parley::config::EngineConfig;
use parley::error::SessionError;
use parley::persona::Persona;

#[test]
fn save_and_reload_preserves_changes() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("nested").join("config.toml");

    let mut config = EngineConfig::default();
    config.session.persona = Persona::StrictManager;
    config.session.scenario = Some("Quarterly review gone wrong".to_owned());
    config.session.max_reconnect_attempts = 5;
    config.session.transcript_start_fallback_ms = None;
    config.lipsync.trailing_buffer_ms = 250;
    config.turn_detection.silence_duration_ms = 900;
    config.save_to_file(&path).unwrap();

    let loaded = EngineConfig::from_file(&path).unwrap();
    assert_eq!(loaded.session.persona, Persona::StrictManager);
    assert_eq!(
        loaded.session.scenario.as_deref(),
        Some("Quarterly review gone wrong")
    );
    assert_eq!(loaded.session.max_reconnect_attempts, 5);
    assert_eq!(loaded.session.transcript_start_fallback_ms, None);
    assert_eq!(loaded.lipsync.trailing_buffer_ms, 250);
    assert_eq!(loaded.turn_detection.silence_duration_ms, 900);
    assert!(loaded.validate().is_ok());
}

#[test]
fn partial_file_fills_in_defaults() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[session]\npersona = \"detective\"\nvoice = \"verse\"\n\n[lipsync]\nmax_pending = 3\n",
    )
    .unwrap();

    let loaded = EngineConfig::from_file(&path).unwrap();
    let defaults = EngineConfig::default();
    assert_eq!(loaded.session.persona, Persona::Detective);
    assert_eq!(loaded.session.voice, "verse");
    assert_eq!(loaded.session.model, defaults.session.model);
    assert_eq!(loaded.session.greeting, defaults.session.greeting);
    assert_eq!(loaded.lipsync.max_pending, 3);
    assert_eq!(loaded.lipsync.ms_per_word, defaults.lipsync.ms_per_word);
    assert_eq!(loaded.audio.output_sample_rate, defaults.audio.output_sample_rate);
}

#[test]
fn malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[session\npersona = ").unwrap();

    let err = EngineConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, SessionError::Config(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = EngineConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, SessionError::Io(_)));
}

#[test]
fn unknown_persona_is_rejected() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[session]\npersona = \"pirate\"\n").unwrap();

    assert!(EngineConfig::from_file(&path).is_err());
}
