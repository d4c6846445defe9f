//! Preview lip-sync output, offline or against a live session.
//!
//! `schedule` prints the timed viseme windows; `play` runs the frame loop in
//! real time and prints every frame change to stdout. `talk` opens a real
//! session through the configured relay until Ctrl-C. Tracing goes to stderr.

use parley::audio::{CpalMicrophone, RemoteAudioOutput};
use parley::config::EngineConfig;
use parley::session::{HttpSignaling, SessionDeps, SessionEngine, SessionState, WebRtcTransport};
use parley::viseme::{LipSyncDriver, ResponseId, UtteranceScheduler, VisemeFrame};
use parley::SessionEvent;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Args {
    command: String,
    text: String,
    duration_ms: Option<f64>,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        return Ok(None);
    };
    if matches!(command.as_str(), "help" | "--help" | "-h") {
        return Ok(None);
    }

    let mut words = Vec::new();
    let mut duration_ms = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--duration-ms" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--duration-ms requires a value"))?;
                duration_ms = Some(value.parse::<f64>()?);
            }
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config = Some(PathBuf::from(value));
            }
            _ => words.push(arg),
        }
    }

    Ok(Some(Args {
        command,
        text: words.join(" "),
        duration_ms,
        config,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info")),
        )
        .init();

    let Some(args) = parse_args()? else {
        print_usage();
        return Ok(());
    };

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => {
            let path = EngineConfig::default_config_path();
            if path.exists() {
                EngineConfig::from_file(&path)?
            } else {
                EngineConfig::default()
            }
        }
    };
    config.validate()?;

    match args.command.as_str() {
        "schedule" => print_schedule(&config, &args.text, args.duration_ms),
        "play" => play(&config, &args.text, args.duration_ms).await,
        "devices" => list_devices(),
        "talk" => talk(config).await,
        other => Err(anyhow::anyhow!(
            "unknown subcommand `{other}` (use schedule|play|talk|devices)"
        )),
    }
}

fn print_schedule(config: &EngineConfig, text: &str, duration_ms: Option<f64>) -> anyhow::Result<()> {
    let scheduler = UtteranceScheduler::new(config.lipsync.clone());
    let sequence = scheduler.schedule(text, duration_ms);
    println!("{:.0} ms, {} visemes", sequence.duration_ms(), sequence.len());
    for entry in sequence.entries() {
        println!(
            "{:>7.1} {:>7.1}  {:<4} {:<12} {:.2}",
            entry.start_ms,
            entry.end_ms,
            entry.phoneme,
            entry.viseme.as_str(),
            entry.intensity
        );
    }
    Ok(())
}

async fn play(config: &EngineConfig, text: &str, duration_ms: Option<f64>) -> anyhow::Result<()> {
    let scheduler = UtteranceScheduler::new(config.lipsync.clone());
    let sequence = scheduler.schedule(text, duration_ms);
    let total = Duration::from_millis(sequence.duration_ms().ceil() as u64)
        + Duration::from_millis(config.lipsync.trailing_buffer_ms);

    let started = tokio::time::Instant::now();
    let sink = move |frame: VisemeFrame| {
        println!(
            "{:>6} ms  {:<12} {:.2}",
            started.elapsed().as_millis(),
            frame.viseme.as_str(),
            frame.intensity
        );
    };

    let cancel = CancellationToken::new();
    let (lipsync, task) = LipSyncDriver::spawn(&config.lipsync, sink, cancel.clone());
    let id = ResponseId::synthesize();
    lipsync.queue(id.clone(), sequence);
    lipsync.start_for_response(id);

    tokio::time::sleep(total + Duration::from_millis(config.lipsync.frame_interval_ms * 2)).await;
    cancel.cancel();
    task.await?;
    Ok(())
}

async fn talk(config: EngineConfig) -> anyhow::Result<()> {
    let signaling = HttpSignaling::new(
        config.session.signaling_url.clone(),
        config.session.model.clone(),
        config.session.resolved_api_key(),
    );
    let deps = SessionDeps {
        capture: Arc::new(CpalMicrophone::new(config.audio.clone())),
        transport: Arc::new(WebRtcTransport::new()?),
        signaling: Arc::new(signaling),
        output: Some(Arc::new(RemoteAudioOutput::open(&config.audio).await?)),
    };

    let started = tokio::time::Instant::now();
    let sink = move |frame: VisemeFrame| {
        println!(
            "{:>6} ms  {:<12} {:.2}",
            started.elapsed().as_millis(),
            frame.viseme.as_str(),
            frame.intensity
        );
    };
    let cancel = CancellationToken::new();
    let (handle, task) = SessionEngine::spawn(config, deps, sink, cancel.clone());
    let mut events = handle.subscribe();
    handle.start()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Status(text)) => eprintln!("[status] {text}"),
                Ok(SessionEvent::ServiceError(message)) => eprintln!("[error] {message}"),
                Ok(SessionEvent::State(SessionState::Failed(reason))) => {
                    eprintln!("[failed] {reason}");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("skipped {n} session events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown()?;
    task.await?;
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  {name}");
    }
    println!("output devices:");
    for name in RemoteAudioOutput::list_output_devices()? {
        println!("  {name}");
    }
    Ok(())
}

fn print_usage() {
    println!(
        "usage: parley-preview <schedule|play> <text> [--duration-ms N] [--config PATH]\n       \
         parley-preview talk [--config PATH]\n       \
         parley-preview devices"
    );
}
