//! Parlance terminal front end.
//!
//! Wires the recognition engine to stdout: interim text overwrites the
//! current line, definite utterances are committed as full lines. Ctrl+C
//! stops the recording and prints the final text.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::warn;

use parlance_core::{
    Collaborators, ErrorKind, OrchestratorConfig, RecognitionOrchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "parlance", about = "Streaming dictation from the terminal")]
struct Args {
    /// Recognizer WebSocket endpoint.
    #[arg(long)]
    endpoint: Option<String>,

    /// Recognizer access key (or PARLANCE_ACCESS_KEY).
    #[arg(long, env = "PARLANCE_ACCESS_KEY", hide_env_values = true)]
    access_key: String,

    /// Recognizer app key (or PARLANCE_APP_KEY).
    #[arg(long, env = "PARLANCE_APP_KEY", hide_env_values = true)]
    app_key: String,

    /// Recognition language tag.
    #[arg(long, default_value = "zh-CN")]
    language: String,

    /// Preferred input device name (see --list-devices).
    #[arg(long)]
    device: Option<String>,

    /// List input devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Disable the voice-activity gate (stream everything).
    #[arg(long)]
    no_vad: bool,

    /// Per-session duration limit in seconds (0 disables the watchdog).
    #[arg(long, default_value_t = 600)]
    max_session_secs: u64,

    /// Account id recordings are billed to.
    #[arg(long, default_value = "local")]
    account: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlance=info,parlance_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = OrchestratorConfig::default();
    if let Some(endpoint) = args.endpoint {
        config.session.endpoint = endpoint;
    }
    config.session.access_key = args.access_key;
    config.session.app_key = args.app_key;
    config.session.language = args.language;
    config.gate.enabled = !args.no_vad;
    config.audio.device = args.device;
    config.max_connection_duration_secs = args.max_session_secs;

    let orchestrator = Arc::new(RecognitionOrchestrator::new(
        config,
        Collaborators::default(),
    ));

    if args.list_devices {
        for device in orchestrator.list_input_devices() {
            let marker = if device.is_default { "*" } else { " " };
            println!("{marker} {}", device.name);
        }
        return Ok(());
    }

    let mut text_rx = orchestrator.subscribe_text();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Ok(event) = text_rx.recv().await {
            if event.is_definite {
                let _ = writeln!(stdout, "\r\x1b[2K{}", event.text);
            } else {
                let _ = write!(stdout, "\r\x1b[2K{}", event.text);
            }
            let _ = stdout.flush();
        }
    });

    let mut error_rx = orchestrator.subscribe_errors();
    tokio::spawn(async move {
        while let Ok(event) = error_rx.recv().await {
            match event.kind {
                ErrorKind::Quota => warn!("quota: {} — consider upgrading", event.message),
                ErrorKind::SessionTimeout => warn!("session timeout: {}", event.message),
                _ => warn!("{:?}: {}", event.kind, event.message),
            }
        }
    });

    orchestrator
        .start_recording(&args.account)
        .context("failed to start recording")?;
    eprintln!("recording — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    let final_text = orchestrator.stop_recording();
    orchestrator.shutdown(Duration::from_secs(5)).await;
    printer.abort();

    println!("\r\x1b[2K{final_text}");
    Ok(())
}
