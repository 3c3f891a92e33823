//! navlive command line client

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use navlive::config::parse_source;
use navlive::gemini::GeminiConnector;
use navlive::reconnect::{run_with_reconnect, Backoff};
use navlive::{Config, Devices, SessionHandle, SessionState};

#[derive(Parser)]
#[command(name = "navlive", version, about = "Live spoken scene description and navigation help")]
struct Cli {
    /// Prebuilt voice for the assistant (overrides NAVLIVE_VOICE)
    #[arg(long)]
    voice: Option<String>,

    /// Visual source: camera, screen or none
    #[arg(long)]
    source: Option<String>,

    /// Start in navigation mode
    #[arg(long)]
    navigation: bool,

    /// Do not open the microphone
    #[arg(long)]
    no_mic: bool,

    /// Reconnect with backoff when the connection drops
    #[arg(long)]
    reconnect: bool,
}

fn devices(config: &Config) -> Devices {
    let connector = Arc::new(GeminiConnector::from_api_key(&config.api_key));

    #[cfg(feature = "pulse")]
    let devices = Devices::new(
        connector,
        Arc::new(navlive::devices::pulse::PulseSpeaker {
            sample_rate: config.tuning.output_sample_rate,
            block: config.tuning.output_block,
            device: None,
        }),
    )
    .with_mic(Arc::new(navlive::devices::pulse::PulseMic::default()));

    #[cfg(not(feature = "pulse"))]
    let devices = {
        warn!("Built without the pulse feature: no microphone, speech is timed but silent");
        Devices::new(
            connector,
            Arc::new(navlive::mixer::SilentOutput {
                sample_rate: config.tuning.output_sample_rate,
                block: config.tuning.output_block,
            }),
        )
    };

    #[cfg(feature = "screen")]
    let devices = devices.with_sources(Arc::new(navlive::devices::screen::ScreenSources));

    devices
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("navlive=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(voice) = cli.voice {
        config.voice = voice;
    }
    if let Some(source) = cli.source.as_deref() {
        config.source = parse_source(source)
            .ok_or_else(|| anyhow!("unknown source '{}', expected camera, screen or none", source))?;
    }
    config.navigation |= cli.navigation;
    config.use_mic &= !cli.no_mic;

    info!(
        "Starting navlive (model {}, voice {}, source {:?})",
        config.model, config.voice, config.source
    );
    let handle = SessionHandle::spawn(config.clone(), devices(&config));
    handle.start(None).await.context("Failed to start session")?;

    let reconnect = cli.reconnect.then(|| {
        tokio::spawn(run_with_reconnect(handle.clone(), None, Backoff::default()))
    });

    let mut rx = handle.subscribe();
    let mut last = rx.borrow_and_update().clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                if snapshot.status != last.status {
                    info!("Status: {}", snapshot.status);
                }
                if snapshot.transcript_len > last.transcript_len {
                    if let Some(entry) = handle.transcript().await?.last() {
                        info!("{:?}: {}", entry.role, entry.text);
                    }
                }
                if snapshot.state == SessionState::Disconnected && reconnect.is_none() {
                    warn!("Connection lost; rerun with --reconnect to retry automatically");
                    break;
                }
                last = snapshot;
            }
        }
    }

    if let Some(task) = reconnect {
        task.abort();
    }
    handle.stop().await.context("Failed to stop session")?;
    Ok(())
}
