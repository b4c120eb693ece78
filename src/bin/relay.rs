//! Voice Relay
//!
//! Streams the microphone to a peer and plays the peer's audio, over one TCP
//! connection. Run one side with `--listen PORT` and the other with
//! `--connect HOST:PORT`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use voice_relay::{
    audio::device::{format_device_table, list_devices},
    cli::Cli,
    logging, network, RelayConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.debug, cli.log.as_deref()) {
        eprintln!("error: {}", e);
        return ExitCode::from(2);
    }

    if cli.list_devices {
        print!("{}", format_device_table(&list_devices()));
        return ExitCode::SUCCESS;
    }

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let fatal = e
                .downcast_ref::<voice_relay::Error>()
                .map_or(false, voice_relay::Error::is_fatal);
            tracing::error!(fatal, "{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = cli.resolve().context("invalid configuration")?;
    log_startup(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for interrupt signal");
                // A dropped sender reads as shutdown
                std::future::pending::<()>().await;
            }
        }
    });

    network::run(Arc::new(config), shutdown_rx)
        .await
        .context("relay stopped")?;

    tracing::info!("relay stopped");
    Ok(())
}

fn log_startup(config: &RelayConfig) {
    tracing::info!(role = %config.role, "starting voice relay");
    tracing::info!(
        input = config.audio.input_device.as_deref().unwrap_or("default"),
        output = config.audio.output_device.as_deref().unwrap_or("default"),
        sample_rate = config.audio.sample_rate,
        mic_channels = config.audio.mic_channels,
        speaker_channels = config.audio.speaker_channels,
        "audio configuration"
    );
    tracing::debug!(?config, "effective configuration");
}
