//! Headless control service: telemetry in, events out, until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use nightshade_control::{
    init_logging, ControlEvent, ControlSettings, EventSeverity, ObservatoryService,
};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Nightshade observatory device control service")]
struct Args {
    /// JSON settings file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for daily rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn log_event(event: &ControlEvent) {
    let device = event.device_id.as_deref().unwrap_or("-");
    match event.severity {
        EventSeverity::Info => info!("[{:?}] {} {:?}", event.category, device, event.payload),
        EventSeverity::Warning => warn!("[{:?}] {} {:?}", event.category, device, event.payload),
        EventSeverity::Error => error!("[{:?}] {} {:?}", event.category, device, event.payload),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_dir.as_deref());

    let settings = ControlSettings::resolve(args.config.as_deref())
        .context("failed to load control settings")?;
    let service = ObservatoryService::new(settings).context("failed to create control service")?;

    let mut events = service.events().subscribe();
    service.start().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => service.events().record_dropped(skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    service.shutdown().await;
    Ok(())
}
