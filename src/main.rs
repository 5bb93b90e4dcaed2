mod cli;
mod config;
mod error;
mod protocol;
mod screen;
mod server;
mod session;
mod stream;

use anyhow::{Context, Result};
use cli::{Cli, Commands, ServeArgs};
use screen::capture::{list_monitors, ScrapOpener};
use session::SessionContext;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("screencast=info,webrtc=warn")),
        )
        .init();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::Serve(args) => serve(args).await?,
        Commands::Monitors => print_monitors()?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config();
    if config.password.is_insecure_default() {
        warn!("⚠️  Using the default password. Set REMOTE_PASSWORD or --password before exposing this server.");
    }

    info!(
        monitor = config.monitor,
        fps = config.limits.default_fps,
        max_width = config.limits.max_width,
        max_height = config.limits.max_height,
        quality = config.limits.default_quality,
        max_sessions = config.max_sessions,
        "🚀 Starting screen server"
    );

    let opener = Arc::new(ScrapOpener::new(config.monitor));
    let ctx = Arc::new(SessionContext::new(config, opener));
    server::start_server(ctx).await
}

fn print_monitors() -> Result<()> {
    let monitors = list_monitors().context("Failed to enumerate monitors")?;
    if monitors.is_empty() {
        println!("No monitors found.");
        return Ok(());
    }
    println!("📺 Monitors:");
    for m in monitors {
        println!("  [{}] {}x{}", m.index, m.width, m.height);
    }
    Ok(())
}
