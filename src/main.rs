mod config;
mod error;
mod keys;
mod server;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use config::ServerConfig;
use keys::FileKeyRepository;
use server::Server;
use sparkproto_lib::events::LocalPublisher;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Device cloud endpoint: accepts encrypted CoAP connections from devices.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to listen on, overriding the configuration file.
    #[arg(short, long)]
    bind: Option<SocketAddr>,
    /// Directory of device public keys, overriding the configuration file.
    #[arg(short, long)]
    keys_dir: Option<PathBuf>,
    /// Server private key (PEM), overriding the configuration file.
    #[arg(short, long)]
    server_key: Option<PathBuf>,
    /// Firmware binary to flash to every device that connects.
    #[arg(short, long)]
    flash: Option<PathBuf>,
    /// Optional directory for daily rolling log files, in addition to the console.
    #[arg(short, long)]
    log_dir: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(log_dir: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false);

    let (file_layer, guard) = if let Some(ref dir) = log_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory at: {:?}", dir))?;
        let appender = tracing_appender::rolling::daily(dir, "sparkproto.log");
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv. RUST_LOG still wins.
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(dir) = log_dir {
        info!("Logging to directory: {:?}", dir);
    }

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(dir) = &cli.keys_dir {
        config.keys_dir = dir.clone();
    }
    if let Some(path) = &cli.server_key {
        config.server_key = path.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_dir.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Server failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let repository = FileKeyRepository::open(&config.keys_dir, &config.server_key)
        .with_context(|| format!("Failed to open key store at {:?}", config.keys_dir))?;

    let mut server = Server::new(config, Arc::new(repository), Arc::new(LocalPublisher::new()));
    if let Some(path) = &cli.flash {
        let firmware = std::fs::read(path).with_context(|| format!("Failed to read firmware at {:?}", path))?;
        info!("Flashing {} bytes from {:?} to every device that connects", firmware.len(), path);
        server = server.with_firmware(Bytes::from(firmware));
    }

    let server = Arc::new(server);
    let listener = server.bind().await.context("Failed to bind listener")?;
    server.serve(listener).await?;
    Ok(())
}
