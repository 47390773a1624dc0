use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tracing_subscriber::EnvFilter;

use analyzer_logger::config::DEFAULT_CONFIG_FILE;
use analyzer_logger::{
    AckBuilder, BackoffConfig, FileRawMessageStore, Listener, ListenerOptions, Pipeline,
    SessionOptions, Settings, SqlObservationRepository,
};

/// Receives HL7 results from lab analyzers over MLLP, archives and stores them, and acknowledges
/// every message.
#[derive(Parser, Debug)]
#[command(name = "analyzer-logger", version)]
struct Args {
    /// Configuration file. Defaults to `analyzer-logger.toml` in the working directory, which may
    /// be absent when everything is set through `ANALYZER_*` environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overriding both `RUST_LOG` and `logging.level`.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load(path, true),
        None => Settings::load(DEFAULT_CONFIG_FILE.as_ref(), false),
    };
    let configured_level = settings.as_ref().ok().map(|s| s.logging.level.as_str());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(args.log_level.as_deref(), configured_level))
        .init();

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };

    let raw_store = FileRawMessageStore::create(&settings.raw_store.directory).await?;
    info!("Archiving raw messages to {}", raw_store.directory().display());
    let repository = SqlObservationRepository::connect_lazy(&settings.sql)?;
    info!(
        "Saving observations to {}.{}",
        settings.sql.schema, settings.sql.table
    );

    let pipeline = Pipeline::new(
        Arc::new(raw_store),
        Arc::new(repository),
        AckBuilder::from(&settings.ack),
    );
    let listener = Listener::bind(
        settings.listener.socket_addr()?,
        settings.listener.backlog,
        listener_options(&settings),
        Arc::new(pipeline),
    )?;

    listener.run_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

fn env_filter(cli_level: Option<&str>, configured_level: Option<&str>) -> EnvFilter {
    if let Some(level) = cli_level {
        return EnvFilter::new(level);
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured_level.unwrap_or("info")))
}

fn listener_options(settings: &Settings) -> ListenerOptions {
    ListenerOptions {
        session: SessionOptions {
            receive_timeout: settings.listener.receive_timeout(),
            terminator_policy: settings.framing.terminator_policy,
        },
        drain_timeout: settings.listener.drain_timeout(),
        backoff: BackoffConfig::default(),
    }
}

/// Resolves on Ctrl+C, or SIGTERM where there is one.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
