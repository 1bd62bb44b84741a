//! Plantsync - manufacturing event bridge

use anyhow::{Context, Result};
use clap::Parser;
use plantsync_bridge::ingest::IngestError;
use plantsync_bridge::{input, Bridge, Config};
use plantsync_common::logging::{init_logging, LogConfig, LogLevel};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "plantsync")]
#[command(author, version, about = "Manufacturing event bridge")]
struct Cli {
    /// Newline-delimited JSON messages to ingest (`-` for stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %format!("{err:#}"), "Bridge failed");
        eprintln!("plantsync: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // LOG_* variables take precedence, --verbose overrides the level
    let mut log_config = LogConfig::builder()
        .log_file_prefix("plantsync")
        .filter_directives("sqlx=warn")
        .build()
        .with_env_overrides()
        .context("Invalid logging configuration")?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }

    let _log_guard = init_logging(&log_config)?;

    info!("Starting plantsync bridge");

    let config = Config::load().context("Failed to load configuration")?;
    info!(
        queue_path = %config.queue.path.display(),
        "Configuration loaded"
    );

    let bridge = Bridge::start(&config).await.context("Failed to start bridge")?;
    let token = bridge.shutdown_token();

    let feeder = cli.input.map(|path| {
        let ingest = bridge.ingest().clone();
        let token = token.clone();
        tokio::spawn(async move {
            let result = if path.as_os_str() == "-" {
                feed(BufReader::new(tokio::io::stdin()), &ingest, &token).await
            } else {
                match tokio::fs::File::open(&path).await {
                    Ok(file) => feed(BufReader::new(file), &ingest, &token).await,
                    Err(err) => Err(anyhow::Error::new(err)
                        .context(format!("Failed to open input {}", path.display()))),
                }
            };
            if result.is_err() {
                token.cancel();
            }
            result
        })
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = bridge.stopped() => {
            warn!("Bridge halted, shutting down");
        }
    }

    token.cancel();
    let fed = match feeder {
        Some(feeder) => feeder.await.map_err(anyhow::Error::from).and_then(|result| result),
        None => Ok(()),
    };

    bridge.shutdown().await?;
    fed?;
    info!("Bridge shut down gracefully");

    Ok(())
}

/// Submit every input line until the input ends or shutdown begins.
async fn feed<R>(
    reader: R,
    ingest: &plantsync_bridge::ingest::IngestAdapter,
    token: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut submitted = 0u64;

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read input")?,
        };
        let Some(line) = line else {
            break;
        };

        let raw = match input::parse_line(&line) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "Skipping input line");
                continue;
            }
        };

        match ingest.submit(raw).await {
            Ok(_) => submitted += 1,
            Err(IngestError::ShuttingDown) => break,
            Err(err) => return Err(err).context("Failed to persist inbound message"),
        }
    }

    info!(submitted, "Input consumed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
