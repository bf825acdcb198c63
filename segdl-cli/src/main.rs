mod error;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use segdl_engine::config::DEFAULT_BUFFER_SIZE;
use segdl_engine::store::purge_download;
use segdl_engine::{
    ChannelListener, DownloadEvent, DownloadRequest, DownloadSession, DownloaderConfig,
    FileResumeStore, HttpConnectionFactory, ResumeStore,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::error::{AppError, Result};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Resumable segmented HTTP and HLS downloader.
///
/// Interrupted downloads pick up where they stopped when the same command is run again.
#[derive(Debug, Parser)]
#[command(name = "segdl", version, about)]
struct Args {
    /// URL of the file or playlist to download
    url: String,

    /// Output file
    #[arg(short, long)]
    output: PathBuf,

    /// Treat the URL as an HLS playlist
    #[arg(long)]
    hls: bool,

    /// Number of byte-range blocks a single file is split into (1 disables splitting)
    #[arg(long, default_value_t = 4)]
    blocks: usize,

    /// Units downloaded at the same time
    #[arg(short = 'c', long, default_value_t = 4)]
    concurrency: usize,

    /// Retries per unit before it is reported as failed
    #[arg(short, long, default_value_t = 3)]
    retries: u32,

    /// Directory for resume state (defaults to `.segdl-state` next to the output)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Bytes written to disk per iteration
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Delete resume state and partial data for this download, then exit
    #[arg(long)]
    purge: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.verbose, args.quiet) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = DownloaderConfig::builder()
        .block_count(args.blocks)
        .max_concurrent_tasks(args.concurrency)
        .max_retries(args.retries)
        .buffer_size(args.buffer_size)
        .build()?;

    let connector = Arc::new(HttpConnectionFactory::new(&config)?);
    let request = DownloadRequest::new(&args.url, &args.output, connector)?
        .with_buffer_size(config.buffer_size)
        .with_max_redirects(config.max_redirects);

    let state_dir = args
        .state_dir
        .clone()
        .unwrap_or_else(|| default_state_dir(&args.output));
    let store: Arc<dyn ResumeStore> = Arc::new(FileResumeStore::new(state_dir));

    if args.purge {
        purge_download(store.as_ref(), &request).await?;
        info!(url = %args.url, "Removed saved state");
        return Ok(());
    }

    let (listener, events) = ChannelListener::new();
    let listener = Arc::new(listener);
    let session = if args.hls {
        DownloadSession::open_playlist(request, &config, store, listener).await?
    } else {
        DownloadSession::open_file(request, &config, store, listener).await?
    };
    if session.is_resumed() {
        info!("Resuming previous download");
    }

    let session = Arc::new(session);
    let reporter = tokio::spawn(report_progress(events, session.unit_count()));
    session.start()?;

    let interrupt = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping download (run again to resume)");
                session.cancel(true);
            }
        })
    };

    let report = session.wait().await;
    interrupt.abort();
    reporter.abort();

    if !report.is_success() {
        for (task, reason) in &report.failed {
            error!(%task, %reason, "Unit failed");
        }
        return Err(AppError::Incomplete {
            failed: report.failed.len(),
            cancelled: report.cancelled.len(),
        });
    }

    let bytes = session.block_so_far();
    let output = session.finish().await?;
    info!(output = %output.display(), bytes, "Download complete");
    Ok(())
}

fn default_state_dir(output: &Path) -> PathBuf {
    output
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(".segdl-state")
}

/// Logs throughput and finished units every [`PROGRESS_INTERVAL`].
async fn report_progress(mut events: UnboundedReceiver<DownloadEvent>, units: usize) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await;

    let mut total = 0u64;
    let mut since_tick = 0u64;
    let mut finished = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DownloadEvent::Progress { delta, .. }) => {
                    total += delta;
                    since_tick += delta;
                }
                Some(DownloadEvent::Complete { task }) => {
                    finished += 1;
                    debug!(%task, finished, units, "Unit complete");
                }
                Some(DownloadEvent::Retry { task }) => debug!(%task, "Unit retrying"),
                Some(_) => {}
                None => break,
            },
            _ = ticker.tick() => {
                let rate = since_tick / PROGRESS_INTERVAL.as_secs().max(1);
                info!(downloaded = total, rate_per_sec = rate, finished, units, "Progress");
                since_tick = 0;
            }
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
