// splitfile: insert and fetch split files against a directory block store.

mod config;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use splitfile_core::{
    BackgroundHealer, BlockKey, CancelHandle, CodecRegistry, EventSink, Healer, ProgressEvent,
    SplitFileFetcher, SplitFileInserter, TerminalState,
};
use tracing_subscriber::EnvFilter;

use crate::store::DirectoryStore;

#[derive(Parser, Debug)]
#[command(name = "splitfile", version, about = "Insert and fetch FEC-coded split files")]
struct Cli {
    /// Block store directory (overrides config and SPLITFILE_STORE_DIR).
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert a file and print its CHK address.
    Insert { path: PathBuf },
    /// Fetch the file at a CHK address into `out`.
    Fetch {
        address: BlockKey,
        out: PathBuf,
        /// Verify every fetched and decoded block against its key.
        #[arg(long)]
        paranoid: bool,
        /// Visit segments in random order.
        #[arg(long)]
        random_segs: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load();
    if let Some(store) = cli.store {
        cfg.store_dir = store;
    }
    let store = DirectoryStore::open(&cfg.store_dir)
        .with_context(|| format!("opening block store {}", cfg.store_dir.display()))?;
    tracing::debug!(store = %store.root().display(), "block store ready");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Insert { path } => {
                let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                let inserter = SplitFileInserter::new(
                    data,
                    cfg.insert,
                    &CodecRegistry::with_defaults(),
                    progress_sink(),
                )?;
                let cancel = inserter.cancel_handle();
                let result = run_cancellable(cancel, move || inserter.execute(&store)).await?;
                println!("{}", result.address);
                Ok(())
            }
            Command::Fetch {
                address,
                out,
                paranoid,
                random_segs,
            } => {
                let mut request = cfg.request;
                request.paranoid |= paranoid;
                request.random_segs |= random_segs;
                let file = std::fs::File::create(&out)
                    .with_context(|| format!("creating {}", out.display()))?;
                let healer = cfg.background_heal.then(|| {
                    Arc::new(BackgroundHealer::spawn(
                        Arc::new(store.clone()),
                        cfg.healer.clone(),
                        EventSink::none(),
                    ))
                });
                let mut fetcher = SplitFileFetcher::new(
                    address,
                    std::io::BufWriter::new(file),
                    request,
                    CodecRegistry::with_defaults(),
                    progress_sink(),
                );
                if let Some(h) = &healer {
                    fetcher = fetcher.with_healer(h.clone() as Arc<dyn Healer>);
                }
                let cancel = fetcher.cancel_handle();
                let outcome = run_cancellable(cancel, move || fetcher.execute(&store)).await;
                if let Some(h) = healer.and_then(|h| Arc::try_unwrap(h).ok()) {
                    let stats = tokio::task::spawn_blocking(move || h.shutdown()).await?;
                    tracing::info!(?stats, "background healing finished");
                }
                let result = match outcome {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = std::fs::remove_file(&out);
                        return Err(e);
                    }
                };
                let mut writer = result.output;
                std::io::Write::flush(&mut writer)?;
                tracing::info!(
                    bytes = result.manifest.file_length,
                    segments = result.stats.segments_decoded,
                    healed = result.stats.healed + result.stats.heal_queued,
                    "fetched {}",
                    out.display()
                );
                Ok(())
            }
        }
    })
}

/// Run a blocking pipeline on the blocking pool; a shutdown signal cancels it and waits for it to settle.
async fn run_cancellable<T, E>(
    cancel: CancelHandle,
    job: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> anyhow::Result<T>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut task = tokio::task::spawn_blocking(job);
    tokio::select! {
        joined = &mut task => Ok(joined??),
        signal = shutdown_signal() => {
            signal?;
            tracing::warn!("shutdown requested, cancelling");
            cancel.cancel();
            Ok(task.await??)
        }
    }
}

fn progress_sink() -> EventSink {
    EventSink::new(|event| match event {
        ProgressEvent::SegmentFinished { op, segment, .. } => {
            tracing::info!(?op, segment, "segment finished")
        }
        ProgressEvent::HealingStarted { segment, blocks, .. } => {
            tracing::info!(segment, blocks, "healing")
        }
        ProgressEvent::BlockRequeued {
            segment,
            kind,
            position,
            retry_count,
            reason,
            ..
        } => tracing::debug!(segment, ?kind, position, retry_count, %reason, "block retried"),
        ProgressEvent::Finished {
            state: TerminalState::Done,
            ..
        } => tracing::debug!("transfer done"),
        ProgressEvent::Finished { state, cause, .. } => {
            tracing::warn!(?state, cause = cause.as_deref().unwrap_or(""), "transfer ended")
        }
        _ => {}
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
