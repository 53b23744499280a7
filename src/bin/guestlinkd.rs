use anyhow::{Context, Result};
use clap::Parser;
use std::sync::{mpsc, Arc};
use tracing_subscriber::EnvFilter;

use guestlink::cli::DaemonOpts;
use guestlink::http::{DirectoryStore, NoUploads, StatusRouter, UploadStore};
use guestlink::observer::{JsonlObserver, MultiObserver, Observer, TracingObserver};
use guestlink::{Agent, Config};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.log_filter())),
        )
        .init();

    let mut config = Config::load(&opts.config)?;
    opts.apply(&mut config);

    let observer: Arc<dyn Observer> = match &opts.event_log {
        Some(path) => {
            let jsonl = JsonlObserver::new(path)
                .with_context(|| format!("Failed to open event log: {}", path.display()))?;
            Arc::new(MultiObserver::new(vec![
                Arc::new(TracingObserver),
                Arc::new(jsonl),
            ]))
        }
        None => Arc::new(TracingObserver),
    };

    let store: Arc<dyn UploadStore> = match &config.upload_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create upload dir: {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), "uploads enabled");
            Arc::new(DirectoryStore::new(dir))
        }
        None => Arc::new(NoUploads),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let router = Arc::new(StatusRouter::new(config.version.clone()));
    let mut agent = Agent::new(config, router, store, observer);
    agent
        .start(rt.handle())
        .context("Failed to start guest services")?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install signal handler")?;

    let _ = rx.recv();
    tracing::info!("shutting down");
    agent.stop();
    rt.shutdown_timeout(std::time::Duration::from_secs(2));
    Ok(())
}
