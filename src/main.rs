use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferroflow::client::Client;
use ferroflow::pipeline::{self, FsImageSource, SqliteMetadataSink};
use ferroflow::providers::SqliteProvider;
use ferroflow::runtime::{ActivityRegistry, Runtime, WorkflowRegistry};
use ferroflow::trigger::DirectoryWatcher;

/// Durable image metadata pipeline host.
#[derive(Parser, Debug)]
#[command(name = "ferroflow", version, about)]
struct Args {
    /// Directory to watch for incoming image files
    #[arg(long, env = "FERROFLOW_WATCH_DIR", default_value = "./images-input")]
    watch_dir: String,

    /// SQLite database path holding workflow state and metadata rows
    #[arg(long, env = "FERROFLOW_DB", default_value = "./ferroflow.db")]
    db: String,

    /// Directory poll interval in milliseconds
    #[arg(long, env = "FERROFLOW_POLL_MS", default_value_t = 1000)]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let provider = Arc::new(
        SqliteProvider::new(&args.db)
            .await
            .with_context(|| format!("opening workflow store at {}", args.db))?,
    );
    let sink = Arc::new(
        SqliteMetadataSink::new(&args.db)
            .await
            .map_err(anyhow::Error::msg)
            .context("opening metadata sink")?,
    );
    let source = Arc::new(FsImageSource::new(&args.watch_dir));

    let activities =
        pipeline::register_activities(ActivityRegistry::builder(), source, sink).build();
    let workflows = pipeline::register_workflows(WorkflowRegistry::builder()).build();

    let runtime = Runtime::start_with_store(provider.clone(), activities, workflows)
        .await
        .map_err(anyhow::Error::msg)?;

    let client = Client::new(provider);
    let watcher = DirectoryWatcher::new(
        client,
        &args.watch_dir,
        Duration::from_millis(args.poll_ms),
    );
    let watcher_handle = tokio::spawn(watcher.run());

    info!(watch_dir = args.watch_dir, db = args.db, "ferroflow running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    watcher_handle.abort();
    runtime.shutdown().await;
    Ok(())
}
