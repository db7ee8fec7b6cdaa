use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use medsync::cache::CacheManager;
use medsync::config::Config;
use medsync::lifecycle::LifecycleManager;
use medsync::net::{HttpOrigin, Origin};
use medsync::push::LogNotificationSink;
use medsync::store::Store;
use medsync::sync::SyncCoordinator;
use medsync::worker::{Worker, WorkerHandle};

#[derive(Parser, Debug)]
#[command(name = "medsync")]
#[command(about = "Offline-first cache and sync engine for a mobile health tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/medsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for the engine database (default: platform data dir)
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Drain the pending-mutation queue once and exit
  #[arg(long)]
  drain_once: bool,

  /// Append logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Seconds between connectivity probes
  #[arg(long, default_value_t = 30)]
  probe_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Open the durable store
  let db_path = match args.data_dir.or_else(|| config.data_dir.clone()) {
    Some(dir) => dir.join("engine.db"),
    None => Store::default_path()?,
  };
  let store = Arc::new(Store::open(&db_path)?);
  info!(path = %db_path.display(), "store opened");

  let origin = Arc::new(HttpOrigin::new(&config.origin)?);
  let version = config.cache.version();
  let shell = config.shell_urls(origin.base_url())?;
  let mut lifecycle = LifecycleManager::new(
    Arc::clone(&store),
    version.clone(),
    shell.clone(),
    config.cache.policy(),
  );

  // Install the cache version if it is new, then activate. A failed install
  // leaves the previous version in place.
  if lifecycle.needs_install()? {
    match lifecycle.install(origin.as_ref()).await {
      Ok(()) => {
        let report = lifecycle.activate()?;
        info!(version = %report.version, purged = report.purged.len(), "cache version activated");
      }
      Err(error) => {
        warn!(%error, %version, "install failed, keeping previous cache version");
      }
    }
  } else {
    lifecycle.activate()?;
  }

  // Key reads to the version actually serving; after a failed install that
  // is still the previous one.
  let serving = lifecycle.serving_version()?;
  let cache = CacheManager::new(
    Arc::clone(&store),
    Arc::clone(&origin),
    config.cache.policy(),
    serving,
  )
  .with_shell(shell);
  for partition in cache.status()?.partitions {
    debug!(
      name = %partition.name,
      entries = partition.entries,
      newest = ?partition.newest,
      "cache partition"
    );
  }

  if args.drain_once {
    let sync = SyncCoordinator::new(Arc::clone(&store), Arc::clone(&origin));
    let report = sync.drain().await?;
    info!(
      attempted = report.attempted,
      synced = report.synced,
      failed = report.failed,
      rejected = report.rejected,
      "queue drained"
    );
    return Ok(());
  }

  let (worker, handle, mut events) = Worker::new(
    Arc::clone(&store),
    Arc::clone(&origin),
    Arc::new(LogNotificationSink),
    lifecycle,
  );

  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      info!(?event, "engine event");
    }
  });
  tokio::spawn(probe_connectivity(
    origin,
    handle.clone(),
    Duration::from_secs(args.probe_interval.max(1)),
  ));
  let worker_task = tokio::spawn(worker.run());

  tokio::signal::ctrl_c().await?;
  info!("shutting down");
  handle.shutdown();
  worker_task.await?;

  Ok(())
}

/// Poll origin reachability and report transitions to the worker.
async fn probe_connectivity<O: Origin>(origin: Arc<O>, handle: WorkerHandle, every: Duration) {
  let mut ticker = tokio::time::interval(every);
  let mut last: Option<bool> = None;
  loop {
    ticker.tick().await;
    let online = origin.reachable().await;
    if last != Some(online) {
      if !handle.connectivity_changed(online) {
        break;
      }
      last = Some(online);
    }
  }
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("medsync=info"));
  match log_file {
    Some(path) => {
      let directory = path.parent().unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("log file path has no file name: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(directory, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt().with_env_filter(filter).init();
      Ok(None)
    }
  }
}
