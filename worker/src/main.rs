#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]

//! Parses flags, loads config, and wires the broker/store/cache/dispatch components into one
//! long-running process: a local worker pool fronted by the dispatch HTTP server.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use appconfig::{
  AppSection, BrokerSection, Config, LocalCacheSection, LoggingSection, RemoteStorageSection,
  WebServerSection, WorkerSection,
};
use broker::{Broker, DistributedLock, DistributedMap, Error as BrokerError, InMemoryBroker, RedisBroker};
use clap::Parser;
use dispatch::AppState;
use local_cache::LocalMirror;
use regex::Regex;
use remote_path::{BackendRegistry, OpendalBackend, Scheme};
use tasks::{LocalWorkerRuntime, WorkerRuntime};

/// The closed set of broker backends this process can be configured with. `DistributedLock` and
/// `DistributedMap` are generic over a concrete `Broker` implementation, so `main` monomorphizes
/// on this enum rather than carrying a `dyn Broker` through them.
enum ConfiguredBroker {
  Redis(RedisBroker),
  InMemory(Arc<InMemoryBroker>),
}

#[async_trait::async_trait]
impl Broker for ConfiguredBroker {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
    match self {
      ConfiguredBroker::Redis(b) => b.get(key).await,
      ConfiguredBroker::InMemory(b) => b.get(key).await,
    }
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BrokerError> {
    match self {
      ConfiguredBroker::Redis(b) => b.set(key, value, ttl).await,
      ConfiguredBroker::InMemory(b) => b.set(key, value, ttl).await,
    }
  }

  async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, BrokerError> {
    match self {
      ConfiguredBroker::Redis(b) => b.set_if_absent(key, value, ttl).await,
      ConfiguredBroker::InMemory(b) => b.set_if_absent(key, value, ttl).await,
    }
  }

  async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
    match self {
      ConfiguredBroker::Redis(b) => b.delete(key).await,
      ConfiguredBroker::InMemory(b) => b.delete(key).await,
    }
  }

  async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, BrokerError> {
    match self {
      ConfiguredBroker::Redis(b) => b.compare_and_delete(key, expected).await,
      ConfiguredBroker::InMemory(b) => b.compare_and_delete(key, expected).await,
    }
  }
}

#[derive(Debug, thiserror::Error)]
enum MainError {
  #[error("{0}")]
  Config(String),
  #[error(transparent)]
  Broker(#[from] broker::Error),
  #[error(transparent)]
  RemotePath(#[from] remote_path::Error),
  #[error("{0}")]
  Logging(String),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "worker", about = "Runs the dispatch server and local worker pool.")]
struct Cli {
  /// Config files, applied in order (later files override earlier ones' keys).
  #[arg(long = "config", required = true)]
  config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
  let cli = Cli::parse();
  let config = Config::merged(&cli.config).map_err(MainError::Config)?;

  let logging = LoggingSection::load(&config);
  let level = logsetup::parse_level(&logging.level).map_err(MainError::Logging)?;
  logsetup::Logger::init(level, true, logging.path.as_deref().map(Path::new))
    .map_err(MainError::Logging)?;

  let app = AppSection::load(&config);
  let broker_section = BrokerSection::load(&config).map_err(MainError::Config)?;
  let worker_section = WorkerSection::load(&config).map_err(MainError::Config)?;
  let localcache = LocalCacheSection::load(&config).map_err(MainError::Config)?;
  let remotestorage = RemoteStorageSection::load(&config).map_err(MainError::Config)?;
  let webserver = WebServerSection::load(&config).map_err(MainError::Config)?;

  log::info!(
    "starting worker: broker={}, {} worker slot(s), default remote scheme {:?}",
    broker_section.name,
    worker_section.workers,
    remotestorage.default,
  );

  let broker: Arc<ConfiguredBroker> = if broker_section.name == "redis" {
    Arc::new(ConfiguredBroker::Redis(RedisBroker::connect(&broker_section.url).await?))
  } else {
    Arc::new(ConfiguredBroker::InMemory(InMemoryBroker::new()))
  };

  let mut registry = BackendRegistry::new();
  registry.register(Scheme::Memory, Arc::new(OpendalBackend::memory()));
  for (name, root) in config.local_mounts() {
    if !remotestorage.use_remotes.is_empty() && !remotestorage.use_remotes.contains(&name) {
      continue;
    }
    let backend = OpendalBackend::local_mount(Path::new(&root))?;
    registry.register(Scheme::LocalMount(name), Arc::new(backend));
  }
  let registry = Arc::new(registry);

  let mirror = Arc::new(LocalMirror::new(
    PathBuf::from(&localcache.path),
    localcache.limit_bytes,
    Duration::from_secs(60),
  ));

  let lock = Arc::new(DistributedLock::new(broker.clone()));
  let queue_map = Arc::new(DistributedMap::new(
    broker.clone(),
    Some(Duration::from_secs(broker_section.result_expires)),
  ));

  let runtime: Arc<dyn WorkerRuntime> = LocalWorkerRuntime::new(worker_section.workers);
  tasks::register_install_from_cache_task(&runtime);

  let allow_list: Vec<Regex> = app
    .allowed_imports
    .iter()
    .filter_map(|pattern| match Regex::new(pattern) {
      Ok(re) => Some(re),
      Err(e) => {
        log::warn!("invalid allowed_imports pattern {pattern:?}: {e}");
        None
      }
    })
    .collect();

  let state = Arc::new(AppState::new(runtime.clone(), queue_map, allow_list));

  if app.autodiscover.is_empty() {
    log::warn!("app.autodiscover is empty: no task modules will be registered");
  }
  register_tasks(&app.autodiscover, &state, &registry, &mirror, &lock, &runtime);

  let router = dispatch::router(state);
  let addr: SocketAddr = format!("{}:{}", webserver.host, webserver.port)
    .parse()
    .map_err(|e| MainError::Config(format!("invalid webserver.host/port: {e}")))?;

  log::info!("listening on {addr}");
  let listener = tokio::net::TcpListener::bind(addr).await?;
  axum::serve(listener, router)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  Ok(())
}

async fn shutdown_signal() {
  let _ = tokio::signal::ctrl_c().await;
  log::info!("received shutdown signal");
}

/// Extension point for application modules: each entry in `app.autodiscover` names a module whose
/// tasks should be built with `TaskBuilder` (cache-fn-wrapped via `build`, or cache-call-wrapped
/// via `build_graph_builder`) and handed to `state.register(...)` here, sharing this process's
/// registry, mirror, lock, and runtime. No modules ship with the framework itself, so this
/// currently only logs what was configured.
fn register_tasks(
  autodiscover: &[String],
  _state: &Arc<AppState<ConfiguredBroker>>,
  _registry: &Arc<BackendRegistry>,
  _mirror: &Arc<LocalMirror>,
  _lock: &Arc<DistributedLock<ConfiguredBroker>>,
  _runtime: &Arc<dyn WorkerRuntime>,
) {
  for module in autodiscover {
    log::debug!("configured autodiscover module (not yet registered): {module}");
  }
}
