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

//! The task decorator: composes logging, argument localization, and cache wrapping around a
//! user function, then registers the result with a [`WorkerRuntime`] so a scheduler can run it.
//!
//! The worker runtime itself is a boundary this crate only describes: a real deployment plugs in
//! a Celery-equivalent distributed scheduler; [`LocalWorkerRuntime`] is an in-process stand-in
//! for tests and single-process use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fingerprint::Value;
use memoize::{CacheFnConfig, CacheableFn, CallOutcome, FnOutput};
use parking_lot::Mutex;
use remote_path::{BackendRegistry, RemotePath};
use serialization::Tag;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("unknown job id: {0}")]
  UnknownJob(String),
  #[error(transparent)]
  Memoize(#[from] memoize::Error),
  #[error("local filesystem error: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  RemotePath(#[from] remote_path::Error),
}

/// Retry behavior attached at registration time; this core only carries the parameters, it does
/// not implement retry scheduling itself (that belongs to the worker runtime backend).
#[derive(Clone, Debug)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub backoff: Duration,
  pub jitter: bool,
  /// Exception/error type names that should trigger an automatic retry.
  pub retry_on: Vec<String>,
}

impl Default for RetryPolicy {
  fn default() -> RetryPolicy {
    RetryPolicy {
      max_retries: 0,
      backoff: Duration::from_secs(1),
      jitter: false,
      retry_on: Vec::new(),
    }
  }
}

/// Metadata a dispatch front-end renders as the `/api/help/<method>` response.
#[derive(Clone, Debug)]
pub struct TaskDescriptor {
  pub name: String,
  pub queue: String,
  pub retry_policy: RetryPolicy,
  pub help: Option<String>,
  /// Whether this method dispatches through a graph-builder (§4.8) rather than running a
  /// cache-fn-wrapped function directly. The dispatch front-end uses this to decide whether a
  /// freshly-submitted job id needs the `generate_task_queue://` prefix.
  pub is_graph_builder: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobState {
  Pending,
  Started,
  Retry,
  Success(Vec<u8>),
  Failure(String),
  Revoked,
}

/// The boundary between this core and a distributed task queue backend, analogous to the
/// `CommandRunner` boundary between an engine core and its process-execution backends.
#[async_trait::async_trait]
pub trait WorkerRuntime: Send + Sync {
  fn register(&self, descriptor: TaskDescriptor, task: Arc<dyn RegisteredTask>);
  async fn submit(&self, task_name: &str, payload: Vec<u8>) -> Result<String, Error>;
  async fn poll(&self, job_id: &str) -> Result<JobState, Error>;
  async fn revoke(&self, job_id: &str) -> Result<(), Error>;
}

/// A task that has gone through the full decorator pipeline and is ready to run given a raw,
/// JSON-encoded `{"args": [...], "kwargs": {...}}` payload.
#[async_trait::async_trait]
pub trait RegisteredTask: Send + Sync {
  async fn run(&self, payload: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// A bounded in-process task pool: the `WorkerRuntime` stand-in used for tests and single-process
/// deployments. Jobs run on spawned Tokio tasks, gated by a semaphore so a burst of submissions
/// can't run unbounded concurrent work.
pub struct LocalWorkerRuntime {
  tasks: Mutex<HashMap<String, Arc<dyn RegisteredTask>>>,
  jobs: Arc<Mutex<HashMap<String, JobState>>>,
  semaphore: Arc<tokio::sync::Semaphore>,
  next_id: AtomicU64,
}

impl LocalWorkerRuntime {
  pub fn new(max_concurrency: usize) -> Arc<LocalWorkerRuntime> {
    Arc::new(LocalWorkerRuntime {
      tasks: Mutex::new(HashMap::new()),
      jobs: Arc::new(Mutex::new(HashMap::new())),
      semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrency)),
      next_id: AtomicU64::new(1),
    })
  }
}

#[async_trait::async_trait]
impl WorkerRuntime for LocalWorkerRuntime {
  fn register(&self, descriptor: TaskDescriptor, task: Arc<dyn RegisteredTask>) {
    self.tasks.lock().insert(descriptor.name, task);
  }

  async fn submit(&self, task_name: &str, payload: Vec<u8>) -> Result<String, Error> {
    let task = self
      .tasks
      .lock()
      .get(task_name)
      .cloned()
      .ok_or_else(|| Error::UnknownJob(task_name.to_string()))?;

    let job_id = format!("{task_name}-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
    self.jobs.lock().insert(job_id.clone(), JobState::Pending);

    let jobs = self.jobs.clone();
    let semaphore = self.semaphore.clone();
    let job_id_for_task = job_id.clone();
    tokio::spawn(async move {
      let _permit = semaphore.acquire_owned().await.expect("semaphore never closes");
      jobs.lock().insert(job_id_for_task.clone(), JobState::Started);
      let result = task.run(payload).await;
      let final_state = match result {
        Ok(bytes) => JobState::Success(bytes),
        Err(message) => JobState::Failure(message),
      };
      jobs.lock().insert(job_id_for_task, final_state);
    });

    Ok(job_id)
  }

  async fn poll(&self, job_id: &str) -> Result<JobState, Error> {
    self
      .jobs
      .lock()
      .get(job_id)
      .cloned()
      .ok_or_else(|| Error::UnknownJob(job_id.to_string()))
  }

  async fn revoke(&self, job_id: &str) -> Result<(), Error> {
    let mut jobs = self.jobs.lock();
    if !jobs.contains_key(job_id) {
      return Err(Error::UnknownJob(job_id.to_string()));
    }
    jobs.insert(job_id.to_string(), JobState::Revoked);
    Ok(())
  }
}

fn payload_to_values(payload: &[u8]) -> Result<(Vec<Value>, Vec<(String, Value)>), String> {
  let parsed: serde_json::Value =
    serde_json::from_slice(payload).map_err(|e| format!("malformed task payload: {e}"))?;
  let args = parsed
    .get("args")
    .cloned()
    .unwrap_or(serde_json::Value::Array(Vec::new()));
  let kwargs = parsed
    .get("kwargs")
    .cloned()
    .unwrap_or(serde_json::Value::Object(Default::default()));

  let args: Vec<Value> = match args {
    serde_json::Value::Array(items) => items.into_iter().map(Value::from).collect(),
    other => vec![Value::from(other)],
  };
  let kwargs: Vec<(String, Value)> = match kwargs {
    serde_json::Value::Object(map) => map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
    _ => Vec::new(),
  };
  Ok((args, kwargs))
}

/// Replaces every top-level string argument that parses as a remote path with its
/// locally-downloaded path, per the task decorator's argument-localization stage. Only the first
/// level of args/kwargs is inspected, matching the decorator contract.
async fn localize_args(
  registry: &BackendRegistry,
  mirror: &local_cache::LocalMirror,
  args: Vec<Value>,
  kwargs: Vec<(String, Value)>,
) -> (Vec<Value>, Vec<(String, Value)>) {
  let mut out_args = Vec::with_capacity(args.len());
  for arg in args {
    out_args.push(localize_one(registry, mirror, arg).await);
  }
  let mut out_kwargs = Vec::with_capacity(kwargs.len());
  for (name, value) in kwargs {
    out_kwargs.push((name, localize_one(registry, mirror, value).await));
  }
  (out_args, out_kwargs)
}

async fn localize_one(registry: &BackendRegistry, mirror: &local_cache::LocalMirror, value: Value) -> Value {
  let Value::Str(s) = &value else {
    return value;
  };
  let Ok(remote) = RemotePath::parse(s) else {
    return value;
  };
  if !registry.is_allowed(remote.scheme()) {
    return value;
  }
  let dest = mirror.resolve(remote.path_body());
  match registry.download(&remote, &dest).await {
    Ok(()) => {
      mirror.add(remote.path_body());
      Value::Str(dest.display().to_string())
    }
    Err(e) => {
      log::warn!("failed to localize remote argument {s:?}: {e}");
      value
    }
  }
}

/// Builds a [`RegisteredTask`] that composes debug logging, argument localization, and (if
/// configured) cache-fn wrapping around `func`, in that order.
pub struct TaskBuilder {
  pub full_func_name: String,
  pub debug_logging: bool,
  pub localize: bool,
  pub cache: Option<CacheFnConfig>,
}

struct ComposedTask<B: broker::Broker> {
  builder: TaskBuilder,
  registry: Arc<BackendRegistry>,
  mirror: Arc<local_cache::LocalMirror>,
  lock: Arc<broker::DistributedLock<B>>,
  func: Arc<dyn CacheableFn>,
}

#[async_trait::async_trait]
impl<B: broker::Broker + 'static> RegisteredTask for ComposedTask<B> {
  async fn run(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
    if self.builder.debug_logging {
      log::debug!("running task {} with payload of {} bytes", self.builder.full_func_name, payload.len());
    }

    let (args, kwargs) = payload_to_values(&payload)?;
    let (args, kwargs) = if self.builder.localize {
      localize_args(&self.registry, &self.mirror, args, kwargs).await
    } else {
      (args, kwargs)
    };

    match &self.builder.cache {
      Some(cache_config) => {
        let key = fingerprint::key(&self.builder.full_func_name, &args, &kwargs, &Default::default());
        let result = memoize::cache_fn(
          cache_config,
          &key,
          &kwargs,
          &args,
          &self.registry,
          &self.mirror,
          &self.lock,
          self.func.as_ref(),
        )
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.into_bytes())
      }
      None => match self.func.call(&args, &kwargs).await.map_err(|e| e.to_string())? {
        FnOutput::Ignore(bytes) => Ok(bytes),
        FnOutput::AlreadyRemote(remote) => Ok(remote.to_string().into_bytes()),
        FnOutput::LocalFile { path, .. } => {
          tokio::fs::read(&path).await.map_err(|e| e.to_string())
        }
      },
    }
  }
}

impl TaskBuilder {
  pub fn new(full_func_name: impl Into<String>) -> TaskBuilder {
    TaskBuilder {
      full_func_name: full_func_name.into(),
      debug_logging: false,
      localize: true,
      cache: None,
    }
  }

  pub fn with_debug_logging(mut self, enabled: bool) -> TaskBuilder {
    self.debug_logging = enabled;
    self
  }

  pub fn with_cache(mut self, cache: CacheFnConfig) -> TaskBuilder {
    self.cache = Some(cache);
    self
  }

  pub fn build<B: broker::Broker + 'static>(
    self,
    registry: Arc<BackendRegistry>,
    mirror: Arc<local_cache::LocalMirror>,
    lock: Arc<broker::DistributedLock<B>>,
    func: Arc<dyn CacheableFn>,
  ) -> Arc<dyn RegisteredTask> {
    Arc::new(ComposedTask {
      builder: self,
      registry,
      mirror,
      lock,
      func,
    })
  }
}

/// Finalizes a cache-call-produced graph's tail node (spec §4.12). If `result_path` is `None`, a
/// prior attempt already installed `ofn`; this just re-reads its `_meta` sidecar. Otherwise it
/// installs `result_path` into `ofn` and writes the sidecar itself.
pub async fn install_task(
  registry: &BackendRegistry,
  mirror: &local_cache::LocalMirror,
  result_path: Option<&std::path::Path>,
  ofn: &str,
  storage_scheme: &str,
  tag: Tag,
  remove_source: bool,
) -> Result<(String, Tag), Error> {
  let remote = RemotePath::new(storage_scheme, ofn);
  match result_path {
    Some(path) => {
      memoize::install(registry, mirror, path, &remote, tag, remove_source).await?;
      Ok((remote.to_string(), tag))
    }
    None => {
      let meta_remote = RemotePath::new(storage_scheme, &format!("{ofn}_meta"));
      if !registry.in_store(&meta_remote).await.unwrap_or(false) {
        return Err(memoize::Error::FileDisappeared.into());
      }
      let dir = tempfile::tempdir()?;
      let dest = dir.path().join("meta");
      registry.download(&meta_remote, &dest).await?;
      let contents = tokio::fs::read_to_string(&dest).await?;
      let recovered_tag: Tag = contents
        .parse()
        .map_err(|e: serialization::Error| memoize::Error::Serialization(e))?;
      Ok((remote.to_string(), recovered_tag))
    }
  }
}

/// A task graph, in this core's model: the name of an already-registered task (and the payload to
/// run it with) that will actually compute and install the call's result. This core does not
/// implement a full graph DSL; deeper pipelines are built by nesting further `next_task`
/// references rather than by a dedicated composition type.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TaskGraph {
  pub next_task: String,
  pub payload: Vec<u8>,
}

/// The user-supplied function a cache-call wrapper guards: builds the graph that computes a
/// call's result, rather than computing the result directly (spec §4.8).
#[async_trait::async_trait]
pub trait GraphBuilderFn: Send + Sync {
  async fn build(&self, args: &[Value], kwargs: &[(String, Value)]) -> Result<TaskGraph, memoize::Error>;
}

/// The task name a graph's `InstallFromCache` outcome points at: running it simply yields the
/// already-cached artifact's path, matching the "pre-built install-from-cache signature" spec
/// §4.8 step 2 describes.
pub const INSTALL_FROM_CACHE_TASK: &str = "__install_from_cache__";

struct InstallFromCacheTask;

#[async_trait::async_trait]
impl RegisteredTask for InstallFromCacheTask {
  async fn run(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
    let parsed: serde_json::Value =
      serde_json::from_slice(&payload).map_err(|e| format!("malformed install-from-cache payload: {e}"))?;
    let artifact = parsed
      .get("artifact")
      .and_then(|v| v.as_str())
      .ok_or_else(|| "install-from-cache payload missing 'artifact'".to_string())?;
    Ok(artifact.as_bytes().to_vec())
  }
}

/// Registers the well-known install-from-cache sentinel every graph-builder's `InstallFromCache`
/// outcome points at. Call once per runtime at startup.
pub fn register_install_from_cache_task(runtime: &Arc<dyn WorkerRuntime>) {
  runtime.register(
    TaskDescriptor {
      name: INSTALL_FROM_CACHE_TASK.to_string(),
      queue: "default".to_string(),
      retry_policy: RetryPolicy::default(),
      help: None,
      is_graph_builder: false,
    },
    Arc::new(InstallFromCacheTask),
  );
}

/// Composes debug logging and argument localization (the same first two decorator stages as
/// [`ComposedTask`]) around a [`GraphBuilderFn`], then runs the cache-call protocol (spec §4.8)
/// and schedules whatever graph it returns.
struct GraphBuilderTask {
  full_func_name: String,
  debug_logging: bool,
  localize: bool,
  cache: CacheFnConfig,
  registry: Arc<BackendRegistry>,
  mirror: Arc<local_cache::LocalMirror>,
  runtime: Weak<dyn WorkerRuntime>,
  build: Arc<dyn GraphBuilderFn>,
}

#[async_trait::async_trait]
impl RegisteredTask for GraphBuilderTask {
  async fn run(&self, payload: Vec<u8>) -> Result<Vec<u8>, String> {
    if self.debug_logging {
      log::debug!("building graph for {} with payload of {} bytes", self.full_func_name, payload.len());
    }

    let (args, kwargs) = payload_to_values(&payload)?;
    let (args, kwargs) = if self.localize {
      localize_args(&self.registry, &self.mirror, args, kwargs).await
    } else {
      (args, kwargs)
    };

    let key = fingerprint::key(&self.full_func_name, &args, &kwargs, &Default::default());
    let build = self.build.clone();
    let kwargs_for_cache_call = kwargs.clone();

    let outcome = memoize::cache_call(
      &self.cache,
      &key,
      &kwargs_for_cache_call,
      &self.registry,
      Tag::MsgPack,
      move || async move { build.build(&args, &kwargs).await },
    )
    .await
    .map_err(|e| e.to_string())?;

    let graph = match outcome {
      CallOutcome::InstallFromCache { artifact } => TaskGraph {
        next_task: INSTALL_FROM_CACHE_TASK.to_string(),
        payload: serde_json::to_vec(&serde_json::json!({ "artifact": artifact }))
          .expect("a single string field always encodes"),
      },
      CallOutcome::CachedGraph(graph) | CallOutcome::FreshGraph(graph) => graph,
    };

    let runtime = self
      .runtime
      .upgrade()
      .ok_or_else(|| "worker runtime was dropped before the graph could be scheduled".to_string())?;
    let job_id = runtime
      .submit(&graph.next_task, graph.payload)
      .await
      .map_err(|e| e.to_string())?;
    Ok(job_id.into_bytes())
  }
}

impl TaskBuilder {
  /// Builds a graph-builder-wrapped task (spec §4.8/§4.11) instead of the cache-fn-wrapped form
  /// [`TaskBuilder::build`] produces. `runtime` is held weakly since the builder task is itself
  /// registered with that runtime and must not keep it alive past shutdown.
  pub fn build_graph_builder(
    self,
    registry: Arc<BackendRegistry>,
    mirror: Arc<local_cache::LocalMirror>,
    runtime: Weak<dyn WorkerRuntime>,
    cache: CacheFnConfig,
    build: Arc<dyn GraphBuilderFn>,
  ) -> Arc<dyn RegisteredTask> {
    Arc::new(GraphBuilderTask {
      full_func_name: self.full_func_name,
      debug_logging: self.debug_logging,
      localize: self.localize,
      cache,
      registry,
      mirror,
      runtime,
      build,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use broker::InMemoryBroker;
  use local_cache::LocalMirror;
  use remote_path::{OpendalBackend, Scheme};
  use std::sync::Arc as StdArc;

  fn memory_registry() -> Arc<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(Scheme::Memory, StdArc::new(OpendalBackend::memory()));
    Arc::new(registry)
  }

  struct Echo;

  #[async_trait::async_trait]
  impl CacheableFn for Echo {
    async fn call(&self, args: &[Value], _kwargs: &[(String, Value)]) -> Result<FnOutput, memoize::Error> {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.keep().join("out.json");
      let body = serde_json::to_vec(&format!("{args:?}")).unwrap();
      tokio::fs::write(&path, body).await.unwrap();
      Ok(FnOutput::LocalFile { path, tag: Tag::Json })
    }
  }

  #[tokio::test]
  async fn local_worker_runtime_runs_and_reports_success() {
    let runtime = LocalWorkerRuntime::new(4);
    let registry = memory_registry();
    let mirror_dir = tempfile::tempdir().unwrap();
    let mirror = StdArc::new(LocalMirror::new(mirror_dir.path().to_path_buf(), 1_000_000, Duration::from_secs(60)));
    let lock = StdArc::new(broker::DistributedLock::new(InMemoryBroker::new()));

    let task = TaskBuilder::new("pkg.mod.echo")
      .with_cache(CacheFnConfig {
        full_func_name: "pkg.mod.echo".to_string(),
        prefix: None,
        storage_scheme: "memory".to_string(),
        freshness: None,
        update_timestamp: false,
        lock_ttl: Duration::from_secs(30),
        remove_return: true,
      })
      .build(registry, mirror, lock, Arc::new(Echo));

    runtime.register(
      TaskDescriptor {
        name: "pkg.mod.echo".to_string(),
        queue: "default".to_string(),
        retry_policy: RetryPolicy::default(),
        help: None,
        is_graph_builder: false,
      },
      task,
    );

    let payload = serde_json::to_vec(&serde_json::json!({"args": [1, 2], "kwargs": {}})).unwrap();
    let job_id = runtime.submit("pkg.mod.echo", payload).await.unwrap();

    let mut state = runtime.poll(&job_id).await.unwrap();
    for _ in 0..50 {
      if matches!(state, JobState::Success(_) | JobState::Failure(_)) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
      state = runtime.poll(&job_id).await.unwrap();
    }
    assert!(matches!(state, JobState::Success(_)), "job ended in {state:?}");
  }

  #[tokio::test]
  async fn polling_an_unknown_job_is_an_error() {
    let runtime = LocalWorkerRuntime::new(1);
    assert!(runtime.poll("nope").await.is_err());
  }

  #[tokio::test]
  async fn install_task_with_result_path_installs_and_records_tag() {
    let registry = memory_registry();
    let mirror_dir = tempfile::tempdir().unwrap();
    let mirror = LocalMirror::new(mirror_dir.path().to_path_buf(), 1_000_000, Duration::from_secs(60));
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("out.json");
    std::fs::write(&src, b"{}").unwrap();

    let (path, tag) = install_task(&registry, &mirror, Some(&src), "pkg.mod.func/abc", "memory", Tag::Json, true)
      .await
      .unwrap();
    assert_eq!(tag, Tag::Json);
    assert!(path.starts_with("memory://"));
  }

  #[tokio::test]
  async fn install_task_with_none_and_missing_meta_signals_file_disappeared() {
    let registry = memory_registry();
    let mirror_dir = tempfile::tempdir().unwrap();
    let mirror = LocalMirror::new(mirror_dir.path().to_path_buf(), 1_000_000, Duration::from_secs(60));

    let result = install_task(&registry, &mirror, None, "pkg.mod.func/missing", "memory", Tag::Json, true).await;
    assert!(matches!(result, Err(Error::Memoize(memoize::Error::FileDisappeared))));
  }

  struct BuildsGraphPointingAt {
    next_task: String,
  }

  #[async_trait::async_trait]
  impl GraphBuilderFn for BuildsGraphPointingAt {
    async fn build(&self, _args: &[Value], _kwargs: &[(String, Value)]) -> Result<TaskGraph, memoize::Error> {
      Ok(TaskGraph {
        next_task: self.next_task.clone(),
        payload: serde_json::to_vec(&serde_json::json!({"args": [], "kwargs": {}})).unwrap(),
      })
    }
  }

  fn graph_builder_cache_config(full_func_name: &str) -> CacheFnConfig {
    CacheFnConfig {
      full_func_name: full_func_name.to_string(),
      prefix: None,
      storage_scheme: "memory".to_string(),
      freshness: None,
      update_timestamp: false,
      lock_ttl: Duration::from_secs(30),
      remove_return: true,
    }
  }

  #[tokio::test]
  async fn graph_builder_task_schedules_the_graph_it_builds_and_reports_its_job_id() {
    let registry = memory_registry();
    let mirror = StdArc::new(LocalMirror::new(
      tempfile::tempdir().unwrap().keep(),
      1_000_000,
      Duration::from_secs(60),
    ));
    let runtime = LocalWorkerRuntime::new(4);
    let runtime_dyn: Arc<dyn WorkerRuntime> = runtime.clone();

    runtime.register(
      TaskDescriptor {
        name: "pkg.mod.echo".to_string(),
        queue: "default".to_string(),
        retry_policy: RetryPolicy::default(),
        help: None,
        is_graph_builder: false,
      },
      TaskBuilder::new("pkg.mod.echo")
        .build(registry.clone(), mirror.clone(), StdArc::new(broker::DistributedLock::new(InMemoryBroker::new())), Arc::new(Echo)),
    );

    let graph_builder = TaskBuilder::new("pkg.mod.graph").build_graph_builder(
      registry.clone(),
      mirror.clone(),
      Arc::downgrade(&runtime_dyn),
      graph_builder_cache_config("pkg.mod.graph"),
      Arc::new(BuildsGraphPointingAt {
        next_task: "pkg.mod.echo".to_string(),
      }),
    );
    runtime.register(
      TaskDescriptor {
        name: "pkg.mod.graph".to_string(),
        queue: "default".to_string(),
        retry_policy: RetryPolicy::default(),
        help: None,
        is_graph_builder: true,
      },
      graph_builder,
    );

    let payload = serde_json::to_vec(&serde_json::json!({"args": [], "kwargs": {}})).unwrap();
    let builder_job_id = runtime.submit("pkg.mod.graph", payload).await.unwrap();

    let mut state = runtime.poll(&builder_job_id).await.unwrap();
    for _ in 0..50 {
      if matches!(state, JobState::Success(_) | JobState::Failure(_)) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
      state = runtime.poll(&builder_job_id).await.unwrap();
    }
    let real_job_id = match state {
      JobState::Success(bytes) => String::from_utf8(bytes).unwrap(),
      other => panic!("graph builder ended in {other:?}"),
    };
    assert!(real_job_id.starts_with("pkg.mod.echo-"));

    let mut echo_state = runtime.poll(&real_job_id).await.unwrap();
    for _ in 0..50 {
      if matches!(echo_state, JobState::Success(_) | JobState::Failure(_)) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
      echo_state = runtime.poll(&real_job_id).await.unwrap();
    }
    assert!(matches!(echo_state, JobState::Success(_)), "echo job ended in {echo_state:?}");
  }

  #[tokio::test]
  async fn install_from_cache_sentinel_yields_the_artifact_it_was_given() {
    let runtime = LocalWorkerRuntime::new(1);
    let runtime_dyn: Arc<dyn WorkerRuntime> = runtime.clone();
    register_install_from_cache_task(&runtime_dyn);

    let payload = serde_json::to_vec(&serde_json::json!({"artifact": "memory://pkg.mod.graph/abc"})).unwrap();
    let job_id = runtime.submit(INSTALL_FROM_CACHE_TASK, payload).await.unwrap();

    let mut state = runtime.poll(&job_id).await.unwrap();
    for _ in 0..50 {
      if matches!(state, JobState::Success(_) | JobState::Failure(_)) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
      state = runtime.poll(&job_id).await.unwrap();
    }
    match state {
      JobState::Success(bytes) => assert_eq!(bytes, b"memory://pkg.mod.graph/abc"),
      other => panic!("install-from-cache sentinel ended in {other:?}"),
    }
  }
}
