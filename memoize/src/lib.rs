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

//! The cache-fn and cache-call wrappers: the protocol that turns "call this function" into
//! "check the remote store, run the lock-guarded function if needed, install the result".

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fingerprint::{Key, Value};
use freshness::{ArgValue, FreshnessSpec};
use local_cache::LocalMirror;
use remote_path::{BackendRegistry, RemotePath};
use serialization::Tag;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("artifact is not in the remote store")]
  NotInStore,
  #[error("the cached computation is already running elsewhere")]
  TaskRunning,
  #[error("local artifact disappeared before it could be installed")]
  FileDisappeared,
  #[error(transparent)]
  RemotePath(#[from] remote_path::Error),
  #[error(transparent)]
  Broker(#[from] broker::Error),
  #[error(transparent)]
  Serialization(#[from] serialization::Error),
  #[error("local filesystem error: {0}")]
  Io(#[from] std::io::Error),
  #[error("underlying function failed: {0}")]
  Function(String),
}

/// Computes the `ofn` relative path an installed artifact lives at: a deterministic location
/// under the function's own namespace, optionally further scoped by a caller-supplied prefix.
pub fn path_under(full_func_name: &str, prefix: Option<&str>, key: &Key) -> String {
  match prefix {
    Some(p) => format!("{full_func_name}/{p}/{}", key.to_hex()),
    None => format!("{full_func_name}/{}", key.to_hex()),
  }
}

fn meta_path(ofn: &str) -> String {
  format!("{ofn}_meta")
}

fn call_path(ofn: &str) -> String {
  format!("{ofn}_call")
}

/// What a wrapped function produced, before the cache-fn protocol decides how (or whether) to
/// install it.
pub enum FnOutput {
  /// The function decided this particular result should never be cached; the bytes are returned
  /// to the caller unchanged.
  Ignore(Vec<u8>),
  /// A local file holding the function's result, tagged with how to decode it.
  LocalFile { path: PathBuf, tag: Tag },
  /// The function produced (or reused) a value that already lives at a remote path; the wrapper
  /// links the canonical `ofn` to it rather than re-uploading.
  AlreadyRemote(RemotePath),
}

/// The user-supplied function a cache-fn wrapper guards. `args`/`kwargs` are the values the
/// fingerprint was computed from; implementations may of course accept richer native arguments
/// and only use this trait object at the wrapper boundary.
#[async_trait::async_trait]
pub trait CacheableFn: Send + Sync {
  async fn call(&self, args: &[Value], kwargs: &[(String, Value)]) -> Result<FnOutput, Error>;
}

/// Configuration for one cache-fn-wrapped function.
pub struct CacheFnConfig {
  pub full_func_name: String,
  pub prefix: Option<String>,
  pub storage_scheme: String,
  pub freshness: Option<FreshnessSpec>,
  pub update_timestamp: bool,
  pub lock_ttl: Duration,
  /// Move (rather than hardlink) the function's temporary output into place; the source is
  /// consumed either way.
  pub remove_return: bool,
}

/// Writes the `_meta` sidecar recording how `ofn`'s bytes are encoded.
async fn write_meta(registry: &BackendRegistry, remote: &RemotePath, tag: Tag) -> Result<(), Error> {
  let meta_remote = RemotePath::new(remote.scheme(), &meta_path(remote.path_body()));
  let tmp = tempfile::NamedTempFile::new()?;
  tokio::fs::write(tmp.path(), tag.as_str().as_bytes()).await?;
  registry.upload(tmp.path(), &meta_remote).await?;
  Ok(())
}

/// Reads back the `_meta` sidecar for `ofn`. A missing sidecar where one was expected signals
/// that a prior install never completed.
#[allow(dead_code)]
async fn read_meta(registry: &BackendRegistry, remote: &RemotePath) -> Result<Tag, Error> {
  let meta_remote = RemotePath::new(remote.scheme(), &meta_path(remote.path_body()));
  if !registry.in_store(&meta_remote).await? {
    return Err(Error::FileDisappeared);
  }
  let dir = tempfile::tempdir()?;
  let dest = dir.path().join("meta");
  registry.download(&meta_remote, &dest).await?;
  let contents = tokio::fs::read_to_string(&dest).await?;
  contents.parse::<Tag>().map_err(Error::Serialization)
}

/// Installs `local_src` as `remote`'s content: places it in the local mirror, uploads it, and
/// records its serialization tag. Shared by the cache-fn wrapper and the standalone install task
/// (which finalizes a cache-call-produced graph after the underlying computation finishes).
pub async fn install(
  registry: &BackendRegistry,
  mirror: &LocalMirror,
  local_src: &Path,
  remote: &RemotePath,
  tag: Tag,
  remove_source: bool,
) -> Result<(), Error> {
  let mirror_dest = mirror.resolve(remote.path_body());
  if let Some(parent) = mirror_dest.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }

  let install_result = if remove_source {
    tokio::fs::rename(local_src, &mirror_dest).await
  } else {
    tokio::fs::hard_link(local_src, &mirror_dest).await
  };
  match install_result {
    Ok(()) => {}
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::FileDisappeared),
    Err(_) => {
      // Cross-device rename/link; fall back to a copy.
      tokio::fs::copy(local_src, &mirror_dest)
        .await
        .map_err(|e| {
          if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileDisappeared
          } else {
            Error::Io(e)
          }
        })?;
      if remove_source {
        let _ = tokio::fs::remove_file(local_src).await;
      }
    }
  }

  mirror.add(remote.path_body());
  registry.upload(&mirror_dest, remote).await?;
  write_meta(registry, remote, tag).await?;
  Ok(())
}

fn to_arg_values(kwargs: &[(String, Value)]) -> std::collections::HashMap<String, ArgValue> {
  kwargs
    .iter()
    .filter_map(|(k, v)| {
      let arg = match v {
        Value::Str(s) => ArgValue::Str(s.clone()),
        Value::Int(i) => ArgValue::Int(*i),
        Value::Bool(b) => ArgValue::Bool(*b),
        _ => return None,
      };
      Some((k.clone(), arg))
    })
    .collect()
}

/// Runs the cache-fn protocol (spec §4.7) for one call.
///
/// Returns the string form of the remote path the artifact is (or now is) available at.
pub async fn cache_fn<B: broker::Broker>(
  config: &CacheFnConfig,
  key: &Key,
  kwargs: &[(String, Value)],
  args: &[Value],
  registry: &BackendRegistry,
  mirror: &LocalMirror,
  lock: &broker::DistributedLock<B>,
  func: &dyn CacheableFn,
) -> Result<String, Error> {
  let ofn = path_under(&config.full_func_name, config.prefix.as_deref(), key);
  let remote = RemotePath::new(&config.storage_scheme, &ofn);

  if registry.in_store(&remote).await? {
    let mtime = registry.timestamp(&remote).await? as i64;
    let call_kwargs = to_arg_values(kwargs);
    if freshness::passes(config.freshness.as_ref(), mtime, &call_kwargs) {
      if config.update_timestamp {
        registry.touch(&remote).await?;
      }
      return Ok(remote.to_string());
    }
  }

  let lock_name = format!("{}:{}", config.full_func_name, key.to_hex());
  let token = lock
    .acquire(&lock_name, config.lock_ttl)
    .await
    .map_err(|e| match e {
      broker::LockError::Locked => Error::TaskRunning,
      broker::LockError::Broker(e) => Error::Broker(e),
    })?;

  let result = run_and_install(func, args, kwargs, registry, mirror, &remote, config).await;

  if let Err(e) = lock.release(&token).await {
    log::warn!("failed to release cache-fn lock {lock_name:?}: {e}");
  }

  result
}

async fn run_and_install(
  func: &dyn CacheableFn,
  args: &[Value],
  kwargs: &[(String, Value)],
  registry: &BackendRegistry,
  mirror: &LocalMirror,
  remote: &RemotePath,
  config: &CacheFnConfig,
) -> Result<String, Error> {
  match func.call(args, kwargs).await? {
    FnOutput::Ignore(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
    FnOutput::AlreadyRemote(src) => {
      registry.link(&src, remote).await?;
      Ok(remote.to_string())
    }
    FnOutput::LocalFile { path, tag } => {
      install(registry, mirror, &path, remote, tag, config.remove_return).await?;
      Ok(remote.to_string())
    }
  }
}

/// A previously-computed task graph, or a freshly-built one plus the work still required to
/// populate the cache once it runs.
pub enum CallOutcome<G> {
  /// The result is already cached; the graph just needs to yield `artifact` when run.
  InstallFromCache { artifact: String },
  /// A graph fetched from the `<ofn>_call` sibling artifact.
  CachedGraph(G),
  /// A freshly-built graph, with the install step still pending at its tail.
  FreshGraph(G),
}

/// Builds a task graph, grounded on spec §4.8: check the canonical artifact first, then a
/// previously-persisted graph, and only then fall back to building one from scratch. Graphs are
/// (de)serialized under `graph_tag` (msgpack by default, per the format's compactness for the
/// nested shapes this wraps).
pub async fn cache_call<G, F, Fut>(
  config: &CacheFnConfig,
  key: &Key,
  kwargs: &[(String, Value)],
  registry: &BackendRegistry,
  graph_tag: Tag,
  build_graph: F,
) -> Result<CallOutcome<G>, Error>
where
  G: serde::Serialize + serde::de::DeserializeOwned,
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<G, Error>>,
{
  let ofn = path_under(&config.full_func_name, config.prefix.as_deref(), key);
  let remote = RemotePath::new(&config.storage_scheme, &ofn);
  let meta_remote = RemotePath::new(&config.storage_scheme, &meta_path(&ofn));

  if registry.in_store(&remote).await? {
    let mtime = registry.timestamp(&remote).await? as i64;
    let call_kwargs = to_arg_values(kwargs);
    if freshness::passes(config.freshness.as_ref(), mtime, &call_kwargs)
      && registry.in_store(&meta_remote).await?
    {
      return Ok(CallOutcome::InstallFromCache {
        artifact: remote.to_string(),
      });
    }
  }

  let call_remote = RemotePath::new(&config.storage_scheme, &call_path(&ofn));
  if registry.in_store(&call_remote).await? {
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("graph");
    registry.download(&call_remote, &dest).await?;
    let bytes = tokio::fs::read(&dest).await?;
    return Ok(CallOutcome::CachedGraph(serialization::decode(&bytes, graph_tag)?));
  }

  let graph = build_graph().await?;
  let bytes = serialization::encode(&graph, graph_tag)?;
  let tmp = tempfile::NamedTempFile::new()?;
  tokio::fs::write(tmp.path(), &bytes).await?;
  registry.upload(tmp.path(), &call_remote).await?;
  Ok(CallOutcome::FreshGraph(graph))
}
