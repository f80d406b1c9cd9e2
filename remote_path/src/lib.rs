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

//! A uniform `scheme://path` addressing scheme over pluggable blob backends, with download-on-
//! demand into a caller-supplied local destination and atomic upload/link at the remote side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use opendal::Operator;
use parking_lot::Mutex as SyncMutex;
use regex::Regex;
use std::sync::OnceLock;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("remote path is not in its backing store: {0}")]
  NotInStore(String),
  #[error("scheme {0:?} is not in the configured allow-list")]
  UnsupportedScheme(String),
  #[error("malformed remote path {0:?}: expected scheme://path")]
  MalformedPath(String),
  #[error("mount sanity marker missing under {0:?}; refusing to use an unrecognized directory")]
  MissingSanityMarker(String),
  #[error("backend error for {path:?}: {source}")]
  Backend {
    path: String,
    #[source]
    source: opendal::Error,
  },
  #[error("local filesystem error: {0}")]
  Io(#[from] std::io::Error),
}

fn scheme_name_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// One entry of the scheme allow-list: either a configured local directory mount, or the
/// in-memory backend reserved for tests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Scheme {
  LocalMount(String),
  Memory,
}

impl Scheme {
  pub fn name(&self) -> String {
    match self {
      Scheme::LocalMount(name) => format!("localmount_{name}"),
      Scheme::Memory => "memory".to_string(),
    }
  }
}

/// A parsed `scheme://path` value.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RemotePath {
  scheme: String,
  path_body: String,
}

impl RemotePath {
  pub fn parse(raw: &str) -> Result<RemotePath, Error> {
    let (scheme, path_body) = raw
      .split_once("://")
      .ok_or_else(|| Error::MalformedPath(raw.to_string()))?;
    if !scheme_name_re().is_match(scheme) {
      return Err(Error::MalformedPath(raw.to_string()));
    }
    Ok(RemotePath {
      scheme: scheme.to_string(),
      path_body: path_body.to_string(),
    })
  }

  pub fn new(scheme: &str, path_body: &str) -> RemotePath {
    RemotePath {
      scheme: scheme.to_string(),
      path_body: path_body.to_string(),
    }
  }

  pub fn scheme(&self) -> &str {
    &self.scheme
  }

  pub fn path_body(&self) -> &str {
    &self.path_body
  }
}

impl std::fmt::Display for RemotePath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}://{}", self.scheme, self.path_body)
  }
}

/// The operations a scheme's backing store must support. One implementation (`OpendalBackend`)
/// covers every scheme this system ships with; the trait exists so tests can swap in a fake.
#[async_trait]
pub trait Backend: Send + Sync {
  async fn in_store(&self, path_body: &str) -> Result<bool, Error>;
  async fn timestamp(&self, path_body: &str) -> Result<u64, Error>;
  async fn touch(&self, path_body: &str) -> Result<(), Error>;
  /// Copies the remote artifact down to `dest` on the local filesystem.
  async fn download(&self, path_body: &str, dest: &std::path::Path) -> Result<(), Error>;
  /// Installs `src` (a local file) as the remote artifact, atomically at the destination.
  async fn upload(&self, src: &std::path::Path, path_body: &str) -> Result<(), Error>;
  /// Creates a content-share between two paths in this backend (hardlink for local mounts,
  /// copy for backends without link support).
  async fn link(&self, src_path_body: &str, dst_path_body: &str) -> Result<(), Error>;
}

/// A `Backend` over an `opendal::Operator`. One instance is constructed per configured scheme.
pub struct OpendalBackend {
  op: Operator,
  /// Present only for local-mount-backed operators; used to take real hardlinks instead of
  /// falling back to an opendal copy, and to validate the sanity marker at construction.
  local_root: Option<std::path::PathBuf>,
}

const SANITY_MARKER: &str = "localio.sanity";

impl OpendalBackend {
  /// Binds a `localmount_<name>` scheme to the `services-fs` backend rooted at `root`.
  /// Fails unless `root/localio.sanity` exists, guarding against mounting an empty directory
  /// over what should be a populated store.
  pub fn local_mount(root: &std::path::Path) -> Result<OpendalBackend, Error> {
    if !root.join(SANITY_MARKER).is_file() {
      return Err(Error::MissingSanityMarker(root.display().to_string()));
    }
    let op = Operator::new(
      opendal::services::Fs::default().root(&root.display().to_string()),
    )
    .map_err(|e| Error::Backend {
      path: root.display().to_string(),
      source: e,
    })?
    .finish();
    Ok(OpendalBackend {
      op,
      local_root: Some(root.to_path_buf()),
    })
  }

  /// Binds the `memory` scheme to the in-process `services-memory` backend. Reserved for tests
  /// and explicitly-configured integration scenarios; never offered as production config.
  pub fn memory() -> OpendalBackend {
    let op = Operator::new(opendal::services::Memory::default())
      .expect("memory operator never fails to construct")
      .finish();
    OpendalBackend {
      op,
      local_root: None,
    }
  }
}

#[async_trait]
impl Backend for OpendalBackend {
  async fn in_store(&self, path_body: &str) -> Result<bool, Error> {
    self
      .op
      .exists(path_body)
      .await
      .map_err(|e| Error::Backend {
        path: path_body.to_string(),
        source: e,
      })
  }

  async fn timestamp(&self, path_body: &str) -> Result<u64, Error> {
    let meta = self.op.stat(path_body).await.map_err(|e| {
      if e.kind() == opendal::ErrorKind::NotFound {
        Error::NotInStore(path_body.to_string())
      } else {
        Error::Backend {
          path: path_body.to_string(),
          source: e,
        }
      }
    })?;
    let mtime = meta.last_modified().unwrap_or_else(|| {
      let now: chrono::DateTime<chrono::Utc> = SystemTime::now().into();
      now
    });
    Ok(mtime.timestamp().max(0) as u64)
  }

  async fn touch(&self, path_body: &str) -> Result<(), Error> {
    if !self.in_store(path_body).await? {
      return Err(Error::NotInStore(path_body.to_string()));
    }
    // opendal has no generic touch; re-writing the existing bytes under their own path bumps
    // the backend's own last-modified bookkeeping for backends that track it that way.
    let bytes = self
      .op
      .read(path_body)
      .await
      .map_err(|e| Error::Backend {
        path: path_body.to_string(),
        source: e,
      })?
      .to_vec();
    self
      .op
      .write(path_body, bytes)
      .await
      .map(|_| ())
      .map_err(|e| Error::Backend {
        path: path_body.to_string(),
        source: e,
      })
  }

  async fn download(&self, path_body: &str, dest: &std::path::Path) -> Result<(), Error> {
    let reader = match self.op.reader(path_body).await {
      Ok(reader) => reader,
      Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
        return Err(Error::NotInStore(path_body.to_string()))
      }
      Err(e) => {
        return Err(Error::Backend {
          path: path_body.to_string(),
          source: e,
        })
      }
    };
    if let Some(parent) = dest.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tempfile_path(dest);
    {
      use tokio::io::AsyncWriteExt as _;
      let buf = reader.read(..).await.map_err(|e| Error::Backend {
        path: path_body.to_string(),
        source: e,
      })?;
      let mut out = tokio::fs::File::create(&tmp).await?;
      out.write_all(&buf.to_vec()).await?;
      out.sync_all().await?;
    }
    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
  }

  async fn upload(&self, src: &std::path::Path, path_body: &str) -> Result<(), Error> {
    let bytes = tokio::fs::read(src).await?;
    self
      .op
      .write(path_body, bytes)
      .await
      .map(|_| ())
      .map_err(|e| Error::Backend {
        path: path_body.to_string(),
        source: e,
      })
  }

  async fn link(&self, src_path_body: &str, dst_path_body: &str) -> Result<(), Error> {
    if !self.in_store(src_path_body).await? {
      return Err(Error::NotInStore(src_path_body.to_string()));
    }
    if let Some(root) = &self.local_root {
      let src = root.join(src_path_body);
      let dst = root.join(dst_path_body);
      if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
      }
      if dst.exists() {
        tokio::fs::remove_file(&dst).await?;
      }
      match tokio::fs::hard_link(&src, &dst).await {
        Ok(()) => Ok(()),
        Err(_) => {
          // Cross-device or unsupported; fall back to a logical copy.
          tokio::fs::copy(&src, &dst).await?;
          Ok(())
        }
      }
    } else {
      let bytes = self
        .op
        .read(src_path_body)
        .await
        .map_err(|e| Error::Backend {
          path: src_path_body.to_string(),
          source: e,
        })?
        .to_vec();
      self
        .op
        .write(dst_path_body, bytes)
        .await
        .map(|_| ())
        .map_err(|e| Error::Backend {
          path: dst_path_body.to_string(),
          source: e,
        })
    }
  }
}

fn tempfile_path(dest: &std::path::Path) -> std::path::PathBuf {
  let file_name = dest
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "artifact".to_string());
  let unique = format!(
    ".{file_name}.{}.tmp",
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_nanos()
  );
  dest.with_file_name(unique)
}

/// Resolves a `RemotePath`'s scheme to its `Backend`, and serializes concurrent downloads of the
/// same path behind a per-path lock so the local mirror is never populated twice.
pub struct BackendRegistry {
  backends: HashMap<String, Arc<dyn Backend>>,
  download_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BackendRegistry {
  pub fn new() -> BackendRegistry {
    BackendRegistry {
      backends: HashMap::new(),
      download_locks: SyncMutex::new(HashMap::new()),
    }
  }

  pub fn register(&mut self, scheme: Scheme, backend: Arc<dyn Backend>) {
    self.backends.insert(scheme.name(), backend);
  }

  pub fn is_allowed(&self, scheme: &str) -> bool {
    self.backends.contains_key(scheme)
  }

  fn backend(&self, path: &RemotePath) -> Result<&Arc<dyn Backend>, Error> {
    self
      .backends
      .get(path.scheme())
      .ok_or_else(|| Error::UnsupportedScheme(path.scheme().to_string()))
  }

  pub async fn in_store(&self, path: &RemotePath) -> Result<bool, Error> {
    self.backend(path)?.in_store(path.path_body()).await
  }

  pub async fn timestamp(&self, path: &RemotePath) -> Result<u64, Error> {
    self.backend(path)?.timestamp(path.path_body()).await
  }

  pub async fn touch(&self, path: &RemotePath) -> Result<(), Error> {
    self.backend(path)?.touch(path.path_body()).await
  }

  pub async fn upload(&self, src: &std::path::Path, path: &RemotePath) -> Result<(), Error> {
    self.backend(path)?.upload(src, path.path_body()).await
  }

  pub async fn link(&self, src: &RemotePath, dst: &RemotePath) -> Result<(), Error> {
    if src.scheme() != dst.scheme() {
      // Cross-backend links are not a content-share; materialize through a temp download.
      let tmp = tempfile::NamedTempFile::new()?;
      self.backend(src)?.download(src.path_body(), tmp.path()).await?;
      return self.backend(dst)?.upload(tmp.path(), dst.path_body()).await;
    }
    self.backend(src)?.link(src.path_body(), dst.path_body()).await
  }

  /// Downloads `path` to `dest`, serialized per-path so two callers racing on the same artifact
  /// don't both populate the mirror.
  pub async fn download(&self, path: &RemotePath, dest: &std::path::Path) -> Result<(), Error> {
    let lock = {
      let mut locks = self.download_locks.lock();
      locks
        .entry(path.to_string())
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
    };
    let _guard = lock.lock().await;
    if dest.exists() {
      return Ok(());
    }
    self.backend(path)?.download(path.path_body(), dest).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_scheme_and_body() {
    let p = RemotePath::parse("localmount_primary://a/b/c").unwrap();
    assert_eq!(p.scheme(), "localmount_primary");
    assert_eq!(p.path_body(), "a/b/c");
  }

  #[test]
  fn rejects_malformed_path() {
    assert!(RemotePath::parse("not-a-remote-path").is_err());
  }

  #[test]
  fn rejects_invalid_scheme_characters() {
    assert!(RemotePath::parse("bad-scheme://x").is_err());
  }

  #[test]
  fn display_round_trips() {
    let p = RemotePath::new("memory", "x/y");
    assert_eq!(p.to_string(), "memory://x/y");
  }

  #[tokio::test]
  async fn memory_backend_round_trips_upload_and_in_store() {
    let backend: Arc<dyn Backend> = Arc::new(OpendalBackend::memory());
    let mut registry = BackendRegistry::new();
    registry.register(Scheme::Memory, backend);

    let path = RemotePath::new("memory", "artifact-1");
    assert!(!registry.in_store(&path).await.unwrap());

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.bin");
    tokio::fs::write(&src, b"hello").await.unwrap();
    registry.upload(&src, &path).await.unwrap();
    assert!(registry.in_store(&path).await.unwrap());
  }

  #[tokio::test]
  async fn memory_backend_download_rejects_missing_artifact() {
    let backend: Arc<dyn Backend> = Arc::new(OpendalBackend::memory());
    let mut registry = BackendRegistry::new();
    registry.register(Scheme::Memory, backend);

    let path = RemotePath::new("memory", "absent");
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");
    let err = registry.download(&path, &dest).await.unwrap_err();
    assert!(matches!(err, Error::NotInStore(_)));
  }

  #[tokio::test]
  async fn unregistered_scheme_is_rejected() {
    let registry = BackendRegistry::new();
    let path = RemotePath::new("memory", "x");
    assert!(!registry.is_allowed("memory"));
    let err = registry.in_store(&path).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedScheme(_)));
  }

  #[tokio::test]
  async fn download_and_upload_round_trip_through_local_mount() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join(SANITY_MARKER), b"")
      .await
      .unwrap();
    let backend: Arc<dyn Backend> = Arc::new(OpendalBackend::local_mount(dir.path()).unwrap());
    let mut registry = BackendRegistry::new();
    registry.register(Scheme::LocalMount("primary".to_string()), backend);

    let path = RemotePath::new("localmount_primary", "artifact-2");
    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("src.bin");
    tokio::fs::write(&src, b"payload").await.unwrap();
    registry.upload(&src, &path).await.unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let dest = out_dir.path().join("mirrored.bin");
    registry.download(&path, &dest).await.unwrap();
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
  }

  #[tokio::test]
  async fn local_mount_rejects_directory_without_sanity_marker() {
    let dir = tempfile::tempdir().unwrap();
    assert!(OpendalBackend::local_mount(dir.path()).is_err());
  }
}
