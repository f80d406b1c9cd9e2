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
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

/// Executors come in two flavors:
/// * "borrowed", created with `Self::new()` or `self.to_borrowed()`: will not be shut down when
///   all handles are dropped, and shutdown methods have no effect. Used when the Runtime is
///   created by tokio's macros (e.g. in unit tests), or is shared by several long-lived
///   components.
/// * "owned", created with `Self::new_owned()`: when all handles are dropped, the underlying
///   Runtime shuts down; the explicit `shutdown` method does the same for all clones.
#[derive(Debug, Clone)]
pub struct Executor {
  runtime: Arc<Mutex<Option<Runtime>>>,
  handle: Handle,
}

impl Executor {
  /// Creates an Executor wrapping the Runtime the caller is currently inside of.
  pub fn new() -> Executor {
    Self {
      runtime: Arc::new(Mutex::new(None)),
      handle: Handle::current(),
    }
  }

  /// Builds a new owned multi-threaded Runtime with the given worker/blocking-thread counts.
  pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
    let mut runtime_builder = Builder::new_multi_thread();
    runtime_builder
      .worker_threads(num_worker_threads)
      .max_blocking_threads(max_threads.saturating_sub(num_worker_threads).max(1))
      .enable_all();

    let runtime = runtime_builder
      .build()
      .map_err(|e| format!("Failed to start the runtime: {e}"))?;

    let handle = runtime.handle().clone();
    Ok(Executor {
      runtime: Arc::new(Mutex::new(Some(runtime))),
      handle,
    })
  }

  /// Creates a clone of this Executor which is disconnected from shutdown events.
  pub fn to_borrowed(&self) -> Executor {
    Self {
      runtime: Arc::new(Mutex::new(None)),
      handle: self.handle.clone(),
    }
  }

  /// Runs a Future on this Executor's Runtime as a new Task, rescuing a join panic with the
  /// given closure.
  pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
    &self,
    future: F,
    rescue_join_error: impl FnOnce(JoinError) -> O,
  ) -> impl Future<Output = O> {
    self.native_spawn(future).map(|res| match res {
      Ok(o) => o,
      Err(e) => rescue_join_error(e),
    })
  }

  /// Runs a Future on this Executor's Runtime as a new Task, and returns a JoinHandle.
  pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
    &self,
    future: F,
  ) -> JoinHandle<O> {
    self.handle.spawn(future)
  }

  /// Runs a Future to completion on this Executor's Runtime. Must not be called from within a
  /// Future running on that Runtime.
  pub fn block_on<F: Future>(&self, future: F) -> F::Output {
    self.handle.block_on(future)
  }

  /// Spawns a blocking closure on the threadpool reserved for long-running I/O work.
  pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
    &self,
    f: F,
    rescue_join_error: impl FnOnce(JoinError) -> R,
  ) -> impl Future<Output = R> {
    self.native_spawn_blocking(f).map(|res| match res {
      Ok(o) => o,
      Err(e) => rescue_join_error(e),
    })
  }

  /// Spawns a blocking closure on the threadpool reserved for long-running I/O work, and returns
  /// a JoinHandle.
  pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
    &self,
    f: F,
  ) -> JoinHandle<R> {
    self.handle.spawn_blocking(f)
  }

  /// Returns a reference to this executor's runtime handle.
  pub fn handle(&self) -> &Handle {
    &self.handle
  }

  /// Blocks until this "owned" Executor's Runtime shuts down. Tasks that have not completed by
  /// the timeout are leaked. Has no effect for "borrowed" Executors.
  pub fn shutdown(&self, timeout: Duration) {
    let Some(runtime) = self.runtime.lock().take() else {
      return;
    };

    let start = Instant::now();
    runtime.shutdown_timeout(timeout + Duration::from_millis(250));
    if start.elapsed() > timeout {
      log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
    }
  }

  /// Returns true once `shutdown` has been called. Always true for borrowed Executors.
  pub fn is_shutdown(&self) -> bool {
    self.runtime.lock().is_none()
  }
}

/// Tracks "tail" tasks: async work that can run concurrently with in-flight job execution but
/// that a graceful shutdown should wait for (subject to a timeout) before the process exits.
#[derive(Clone)]
pub struct TailTasks {
  inner: Arc<Mutex<Option<TailTasksInner>>>,
}

struct TailTasksInner {
  id_to_name: HashMap<Id, String>,
  task_set: JoinSet<()>,
}

impl TailTasks {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Some(TailTasksInner {
        id_to_name: HashMap::new(),
        task_set: JoinSet::new(),
      }))),
    }
  }

  /// Spawns a named tail task onto the given runtime handle.
  pub fn spawn_on<F>(&self, name: &str, handle: &Handle, task: F)
  where
    F: Future<Output = ()>,
    F: Send + 'static,
  {
    let mut guard = self.inner.lock();
    let inner = match &mut *guard {
      Some(inner) => inner,
      None => {
        log::warn!("tail task `{name}` submitted after shutdown began.");
        return;
      }
    };

    let h = inner.task_set.spawn_on(task, handle);
    inner.id_to_name.insert(h.id(), name.to_string());
  }

  /// Waits for all tail tasks to complete, subject to the given timeout; logs failures and
  /// abandons anything still running once the timeout elapses.
  pub async fn wait(self, timeout: Duration) {
    let mut inner = match self.inner.lock().take() {
      Some(inner) => inner,
      None => {
        log::debug!("tail tasks awaited multiple times!");
        return;
      }
    };

    if inner.task_set.is_empty() {
      return;
    }

    log::debug!("waiting for {} tail task(s) to complete", inner.task_set.len());

    let mut timeout = tokio::time::sleep(timeout).boxed();

    loop {
      tokio::select! {
        biased;

        _ = &mut timeout => break,

        next_result = inner.task_set.join_next_with_id() => {
          match next_result {
            Some(Ok((id, _))) => {
              if let Some(name) = inner.id_to_name.get(&id) {
                log::trace!("tail task `{name}` completed successfully");
              }
              inner.id_to_name.remove(&id);
            },
            Some(Err(err)) => {
              let name = inner.id_to_name.get(&err.id());
              log::error!("tail task `{name:?}` failed: {err:?}");
            }
            None => break,
          }
        }
      }
    }

    if inner.task_set.is_empty() {
      log::debug!("all tail tasks completed successfully");
    } else {
      let remaining: Vec<&str> = inner.id_to_name.values().map(String::as_str).collect();
      log::debug!(
        "{} tail task(s) failed to complete within timeout: {}",
        inner.task_set.len(),
        remaining.join(", "),
      );
      inner.task_set.abort_all();
    }
  }
}
