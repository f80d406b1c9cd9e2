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

//! A byte-budgeted local mirror of remote artifacts, keyed by filename and aware of inode
//! sharing: hardlinked aliases of the same content are charged against the budget once.

use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct MirrorState {
  fn_to_inode: HashMap<String, u64>,
  inode_refcount: HashMap<u64, u64>,
  inode_bytes: HashMap<u64, u64>,
  total_bytes: u64,
  checked_at: Instant,
  deque: VecDeque<String>,
}

impl MirrorState {
  fn new() -> MirrorState {
    MirrorState {
      fn_to_inode: HashMap::new(),
      inode_refcount: HashMap::new(),
      inode_bytes: HashMap::new(),
      total_bytes: 0,
      checked_at: Instant::now(),
      deque: VecDeque::new(),
    }
  }

  /// Removes `name` from the deque and its fn->inode entry, releasing bytes/refcount if this
  /// was the last alias of its inode. Does not touch the file on disk.
  fn purge(&mut self, name: &str) {
    if let Some(pos) = self.deque.iter().position(|n| n == name) {
      self.deque.remove(pos);
    }
    if let Some(inode) = self.fn_to_inode.remove(name) {
      self.release_inode(inode);
    }
  }

  fn release_inode(&mut self, inode: u64) {
    if let Some(refcount) = self.inode_refcount.get_mut(&inode) {
      *refcount -= 1;
      if *refcount == 0 {
        self.inode_refcount.remove(&inode);
        if let Some(bytes) = self.inode_bytes.remove(&inode) {
          self.total_bytes = self.total_bytes.saturating_sub(bytes);
        }
      }
    }
  }
}

/// The local mirror's view of one tracked file, as read from `stat`.
struct StatInfo {
  inode: u64,
  bytes: u64,
}

fn stat(root: &Path, name: &str) -> Option<StatInfo> {
  let meta = std::fs::metadata(root.join(name)).ok()?;
  Some(StatInfo {
    inode: meta.ino(),
    bytes: meta.size(),
  })
}

/// Byte-budgeted mirror of remote artifacts under `root`, evicted FIFO once `max_bytes` is
/// exceeded. Safe for concurrent use within one process; coordinating multiple worker processes
/// sharing one `root` is the caller's responsibility (see the distributed-lock-guarded callers
/// in the memoization layer).
pub struct LocalMirror {
  root: PathBuf,
  max_bytes: u64,
  check_every: Duration,
  state: Mutex<MirrorState>,
}

impl LocalMirror {
  pub fn new(root: PathBuf, max_bytes: u64, check_every: Duration) -> LocalMirror {
    LocalMirror {
      root,
      max_bytes,
      check_every,
      state: Mutex::new(MirrorState::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn resolve(&self, name: &str) -> PathBuf {
    self.root.join(name)
  }

  /// Registers `name` as freshly-populated (or just-touched), evicting head-of-deque entries
  /// first if the budget is exceeded. If `name` no longer exists on disk, purges it instead.
  pub fn add(&self, name: &str) {
    loop {
      let should_evict = {
        let state = self.state.lock();
        state.total_bytes >= self.max_bytes && !state.deque.is_empty()
      };
      if !should_evict {
        break;
      }
      self.popleft();
    }

    let Some(info) = stat(&self.root, name) else {
      self.state.lock().purge(name);
      return;
    };

    let mut state = self.state.lock();
    if let Some(pos) = state.deque.iter().position(|n| n == name) {
      state.deque.remove(pos);
    }
    state.deque.push_back(name.to_string());

    let previous_inode = state.fn_to_inode.insert(name.to_string(), info.inode);
    if let Some(previous) = previous_inode {
      if previous != info.inode {
        state.release_inode(previous);
      } else {
        // Already accounted for under this inode; nothing further to do.
        return;
      }
    }
    *state.inode_refcount.entry(info.inode).or_insert(0) += 1;
    if !state.inode_bytes.contains_key(&info.inode) {
      state.inode_bytes.insert(info.inode, info.bytes);
      state.total_bytes += info.bytes;
    }
  }

  /// Membership test that also refreshes recency. Returns `false` (and purges bookkeeping) if
  /// the file has disappeared from under the mirror.
  pub fn contains(&self, name: &str) -> bool {
    let tracked = self.state.lock().fn_to_inode.contains_key(name);
    if !tracked {
      return false;
    }
    if stat(&self.root, name).is_none() {
      self.state.lock().purge(name);
      return false;
    }
    self.add(name);
    true
  }

  /// Evicts the oldest entry: best-effort unlink, then release its inode accounting.
  pub fn popleft(&self) -> Option<String> {
    let name = {
      let mut state = self.state.lock();
      state.deque.pop_front()?
    };

    if let Err(e) = std::fs::remove_file(self.root.join(&name)) {
      if e.kind() != std::io::ErrorKind::NotFound {
        log::warn!("failed to unlink evicted mirror entry {name:?}: {e}");
      }
    }

    let mut state = self.state.lock();
    if let Some(inode) = state.fn_to_inode.remove(&name) {
      state.release_inode(inode);
    }
    Some(name)
  }

  pub fn size(&self) -> u64 {
    self.state.lock().total_bytes
  }

  pub fn len(&self) -> usize {
    self.state.lock().deque.len()
  }

  /// Re-stats every tracked file and reconciles drift (files removed out-of-band, or whose size
  /// changed), but only if `check_every` has elapsed since the last check. Intended to be called
  /// periodically by a background task.
  pub fn maybe_self_check(&self) {
    {
      let state = self.state.lock();
      if state.checked_at.elapsed() < self.check_every {
        return;
      }
    }
    self.self_check();
  }

  pub fn self_check(&self) {
    let names: Vec<String> = {
      let mut state = self.state.lock();
      state.checked_at = Instant::now();
      state.deque.iter().cloned().collect()
    };

    for name in names {
      match stat(&self.root, &name) {
        None => self.state.lock().purge(&name),
        Some(info) => {
          let mut state = self.state.lock();
          let recorded_inode = state.fn_to_inode.get(&name).copied();
          match recorded_inode {
            Some(inode) if inode == info.inode => {
              // Reconcile a size drift under the same inode (e.g. truncation out-of-band).
              if let Some(recorded_bytes) = state.inode_bytes.get(&inode).copied() {
                if recorded_bytes != info.bytes {
                  state.total_bytes = state.total_bytes.saturating_sub(recorded_bytes) + info.bytes;
                  state.inode_bytes.insert(inode, info.bytes);
                }
              }
            }
            Some(old_inode) => {
              state.release_inode(old_inode);
              *state.inode_refcount.entry(info.inode).or_insert(0) += 1;
              state.inode_bytes.entry(info.inode).or_insert(info.bytes);
              state.fn_to_inode.insert(name.clone(), info.inode);
            }
            None => {
              state.fn_to_inode.insert(name.clone(), info.inode);
              *state.inode_refcount.entry(info.inode).or_insert(0) += 1;
              if !state.inode_bytes.contains_key(&info.inode) {
                state.inode_bytes.insert(info.inode, info.bytes);
                state.total_bytes += info.bytes;
              }
            }
          }
        }
      }
    }
  }
}
