//! Per-mailbox in-process lock registry.
//!
//! Grounded on `sin::lib`'s `INTERRUPTIONS: Lazy<Mutex<HashMap<ThreadId,
//! Interruption>>>` static: a process-wide `Lazy<Mutex<HashMap<...>>>` guarding a
//! small piece of coordination state, keyed here by canonical mailbox path rather
//! than thread id. This is the one piece of global mutable state this crate
//! carries; it coordinates access, it never holds mailbox content (spec.md §9's
//! "Global mutable state is otherwise banned").
//!
//! Writers take an exclusive lock on the target mailbox directory; readers take a
//! shared lock. Locks are process-local: cross-process coordination is out of
//! scope (spec.md §4.4). Rename/delete order the two paths they touch before
//! locking, to avoid deadlocking against a concurrent operation on the same pair
//! in the opposite order.

use std::{
  collections, path,
  sync::{self, Arc, RwLock},
};

static REGISTRY: once_cell::sync::Lazy<sync::Mutex<collections::HashMap<path::PathBuf, Arc<RwLock<()>>>>> =
  once_cell::sync::Lazy::new(|| sync::Mutex::new(collections::HashMap::new()));

static OPEN_COUNTS: once_cell::sync::Lazy<sync::Mutex<collections::HashMap<path::PathBuf, usize>>> =
  once_cell::sync::Lazy::new(|| sync::Mutex::new(collections::HashMap::new()));

/// RAII marker that a mailbox directory has a live `Mailbox` handle open against
/// it. Held for the handle's lifetime; `delete_mailbox`/`rename_mailbox` consult
/// [`is_open`] to refuse to touch a mailbox someone else is using (spec.md §5's
/// `InUse` error).
pub struct OpenGuard(path::PathBuf);

impl Drop for OpenGuard {
  fn drop(&mut self) {
    let mut counts = OPEN_COUNTS.lock().unwrap();
    if let collections::hash_map::Entry::Occupied(mut entry) = counts.entry(self.0.clone()) {
      *entry.get_mut() -= 1;
      if *entry.get() == 0 {
        entry.remove();
      }
    }
  }
}

pub fn mark_open(path: &path::Path) -> OpenGuard {
  *OPEN_COUNTS.lock().unwrap().entry(path.to_path_buf()).or_insert(0) += 1;
  OpenGuard(path.to_path_buf())
}

pub fn is_open(path: &path::Path) -> bool {
  OPEN_COUNTS.lock().unwrap().contains_key(path)
}

/// Returns the shared lock handle for `path`, creating one if this is the first
/// mailbox handle to reference it. Cheap to call repeatedly; callers typically
/// stash the returned `Arc` on their `Mailbox`/`MailboxStore` instance.
pub fn handle(path: &path::Path) -> Arc<RwLock<()>> {
  REGISTRY
    .lock()
    .unwrap()
    .entry(path.to_path_buf())
    .or_insert_with(|| Arc::new(RwLock::new(())))
    .clone()
}

/// Returns the two handles for `a` and `b` paired so that callers who always
/// acquire in the order returned here never deadlock against each other,
/// regardless of which order `a`/`b` were originally supplied in.
pub fn handle_pair(a: &path::Path, b: &path::Path) -> (Arc<RwLock<()>>, Arc<RwLock<()>>) {
  if a <= b {
    (handle(a), handle(b))
  } else {
    (handle(b), handle(a))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_path_returns_same_handle() {
    let path = path::Path::new("/tmp/example");
    assert!(Arc::ptr_eq(&handle(path), &handle(path)));
  }

  #[test]
  fn pair_is_order_independent() {
    let a = path::Path::new("/tmp/a");
    let b = path::Path::new("/tmp/b");
    let (first, second) = handle_pair(a, b);
    let (first_rev, second_rev) = handle_pair(b, a);
    assert!(Arc::ptr_eq(&first, &first_rev));
    assert!(Arc::ptr_eq(&second, &second_rev));
  }

  #[test]
  fn open_guard_tracks_and_releases() {
    let path = path::Path::new("/tmp/example-open");
    assert!(!is_open(path));
    let guard = mark_open(path);
    assert!(is_open(path));
    drop(guard);
    assert!(!is_open(path));
  }

  #[test]
  fn open_guard_counts_multiple_holders() {
    let path = path::Path::new("/tmp/example-open-multi");
    let a = mark_open(path);
    let b = mark_open(path);
    drop(a);
    assert!(is_open(path));
    drop(b);
    assert!(!is_open(path));
  }
}
