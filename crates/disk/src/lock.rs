use crate::options::VolumeRequest;
use std::{
  collections::HashMap,
  fmt,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Identity of a lockable resource: one disk on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceLockKey {
  node_id: String,
  disk_id: String,
}

impl ResourceLockKey {
  pub fn new(node_id: impl Into<String>, disk_id: impl Into<String>) -> Self {
    ResourceLockKey {
      node_id: node_id.into(),
      disk_id: disk_id.into(),
    }
  }
}

impl From<&VolumeRequest> for ResourceLockKey {
  fn from(request: &VolumeRequest) -> Self {
    ResourceLockKey::new(request.node_id(), request.disk_id())
  }
}

impl fmt::Display for ResourceLockKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.node_id, self.disk_id)
  }
}

type Slot = Arc<AsyncMutex<()>>;
type Table = Arc<Mutex<HashMap<ResourceLockKey, Slot>>>;

/// Serializes operations on the same resource while letting operations on
/// different resources run in parallel. Entries are dropped once nobody
/// holds or waits for them.
#[derive(Clone, Default)]
pub struct LockManager {
  table: Table,
}

impl fmt::Debug for LockManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockManager")
      .field("entries", &self.table().len())
      .finish()
  }
}

impl LockManager {
  pub fn new() -> Self {
    Self::default()
  }

  fn table(&self) -> MutexGuard<'_, HashMap<ResourceLockKey, Slot>> {
    self.table.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Waits until the resource is free and takes it. The resource is released
  /// when the returned guard is dropped, including when the owning future is
  /// cancelled.
  pub async fn acquire(&self, key: ResourceLockKey) -> ResourceGuard {
    let slot = {
      let mut table = self.table();
      table.retain(|_, slot| Arc::strong_count(slot) > 1);
      table.entry(key.clone()).or_default().clone()
    };

    trace!(%key, "waiting for resource lock");
    let guard = slot.clone().lock_owned().await;
    trace!(%key, "resource lock acquired");

    ResourceGuard {
      guard: Some(guard),
      slot,
      key,
      table: self.table.clone(),
    }
  }

  /// Number of resources currently tracked.
  pub fn len(&self) -> usize {
    self.table().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[must_use = "the resource is released as soon as the guard is dropped"]
pub struct ResourceGuard {
  guard: Option<OwnedMutexGuard<()>>,
  slot: Slot,
  key: ResourceLockKey,
  table: Table,
}

impl ResourceGuard {
  #[inline]
  pub fn key(&self) -> &ResourceLockKey {
    &self.key
  }
}

impl fmt::Debug for ResourceGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResourceGuard").field("key", &self.key).finish()
  }
}

impl Drop for ResourceGuard {
  fn drop(&mut self) {
    drop(self.guard.take());

    let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
    // One reference is held by the table and one by this guard.
    if Arc::strong_count(&self.slot) <= 2 {
      if let Some(slot) = table.get(&self.key) {
        if Arc::ptr_eq(slot, &self.slot) {
          table.remove(&self.key);
        }
      }
    }
    trace!(key = %self.key, "resource lock released");
  }
}
