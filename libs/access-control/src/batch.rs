use crate::backend::AuthorizationBackend;
use crate::entity::{BackendPermission, Permission, Session};
use crate::memory::MemoryPressure;
use app_error::AppError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadSettings {
  /// Lifetime of a preloaded resource-type set.
  pub preload_ttl: Duration,
  /// Upper bound on concurrently preloaded resource types.
  pub max_preloaded_types: usize,
  /// Interval between passes removing expired preload entries.
  pub gc_interval: Duration,
  /// Used/max ratio above which preloads evict before inserting.
  pub memory_pressure_threshold: f64,
  /// How long shutdown waits for the GC task before aborting it.
  pub shutdown_timeout: Duration,
}

impl Default for PreloadSettings {
  fn default() -> Self {
    Self {
      preload_ttl: Duration::from_secs(60 * 60),
      max_preloaded_types: 100,
      gc_interval: Duration::from_secs(15 * 60),
      memory_pressure_threshold: 0.85,
      shutdown_timeout: Duration::from_secs(60),
    }
  }
}

struct PreloadedSet {
  permissions: Vec<BackendPermission>,
  loaded_at: Instant,
  ttl: Duration,
  /// Monotonic access stamp for strict LRU eviction. A sequence counter
  /// rather than wall time so concurrent touches stay totally ordered.
  last_access: AtomicU64,
}

impl PreloadedSet {
  fn is_expired(&self) -> bool {
    self.loaded_at.elapsed() > self.ttl
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadStats {
  pub total_types: usize,
  pub active_types: usize,
  pub expired_types: usize,
  pub total_permissions: usize,
}

/// Evaluates a set of permissions in one pass. A per-resource-type index of
/// preloaded backend permissions answers most requests without a backend
/// round-trip; everything else falls back to one `check_access` call per
/// permission, fail-closed on error.
pub struct BatchPermissionChecker<B> {
  backend: Arc<B>,
  preloaded: Arc<DashMap<String, PreloadedSet>>,
  pressure: Arc<dyn MemoryPressure>,
  settings: PreloadSettings,
  access_seq: AtomicU64,
  gc_token: CancellationToken,
  gc_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B> BatchPermissionChecker<B>
where
  B: AuthorizationBackend,
{
  pub fn new(backend: Arc<B>, pressure: Arc<dyn MemoryPressure>, settings: PreloadSettings) -> Self {
    let preloaded: Arc<DashMap<String, PreloadedSet>> = Arc::new(DashMap::new());
    let gc_token = CancellationToken::new();
    let gc_handle = tokio::spawn(run_gc(
      preloaded.clone(),
      settings.gc_interval,
      gc_token.clone(),
    ));
    Self {
      backend,
      preloaded,
      pressure,
      settings,
      access_seq: AtomicU64::new(0),
      gc_token,
      gc_handle: Mutex::new(Some(gc_handle)),
    }
  }

  /// Evaluate every requested permission. A permission satisfied by a fresh
  /// preloaded set is granted without a backend call; otherwise the backend
  /// is asked. A failing backend call records `false` for that permission
  /// and never aborts the rest of the batch.
  pub async fn check_permissions(
    &self,
    session: &Session,
    permissions: &[Permission],
  ) -> HashMap<Permission, bool> {
    let mut results = HashMap::with_capacity(permissions.len());
    for permission in permissions {
      let granted = if self.preloaded_grant(permission) {
        trace!(
          "[access control]: {} granted from preloaded set",
          permission.policy_key()
        );
        true
      } else {
        match self.backend.check_access(session, permission).await {
          Ok(granted) => granted,
          Err(err) if err.is_not_enough_permissions() => {
            trace!(
              "[access control]: backend denied {} for session {}",
              permission.policy_key(),
              session.session_id
            );
            false
          },
          Err(err) => {
            // Fail-closed: an unreachable backend grants nothing.
            error!(
              "[access control]: backend check failed for {}: {}",
              permission.policy_key(),
              err
            );
            false
          },
        }
      };
      results.insert(permission.clone(), granted);
    }
    results
  }

  /// Fetch and index the full permission set for a resource type. Evicts
  /// least-recently-accessed sets first when at capacity or under memory
  /// pressure.
  pub async fn preload_permissions(&self, resource_type: &str) -> Result<(), AppError> {
    let permissions = self
      .backend
      .permissions_for_resource_type(resource_type)
      .await?;

    self.evict_for_capacity();

    trace!(
      "[access control]: preloaded {} permissions for resource type {}",
      permissions.len(),
      resource_type
    );
    self.preloaded.insert(
      resource_type.to_string(),
      PreloadedSet {
        permissions,
        loaded_at: Instant::now(),
        ttl: self.settings.preload_ttl,
        last_access: AtomicU64::new(self.next_access_stamp()),
      },
    );
    Ok(())
  }

  /// Drop one resource type's preload entry, e.g. after a policy change.
  pub fn clear_preloaded_permissions(&self, resource_type: &str) {
    self.preloaded.remove(resource_type);
  }

  pub fn stats(&self) -> PreloadStats {
    let mut total_types = 0;
    let mut expired_types = 0;
    let mut total_permissions = 0;
    for entry in self.preloaded.iter() {
      total_types += 1;
      if entry.value().is_expired() {
        expired_types += 1;
      }
      total_permissions += entry.value().permissions.len();
    }
    PreloadStats {
      total_types,
      active_types: total_types - expired_types,
      expired_types,
      total_permissions,
    }
  }

  /// Stop the GC task, wait for it to drain, then drop the index. Ordering
  /// matters: a GC pass must not race the clear.
  pub async fn shutdown(&self) {
    self.gc_token.cancel();
    let handle = self.gc_handle.lock().unwrap().take();
    if let Some(handle) = handle {
      let abort = handle.abort_handle();
      if timeout(self.settings.shutdown_timeout, handle).await.is_err() {
        warn!("[access control]: preload GC task did not stop in time, aborting");
        abort.abort();
      }
    }
    self.preloaded.clear();
  }

  fn preloaded_grant(&self, permission: &Permission) -> bool {
    match self.preloaded.get(permission.resource_type()) {
      Some(set) if !set.is_expired() => {
        set
          .last_access
          .store(self.next_access_stamp(), Ordering::Relaxed);
        set.permissions.iter().any(|p| p.matches(permission))
      },
      // Expired sets are left for the GC pass; the backend answers instead.
      _ => false,
    }
  }

  fn next_access_stamp(&self) -> u64 {
    self.access_seq.fetch_add(1, Ordering::Relaxed) + 1
  }

  fn evict_for_capacity(&self) {
    loop {
      let over_capacity = self.preloaded.len() >= self.settings.max_preloaded_types;
      let pressured = self.pressure.usage_ratio() > self.settings.memory_pressure_threshold;
      if !over_capacity && !pressured {
        break;
      }

      let lru = self
        .preloaded
        .iter()
        .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
        .map(|entry| entry.key().clone());
      match lru {
        Some(resource_type) => {
          trace!(
            "[access control]: evicting least-recently-used preload set {}",
            resource_type
          );
          self.preloaded.remove(&resource_type);
        },
        None => break,
      }
    }
  }
}

/// Lighter than the cache GC: removes only expired preload entries, never a
/// full clear.
async fn run_gc(
  preloaded: Arc<DashMap<String, PreloadedSet>>,
  gc_interval: Duration,
  token: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = sleep(gc_interval) => {},
    }

    let before = preloaded.len();
    preloaded.retain(|_, set| !set.is_expired());
    trace!(
      "[access control]: preload GC removed {} expired resource types",
      before.saturating_sub(preloaded.len())
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::AuthorizationBackend;
  use crate::memory::StaticMemoryPressure;
  use anyhow::anyhow;
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct MockBackend {
    grants: DashMap<String, bool>,
    preload_sets: DashMap<String, Vec<BackendPermission>>,
    check_calls: AtomicUsize,
    fail_on: Option<String>,
  }

  impl MockBackend {
    fn grant(self, permission: &Permission, granted: bool) -> Self {
      self.grants.insert(permission.policy_key(), granted);
      self
    }

    fn preload_set(self, resource_type: &str, permissions: Vec<BackendPermission>) -> Self {
      self.preload_sets.insert(resource_type.to_string(), permissions);
      self
    }

    fn fail_on(mut self, permission: &Permission) -> Self {
      self.fail_on = Some(permission.policy_key());
      self
    }

    fn calls(&self) -> usize {
      self.check_calls.load(Ordering::Relaxed)
    }
  }

  #[async_trait]
  impl AuthorizationBackend for MockBackend {
    async fn check_access(
      &self,
      _session: &Session,
      permission: &Permission,
    ) -> Result<bool, AppError> {
      self.check_calls.fetch_add(1, Ordering::Relaxed);
      let key = permission.policy_key();
      if self.fail_on.as_deref() == Some(key.as_str()) {
        return Err(AppError::Internal(anyhow!("backend unavailable")));
      }
      Ok(self.grants.get(&key).map(|v| *v).unwrap_or(false))
    }

    async fn permissions_for_resource_type(
      &self,
      resource_type: &str,
    ) -> Result<Vec<BackendPermission>, AppError> {
      self
        .preload_sets
        .get(resource_type)
        .map(|v| v.value().clone())
        .ok_or_else(|| AppError::RecordNotFound(resource_type.to_string()))
    }
  }

  fn checker(backend: MockBackend, settings: PreloadSettings) -> BatchPermissionChecker<MockBackend> {
    BatchPermissionChecker::new(
      Arc::new(backend),
      Arc::new(StaticMemoryPressure::new(0.0)),
      settings,
    )
  }

  fn session() -> Session {
    Session::new("S1", "u1")
  }

  #[tokio::test]
  async fn backend_error_records_false_without_aborting_batch() {
    let read = Permission::new("project", "read");
    let write = Permission::new("project", "write");
    let backend = MockBackend::default().grant(&read, true).fail_on(&write);
    let checker = checker(backend, PreloadSettings::default());

    let results = checker.check_permissions(&session(), &[read.clone(), write.clone()]).await;
    assert_eq!(results.get(&read), Some(&true));
    assert_eq!(results.get(&write), Some(&false));
    checker.shutdown().await;
  }

  #[tokio::test]
  async fn backend_denial_is_plain_false() {
    let read = Permission::new("project", "read");
    let backend = MockBackend::default(); // nothing granted
    let checker = checker(backend, PreloadSettings::default());

    let results = checker.check_permissions(&session(), std::slice::from_ref(&read)).await;
    assert_eq!(results.get(&read), Some(&false));
    checker.shutdown().await;
  }

  #[tokio::test]
  async fn preload_short_circuits_backend() {
    let backend = MockBackend::default().preload_set(
      "task",
      vec![
        BackendPermission::new("task", "read"),
        BackendPermission::new("task", "write"),
      ],
    );
    let checker = checker(backend, PreloadSettings::default());
    checker.preload_permissions("task").await.unwrap();

    let read = Permission::new("task", "read");
    let write = Permission::new("task", "write");
    let results = checker.check_permissions(&session(), &[read.clone(), write.clone()]).await;
    assert_eq!(results.get(&read), Some(&true));
    assert_eq!(results.get(&write), Some(&true));
    assert_eq!(checker.backend.calls(), 0);
    checker.shutdown().await;
  }

  #[tokio::test]
  async fn preload_miss_falls_back_to_backend() {
    let delete = Permission::new("task", "delete");
    let backend = MockBackend::default()
      .preload_set("task", vec![BackendPermission::new("task", "read")])
      .grant(&delete, true);
    let checker = checker(backend, PreloadSettings::default());
    checker.preload_permissions("task").await.unwrap();

    let results = checker.check_permissions(&session(), std::slice::from_ref(&delete)).await;
    assert_eq!(results.get(&delete), Some(&true));
    assert_eq!(checker.backend.calls(), 1);
    checker.shutdown().await;
  }

  #[tokio::test]
  async fn expired_preload_set_is_ignored() {
    let backend = MockBackend::default()
      .preload_set("task", vec![BackendPermission::new("task", "read")]);
    let checker = checker(
      backend,
      PreloadSettings {
        preload_ttl: Duration::from_millis(20),
        ..Default::default()
      },
    );
    checker.preload_permissions("task").await.unwrap();
    sleep(Duration::from_millis(40)).await;

    let read = Permission::new("task", "read");
    let results = checker.check_permissions(&session(), std::slice::from_ref(&read)).await;
    // The set expired, so the backend answered (and denies by default).
    assert_eq!(results.get(&read), Some(&false));
    assert_eq!(checker.backend.calls(), 1);
    checker.shutdown().await;
  }

  #[tokio::test]
  async fn lru_eviction_prefers_least_recently_accessed() {
    let backend = MockBackend::default()
      .preload_set("project", vec![BackendPermission::new("project", "read")])
      .preload_set("task", vec![BackendPermission::new("task", "read")])
      .preload_set("report", vec![BackendPermission::new("report", "read")]);
    let checker = checker(
      backend,
      PreloadSettings {
        max_preloaded_types: 2,
        ..Default::default()
      },
    );

    checker.preload_permissions("project").await.unwrap();
    checker.preload_permissions("task").await.unwrap();

    // Touch "project" so "task" becomes the LRU entry.
    checker
      .check_permissions(&session(), &[Permission::new("project", "read")])
      .await;

    checker.preload_permissions("report").await.unwrap();
    assert!(checker.preloaded.contains_key("project"));
    assert!(checker.preloaded.contains_key("report"));
    assert!(!checker.preloaded.contains_key("task"));
    checker.shutdown().await;
  }

  #[tokio::test]
  async fn stats_and_clear() {
    let backend = MockBackend::default().preload_set(
      "task",
      vec![
        BackendPermission::new("task", "read"),
        BackendPermission::new("task", "write"),
      ],
    );
    let checker = checker(backend, PreloadSettings::default());
    checker.preload_permissions("task").await.unwrap();

    let stats = checker.stats();
    assert_eq!(stats.total_types, 1);
    assert_eq!(stats.active_types, 1);
    assert_eq!(stats.expired_types, 0);
    assert_eq!(stats.total_permissions, 2);

    checker.clear_preloaded_permissions("task");
    assert_eq!(checker.stats().total_types, 0);
    checker.shutdown().await;
  }

  #[tokio::test]
  async fn gc_removes_only_expired_sets() {
    let backend = MockBackend::default()
      .preload_set("task", vec![BackendPermission::new("task", "read")])
      .preload_set("project", vec![BackendPermission::new("project", "read")]);
    let checker = BatchPermissionChecker::new(
      Arc::new(backend),
      Arc::new(StaticMemoryPressure::new(0.0)),
      PreloadSettings {
        gc_interval: Duration::from_millis(10),
        ..Default::default()
      },
    );
    checker.preload_permissions("project").await.unwrap();

    // A set with its own short TTL, inserted directly to expire fast.
    checker.preloaded.insert(
      "task".to_string(),
      PreloadedSet {
        permissions: vec![BackendPermission::new("task", "read")],
        loaded_at: Instant::now() - Duration::from_secs(2),
        ttl: Duration::from_secs(1),
        last_access: AtomicU64::new(0),
      },
    );

    sleep(Duration::from_millis(50)).await;
    assert!(checker.preloaded.contains_key("project"));
    assert!(!checker.preloaded.contains_key("task"));
    checker.shutdown().await;
  }
}
