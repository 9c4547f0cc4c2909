use crate::backend::AuthorizationBackend;
use crate::batch::BatchPermissionChecker;
use crate::cache::PermissionCache;
use crate::entity::{CombinePolicy, CompositePermission, Permission, PermissionCheck, Session};
use crate::metrics::{tick_metric, AccessControlMetrics, MetricsCalState};
use app_error::AppError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, instrument, trace};

/// Façade over the permission cache and the batch checker: cache lookup →
/// batch check → cache write-back. Stateless beyond its collaborators;
/// denial is a normal `false`, never an error, except through
/// [`SecurityService::enforce_permissions`].
pub struct SecurityService<B> {
  cache: Arc<PermissionCache>,
  checker: Arc<BatchPermissionChecker<B>>,
  metrics_state: MetricsCalState,
}

impl<B> Clone for SecurityService<B> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      checker: self.checker.clone(),
      metrics_state: self.metrics_state.clone(),
    }
  }
}

impl<B> SecurityService<B>
where
  B: AuthorizationBackend,
{
  pub fn new(
    cache: Arc<PermissionCache>,
    checker: Arc<BatchPermissionChecker<B>>,
    metrics: Arc<AccessControlMetrics>,
  ) -> Self {
    let metrics_state = MetricsCalState::new();
    tick_metric(metrics_state.clone(), metrics);
    Self {
      cache,
      checker,
      metrics_state,
    }
  }

  /// Returns `true` only when every requested permission is granted.
  ///
  /// Conjunctive across positional arguments; this is a different policy
  /// than [`CombinePolicy::AnyOf`] on a composite, which is an explicit
  /// opt-in per composite.
  #[instrument(level = "trace", skip_all)]
  pub async fn has_permissions(&self, session: &Session, permissions: &[Permission]) -> bool {
    if permissions.is_empty() {
      return true;
    }

    self
      .metrics_state
      .total_permission_checks
      .fetch_add(1, Ordering::Relaxed);

    if let Some(granted) = self.cache.get_permissions(session, permissions).await {
      self
        .metrics_state
        .permission_checks_from_cache
        .fetch_add(1, Ordering::Relaxed);
      return granted;
    }

    let results = self.checker.check_permissions(session, permissions).await;
    for (permission, granted) in &results {
      self
        .cache
        .put_permissions(session, std::slice::from_ref(permission), *granted)
        .await;
    }

    let granted = permissions
      .iter()
      .all(|p| results.get(p).copied().unwrap_or(false));
    // Also record under the combined key so the exact same set hits tier-1.
    if permissions.len() > 1 {
      self.cache.put_permissions(session, permissions, granted).await;
    }
    granted
  }

  /// Single entry point for callers holding either a plain or a composite
  /// permission.
  pub async fn has_permission(&self, session: &Session, check: &PermissionCheck) -> bool {
    match check {
      PermissionCheck::Single(permission) => {
        self
          .has_permissions(session, std::slice::from_ref(permission))
          .await
      },
      PermissionCheck::Composite(composite) => {
        self.has_composite_permission(session, composite).await
      },
    }
  }

  /// Evaluate every sub-permission, then reduce per the composite's policy.
  /// No short-circuit: each sub-result must land in the cache even when the
  /// outcome is already decided.
  pub async fn has_composite_permission(
    &self,
    session: &Session,
    composite: &CompositePermission,
  ) -> bool {
    let mut sub_results = Vec::with_capacity(composite.sub_permissions().len());
    for permission in composite.sub_permissions() {
      sub_results.push(
        self
          .has_permissions(session, std::slice::from_ref(permission))
          .await,
      );
    }

    match composite.policy() {
      CombinePolicy::AllRequired => sub_results.iter().all(|granted| *granted),
      CombinePolicy::AnyOf => sub_results.iter().any(|granted| *granted),
    }
  }

  /// Enforcement variant of [`SecurityService::has_permissions`]: denial
  /// becomes an access-denied error carrying the attempted action.
  #[instrument(level = "debug", skip_all, fields(action = %action))]
  pub async fn enforce_permissions(
    &self,
    session: &Session,
    action: &str,
    permissions: &[Permission],
  ) -> Result<(), AppError> {
    if self.has_permissions(session, permissions).await {
      Ok(())
    } else {
      Err(AppError::NotEnoughPermissions {
        user: session.user_id.clone(),
        action: action.to_string(),
      })
    }
  }

  /// Fire-and-forget preload of a resource type's permission set. Failures
  /// are logged, never surfaced; the handle is returned for callers that
  /// want to await completion.
  pub fn preload_permissions(&self, resource_type: &str) -> JoinHandle<()> {
    let checker = self.checker.clone();
    let resource_type = resource_type.to_string();
    tokio::spawn(async move {
      if let Err(err) = checker.preload_permissions(&resource_type).await {
        error!(
          "[access control]: preload of resource type {} failed: {}",
          resource_type, err
        );
      }
    })
  }

  pub fn invalidate_session_permissions(&self, session: &Session) {
    trace!(
      "[access control]: invalidating permissions for session {}",
      session.session_id
    );
    self.cache.invalidate_session(session);
  }

  pub async fn shutdown(&self) {
    self.cache.shutdown().await;
    self.checker.shutdown().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::AuthorizationBackend;
  use crate::batch::PreloadSettings;
  use crate::cache::{CacheSettings, NoSharedCache};
  use crate::entity::BackendPermission;
  use crate::memory::StaticMemoryPressure;
  use async_trait::async_trait;
  use dashmap::DashMap;
  use prometheus_client::registry::Registry;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct MockBackend {
    grants: DashMap<String, bool>,
    check_calls: AtomicUsize,
  }

  impl MockBackend {
    fn grant(self, permission: &Permission, granted: bool) -> Self {
      self.grants.insert(permission.policy_key(), granted);
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
      Ok(
        self
          .grants
          .get(&permission.policy_key())
          .map(|v| *v)
          .unwrap_or(false),
      )
    }

    async fn permissions_for_resource_type(
      &self,
      resource_type: &str,
    ) -> Result<Vec<BackendPermission>, AppError> {
      Err(AppError::RecordNotFound(resource_type.to_string()))
    }
  }

  fn service(backend: MockBackend) -> (SecurityService<MockBackend>, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    let pressure = Arc::new(StaticMemoryPressure::new(0.0));
    let cache = Arc::new(PermissionCache::new(
      Arc::new(NoSharedCache),
      pressure.clone(),
      CacheSettings::default(),
    ));
    let checker = Arc::new(BatchPermissionChecker::new(
      backend.clone(),
      pressure,
      PreloadSettings::default(),
    ));
    let metrics = Arc::new(AccessControlMetrics::register(&mut Registry::default()));
    (SecurityService::new(cache, checker, metrics), backend)
  }

  fn session() -> Session {
    Session::new("S1", "u1")
  }

  #[tokio::test]
  async fn conjunctive_across_arguments() {
    let read = Permission::new("project", "read");
    let write = Permission::new("project", "write");
    let (service, _) = service(MockBackend::default().grant(&read, true).grant(&write, false));

    assert!(service.has_permissions(&session(), std::slice::from_ref(&read)).await);
    assert!(!service.has_permissions(&session(), &[read, write]).await);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn empty_permission_set_is_granted() {
    let (service, backend) = service(MockBackend::default());
    assert!(service.has_permissions(&session(), &[]).await);
    assert_eq!(backend.calls(), 0);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn cache_hit_skips_backend() {
    let read = Permission::new("project", "read");
    let (service, backend) = service(MockBackend::default().grant(&read, true));
    let s = session();

    assert!(service.has_permissions(&s, std::slice::from_ref(&read)).await);
    assert_eq!(backend.calls(), 1);
    assert!(service.has_permissions(&s, std::slice::from_ref(&read)).await);
    assert_eq!(backend.calls(), 1);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn composite_all_required() {
    let read = Permission::new("project", "read");
    let write = Permission::new("project", "write");
    let (service, _) = service(MockBackend::default().grant(&read, true).grant(&write, false));
    let s = session();

    let mixed = CompositePermission::new(
      vec![read.clone(), write.clone()],
      CombinePolicy::AllRequired,
    );
    assert!(!service.has_composite_permission(&s, &mixed).await);

    let all_true = CompositePermission::new(
      vec![read.clone(), read.clone()],
      CombinePolicy::AllRequired,
    );
    assert!(service.has_composite_permission(&s, &all_true).await);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn composite_any_of() {
    let read = Permission::new("project", "read");
    let write = Permission::new("project", "write");
    let (service, _) = service(MockBackend::default().grant(&read, true).grant(&write, false));
    let s = session();

    let any = CompositePermission::new(vec![write.clone(), read.clone()], CombinePolicy::AnyOf);
    assert!(service.has_composite_permission(&s, &any).await);

    let none = CompositePermission::new(vec![write.clone(), write.clone()], CombinePolicy::AnyOf);
    assert!(!service.has_composite_permission(&s, &none).await);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn composite_evaluation_caches_every_sub_permission() {
    let read = Permission::new("project", "read");
    let write = Permission::new("project", "write");
    let (service, backend) = service(MockBackend::default().grant(&read, false).grant(&write, false));
    let s = session();

    let composite = CompositePermission::new(
      vec![read.clone(), write.clone()],
      CombinePolicy::AllRequired,
    );
    assert!(!service.has_composite_permission(&s, &composite).await);
    // Both sub-permissions were evaluated despite the early false.
    assert_eq!(backend.calls(), 2);
    // And both are now answered from cache.
    assert!(!service.has_permissions(&s, std::slice::from_ref(&write)).await);
    assert_eq!(backend.calls(), 2);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn enforce_converts_denial_into_error() {
    let read = Permission::new("project", "read");
    let delete = Permission::new("project", "delete");
    let (service, _) = service(MockBackend::default().grant(&read, true).grant(&delete, false));
    let s = session();

    assert!(service
      .enforce_permissions(&s, "read project", std::slice::from_ref(&read))
      .await
      .is_ok());

    let err = service
      .enforce_permissions(&s, "delete project", std::slice::from_ref(&delete))
      .await
      .unwrap_err();
    assert!(err.is_not_enough_permissions());
    service.shutdown().await;
  }

  #[tokio::test]
  async fn session_invalidation_forces_recheck() {
    let read = Permission::new("project", "read");
    let (service, backend) = service(MockBackend::default().grant(&read, true));
    let s = session();

    assert!(service.has_permissions(&s, std::slice::from_ref(&read)).await);
    service.invalidate_session_permissions(&s);
    assert!(service.has_permissions(&s, std::slice::from_ref(&read)).await);
    assert_eq!(backend.calls(), 2);
    service.shutdown().await;
  }

  #[tokio::test]
  async fn failed_preload_never_surfaces() {
    let (service, _) = service(MockBackend::default());
    // The mock backend has no preload sets, so this logs and completes.
    service.preload_permissions("project").await.unwrap();
    service.shutdown().await;
  }
}
