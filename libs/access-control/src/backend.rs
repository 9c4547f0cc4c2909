use crate::entity::{BackendPermission, Permission, Session};
use app_error::AppError;
use async_trait::async_trait;

/// Minimal contract the permission-checking core requires from the RBAC
/// engine behind it. The core never assumes a specific engine's object
/// model: it only checks single permissions and enumerates them per
/// resource type for preloading.
#[async_trait]
pub trait AuthorizationBackend: Send + Sync + 'static {
  /// Check whether the session may perform the permission's action.
  ///
  /// `Ok(false)` and [`AppError::NotEnoughPermissions`] both mean denial;
  /// any other error is an infrastructure failure. Callers in this crate
  /// treat every error as denial (fail-closed).
  async fn check_access(&self, session: &Session, permission: &Permission)
    -> Result<bool, AppError>;

  /// Enumerate the full permission set granted to any actor for a resource
  /// type. Used only by the preload path.
  async fn permissions_for_resource_type(
    &self,
    resource_type: &str,
  ) -> Result<Vec<BackendPermission>, AppError>;
}
