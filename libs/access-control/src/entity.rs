use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Describes an authorizable action: can an actor perform `operation` on a
/// resource of `resource_type`, optionally narrowed to one instance.
///
/// Identity is structural over `(resource_type, operation, resource_id)` so
/// that two requests for the same action share cache and map entries. The
/// ownership/administrative flags are evaluation hints for the backend and
/// do not participate in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
  resource_type: String,
  operation: String,
  resource_id: Option<String>,
  requires_ownership: bool,
  is_administrative: bool,
}

impl Permission {
  pub fn new<T: Into<String>, O: Into<String>>(resource_type: T, operation: O) -> Self {
    Self {
      resource_type: resource_type.into(),
      operation: operation.into(),
      resource_id: None,
      requires_ownership: false,
      is_administrative: false,
    }
  }

  pub fn with_resource_id<I: Into<String>>(mut self, resource_id: I) -> Self {
    self.resource_id = Some(resource_id.into());
    self
  }

  pub fn require_ownership(mut self) -> Self {
    self.requires_ownership = true;
    self
  }

  pub fn administrative(mut self) -> Self {
    self.is_administrative = true;
    self
  }

  pub fn resource_type(&self) -> &str {
    &self.resource_type
  }

  pub fn operation(&self) -> &str {
    &self.operation
  }

  pub fn resource_id(&self) -> Option<&str> {
    self.resource_id.as_deref()
  }

  pub fn requires_ownership(&self) -> bool {
    self.requires_ownership
  }

  pub fn is_administrative(&self) -> bool {
    self.is_administrative
  }

  /// Policy string used to build cache keys: `resource_type:operation:resource_id`,
  /// with an empty trailing segment when no instance is targeted.
  pub fn policy_key(&self) -> String {
    format!(
      "{}:{}:{}",
      self.resource_type,
      self.operation,
      self.resource_id.as_deref().unwrap_or("")
    )
  }
}

impl PartialEq for Permission {
  fn eq(&self, other: &Self) -> bool {
    self.resource_type == other.resource_type
      && self.operation == other.operation
      && self.resource_id == other.resource_id
  }
}

impl Eq for Permission {}

impl Hash for Permission {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.resource_type.hash(state);
    self.operation.hash(state);
    self.resource_id.hash(state);
  }
}

/// How a composite's sub-permission results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombinePolicy {
  /// Every sub-permission must be granted (logical AND).
  AllRequired,
  /// A single granted sub-permission suffices (logical OR).
  AnyOf,
}

/// A permission aggregated from sub-permissions with an explicit AND/OR
/// policy. This is a different composition surface than the conjunctive
/// `has_permissions` call: the policy here is an opt-in per composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositePermission {
  sub_permissions: Vec<Permission>,
  policy: CombinePolicy,
}

impl CompositePermission {
  pub fn new(sub_permissions: Vec<Permission>, policy: CombinePolicy) -> Self {
    Self {
      sub_permissions,
      policy,
    }
  }

  pub fn sub_permissions(&self) -> &[Permission] {
    &self.sub_permissions
  }

  pub fn policy(&self) -> CombinePolicy {
    self.policy
  }
}

/// Argument type of the façade's single-permission entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionCheck {
  Single(Permission),
  Composite(CompositePermission),
}

impl From<Permission> for PermissionCheck {
  fn from(permission: Permission) -> Self {
    PermissionCheck::Single(permission)
  }
}

impl From<CompositePermission> for PermissionCheck {
  fn from(composite: CompositePermission) -> Self {
    PermissionCheck::Composite(composite)
  }
}

/// An authenticated actor's runtime context. Owned by the authentication
/// subsystem; this crate only reads from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
  pub session_id: String,
  pub user_id: String,
  pub authenticated: bool,
}

impl Session {
  pub fn new<S: Into<String>, U: Into<String>>(session_id: S, user_id: U) -> Self {
    Self {
      session_id: session_id.into(),
      user_id: user_id.into(),
      authenticated: true,
    }
  }
}

/// Permission shape returned by the authorization backend's enumeration,
/// consumed only by the preload path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPermission {
  pub obj_name: String,
  pub op_name: String,
  pub obj_id: Option<String>,
}

impl BackendPermission {
  pub fn new<T: Into<String>, O: Into<String>>(obj_name: T, op_name: O) -> Self {
    Self {
      obj_name: obj_name.into(),
      op_name: op_name.into(),
      obj_id: None,
    }
  }

  pub fn with_obj_id<I: Into<String>>(mut self, obj_id: I) -> Self {
    self.obj_id = Some(obj_id.into());
    self
  }

  /// A preloaded entry satisfies a request when type and operation match and
  /// the request either targets no specific instance or targets this one.
  pub fn matches(&self, requested: &Permission) -> bool {
    self.obj_name == requested.resource_type()
      && self.op_name == requested.operation()
      && match requested.resource_id() {
        None => true,
        Some(id) => self.obj_id.as_deref() == Some(id),
      }
  }
}
