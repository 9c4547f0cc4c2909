use crate::middleware::AuthenticatedUser;
use access_control::{AuthorizationBackend, Permission, Session};
use actix_web::dev::ResourceDef;
use actix_web::http::Method;
use app_error::AppError;
use tracing::{debug, error};

/// Operations the gateway can require for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
  Read,
  Create,
  Update,
  Delete,
}

impl Action {
  /// Standard method-to-operation override. Methods outside the table fall
  /// back to the matched route's default action.
  pub fn from_method(method: &Method) -> Option<Self> {
    match *method {
      Method::GET => Some(Action::Read),
      Method::POST => Some(Action::Create),
      Method::PUT | Method::PATCH => Some(Action::Update),
      Method::DELETE => Some(Action::Delete),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Action::Read => "read",
      Action::Create => "create",
      Action::Update => "update",
      Action::Delete => "delete",
    }
  }
}

pub struct RouteMapping {
  pattern: ResourceDef,
  resource_type: String,
  default_action: Action,
}

impl RouteMapping {
  pub fn resource_type(&self) -> &str {
    &self.resource_type
  }

  pub fn default_action(&self) -> Action {
    self.default_action
  }
}

/// Ordered table of path patterns to protected resource types. Resolution
/// takes the first matching pattern; a path with no mapping is denied, never
/// allowed through.
#[derive(Default)]
pub struct RouteTable {
  mappings: Vec<RouteMapping>,
}

impl RouteTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route<T: Into<String>>(mut self, pattern: &str, resource_type: T, default_action: Action) -> Self {
    self.mappings.push(RouteMapping {
      pattern: ResourceDef::new(pattern),
      resource_type: resource_type.into(),
      default_action,
    });
    self
  }

  pub fn resolve(&self, path: &str) -> Option<&RouteMapping> {
    self.mappings.iter().find(|m| m.pattern.is_match(path))
  }
}

/// Decide whether the authenticated user may perform `method` on `path`.
///
/// Every uncertainty resolves to denial: an unmapped path, a backend denial,
/// and a backend failure all surface as the same access-denied error. No
/// exception escapes as anything else.
pub async fn authorize<B>(
  backend: &B,
  user: &AuthenticatedUser,
  method: &Method,
  path: &str,
  table: &RouteTable,
) -> Result<(), AppError>
where
  B: AuthorizationBackend,
{
  let denied = || AppError::NotEnoughPermissions {
    user: user.user_id.clone(),
    action: format!("{} {}", method, path),
  };

  let mapping = match table.resolve(path) {
    Some(mapping) => mapping,
    None => {
      debug!("[gateway]: no route mapping for {}, denying", path);
      return Err(denied());
    },
  };

  let action = Action::from_method(method).unwrap_or_else(|| mapping.default_action());
  let permission = Permission::new(mapping.resource_type(), action.as_str());
  let session = Session::new(user.session_id.as_str(), user.user_id.as_str());

  match backend.check_access(&session, &permission).await {
    Ok(true) => Ok(()),
    Ok(false) => Err(denied()),
    Err(err) => {
      if !err.is_not_enough_permissions() {
        error!("[gateway]: access check failed for {}: {}", path, err);
      }
      Err(denied())
    },
  }
}
