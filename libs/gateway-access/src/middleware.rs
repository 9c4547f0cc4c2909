use crate::route::{authorize, RouteTable};
use access_control::AuthorizationBackend;
use actix_service::{forward_ready, Service, Transform};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::{Error, HttpMessage};
use app_error::AppError;
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::sync::Arc;
use tracing::debug;

/// Identity extracted from the validated token by the authentication layer,
/// installed into the request extensions before this middleware runs.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
  pub session_id: String,
  pub user_id: String,
}

impl AuthenticatedUser {
  pub fn new<S: Into<String>, U: Into<String>>(session_id: S, user_id: U) -> Self {
    Self {
      session_id: session_id.into(),
      user_id: user_id.into(),
    }
  }
}

/// Policy-enforcement point at the network boundary: every request is
/// matched against the route table and checked against the authorization
/// backend before it reaches a handler.
pub struct GatewayAccessControl<B> {
  backend: Arc<B>,
  table: Arc<RouteTable>,
}

impl<B> GatewayAccessControl<B> {
  pub fn new(backend: Arc<B>, table: Arc<RouteTable>) -> Self {
    Self { backend, table }
  }
}

impl<B> Clone for GatewayAccessControl<B> {
  fn clone(&self) -> Self {
    Self {
      backend: self.backend.clone(),
      table: self.table.clone(),
    }
  }
}

impl<S, Bdy, B> Transform<S, ServiceRequest> for GatewayAccessControl<B>
where
  S: Service<ServiceRequest, Response = ServiceResponse<Bdy>, Error = Error>,
  S::Future: 'static,
  Bdy: 'static,
  B: AuthorizationBackend,
{
  type Response = ServiceResponse<Bdy>;
  type Error = Error;
  type Transform = GatewayAccessControlMiddleware<S, B>;
  type InitError = ();
  type Future = Ready<Result<Self::Transform, Self::InitError>>;

  fn new_transform(&self, service: S) -> Self::Future {
    ready(Ok(GatewayAccessControlMiddleware {
      service,
      backend: self.backend.clone(),
      table: self.table.clone(),
    }))
  }
}

pub struct GatewayAccessControlMiddleware<S, B> {
  service: S,
  backend: Arc<B>,
  table: Arc<RouteTable>,
}

impl<S, Bdy, B> Service<ServiceRequest> for GatewayAccessControlMiddleware<S, B>
where
  S: Service<ServiceRequest, Response = ServiceResponse<Bdy>, Error = Error>,
  S::Future: 'static,
  Bdy: 'static,
  B: AuthorizationBackend,
{
  type Response = ServiceResponse<Bdy>;
  type Error = Error;
  type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

  forward_ready!(service);

  fn call(&self, req: ServiceRequest) -> Self::Future {
    let user = req.extensions().get::<AuthenticatedUser>().cloned();
    let method = req.method().clone();
    let path = req.path().to_string();
    let backend = self.backend.clone();
    let table = self.table.clone();

    let fut = self.service.call(req);
    Box::pin(async move {
      let user = match user {
        Some(user) => user,
        None => {
          debug!("[gateway]: no authenticated identity for {} {}", method, path);
          return Err(Error::from(AppError::NotLoggedIn(format!(
            "{} {}",
            method, path
          ))));
        },
      };

      if let Err(err) = authorize(backend.as_ref(), &user, &method, &path, &table).await {
        debug!("[gateway]: denied {} {} for {}", method, path, user.user_id);
        return Err(Error::from(err));
      }

      fut.await
    })
  }
}
