use thiserror::Error;

#[derive(Debug, Error, Default)]
pub enum AppError {
  #[error("Operation completed successfully.")]
  #[default]
  Ok,

  #[error(transparent)]
  Internal(#[from] anyhow::Error),

  #[error("Record not found:{0}")]
  RecordNotFound(String),

  #[error("Invalid request:{0}")]
  InvalidRequest(String),

  #[error("Not Logged In:{0}")]
  NotLoggedIn(String),

  #[error("{user}: do not have permissions to {action}")]
  NotEnoughPermissions { user: String, action: String },

  #[error("Network error:{0}")]
  NetworkError(String),
}

impl AppError {
  pub fn is_not_enough_permissions(&self) -> bool {
    matches!(self, AppError::NotEnoughPermissions { .. })
  }

  pub fn code(&self) -> ErrorCode {
    match self {
      AppError::Ok => ErrorCode::Ok,
      AppError::Internal(_) => ErrorCode::Internal,
      AppError::RecordNotFound(_) => ErrorCode::RecordNotFound,
      AppError::InvalidRequest(_) => ErrorCode::InvalidRequest,
      AppError::NotLoggedIn(_) => ErrorCode::NotLoggedIn,
      AppError::NotEnoughPermissions { .. } => ErrorCode::NotEnoughPermissions,
      AppError::NetworkError(_) => ErrorCode::NetworkError,
    }
  }
}

#[derive(
  Eq,
  PartialEq,
  Copy,
  Debug,
  Clone,
  serde_repr::Serialize_repr,
  serde_repr::Deserialize_repr,
  Default,
)]
#[repr(i32)]
pub enum ErrorCode {
  #[default]
  Ok = 0,
  RecordNotFound = -2,
  InvalidRequest = 1008,
  NotLoggedIn = 1011,
  NotEnoughPermissions = 1012,
  Internal = 1017,
  NetworkError = 1023,
}

impl ErrorCode {
  pub fn value(&self) -> i32 {
    *self as i32
  }
}

#[cfg(feature = "actix_web_error")]
#[derive(serde::Serialize)]
struct AppErrorSerde {
  code: ErrorCode,
  message: String,
}

#[cfg(feature = "actix_web_error")]
impl From<&AppError> for AppErrorSerde {
  fn from(value: &AppError) -> Self {
    Self {
      code: value.code(),
      message: value.to_string(),
    }
  }
}

#[cfg(feature = "actix_web_error")]
impl actix_web::error::ResponseError for AppError {
  fn status_code(&self) -> actix_web::http::StatusCode {
    match self {
      AppError::NotEnoughPermissions { .. } => actix_web::http::StatusCode::FORBIDDEN,
      AppError::NotLoggedIn(_) => actix_web::http::StatusCode::UNAUTHORIZED,
      AppError::RecordNotFound(_) => actix_web::http::StatusCode::NOT_FOUND,
      AppError::InvalidRequest(_) => actix_web::http::StatusCode::BAD_REQUEST,
      _ => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn error_response(&self) -> actix_web::HttpResponse {
    actix_web::HttpResponse::build(self.status_code()).json(AppErrorSerde::from(self))
  }
}
