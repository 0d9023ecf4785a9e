use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::Error;

/// An [`Error`] on its way out of the API, rendered as `{kind, message}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = Result<Json<T>, ApiError>;

impl ApiError {
  pub fn status_code(&self) -> StatusCode {
    match self.0 {
      Error::Validation(_) => StatusCode::BAD_REQUEST,
      Error::NotFound(_) => StatusCode::NOT_FOUND,
      Error::Conflict(_) | Error::ConcurrencyConflict(_) => StatusCode::CONFLICT,
      Error::Provisioning(_) => StatusCode::BAD_GATEWAY,
      Error::CheckerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
      Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

#[derive(Serialize)]
struct ErrorBody {
  kind: &'static str,
  message: String,
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    let message = match &self.0 {
      // details stay in the log
      Error::Internal(err) => {
        error!("internal error: {:#}", err);
        "internal server error".to_owned()
      }
      err => err.to_string(),
    };
    let body = ErrorBody {
      kind: self.0.kind(),
      message,
    };
    (status, Json(body)).into_response()
  }
}

impl From<Error> for ApiError {
  fn from(err: Error) -> Self {
    ApiError(err)
  }
}

impl From<anyhow::Error> for ApiError {
  fn from(err: anyhow::Error) -> Self {
    ApiError(Error::Internal(err))
  }
}

impl From<JsonRejection> for ApiError {
  fn from(rejection: JsonRejection) -> Self {
    ApiError(Error::Validation(rejection.body_text()))
  }
}

impl From<QueryRejection> for ApiError {
  fn from(rejection: QueryRejection) -> Self {
    ApiError(Error::Validation(rejection.body_text()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_map_to_status_codes() {
    let cases = [
      (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
      (Error::not_found("game", 1), StatusCode::NOT_FOUND),
      (Error::Conflict("x".into()), StatusCode::CONFLICT),
      (Error::CheckerTimeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
      (Error::from(anyhow::anyhow!("x")), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, status) in cases {
      assert_eq!(ApiError(err).status_code(), status);
    }
  }
}
