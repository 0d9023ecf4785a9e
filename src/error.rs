use std::error::Error as StdError;

/// Errors surfaced across the core's public boundary.
///
/// Per-team failures inside a tick never become an `Error`; they are logged
/// and folded into that team's result instead.
#[derive(Debug, Display)]
pub enum Error {
  /// Malformed request, rejected before it enters the pipeline.
  #[display(fmt = "{}", _0)]
  Validation(String),

  #[display(fmt = "{} not found", _0)]
  NotFound(String),

  /// The request is well-formed but illegal in the current state.
  #[display(fmt = "{}", _0)]
  Conflict(String),

  #[display(fmt = "provisioning failed: {}", _0)]
  Provisioning(String),

  #[display(fmt = "checker timed out: {}", _0)]
  CheckerTimeout(String),

  /// Lost a race for a single-writer resource (e.g. a flag claim).
  #[display(fmt = "{}", _0)]
  ConcurrencyConflict(String),

  #[display(fmt = "{:#}", _0)]
  Internal(anyhow::Error),
}

impl StdError for Error {}

impl Error {
  /// Stable identifier used on the wire.
  pub fn kind(&self) -> &'static str {
    match self {
      Error::Validation(_) => "validation_error",
      Error::NotFound(_) => "not_found_error",
      Error::Conflict(_) => "conflict_error",
      Error::Provisioning(_) => "provisioning_error",
      Error::CheckerTimeout(_) => "checker_timeout_error",
      Error::ConcurrencyConflict(_) => "concurrency_conflict_error",
      Error::Internal(_) => "internal_error",
    }
  }

  pub fn not_found(what: impl std::fmt::Display, id: i64) -> Self {
    Error::NotFound(format!("{} {}", what, id))
  }
}

impl From<anyhow::Error> for Error {
  fn from(err: anyhow::Error) -> Self {
    Error::Internal(err)
  }
}

impl From<sqlx::Error> for Error {
  fn from(err: sqlx::Error) -> Self {
    Error::Internal(err.into())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
