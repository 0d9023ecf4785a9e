use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::models::CheckStatus;
use crate::provisioner::Endpoint;
use crate::utils::{child_output_helper, output_message};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
  pub status: CheckStatus,
  pub message: String,
}

impl CheckOutcome {
  pub fn new(status: CheckStatus, message: impl Into<String>) -> Self {
    CheckOutcome {
      status,
      message: message.into(),
    }
  }
}

/// Probes a team's service for SLA.
///
/// Implementations never fail: every problem is reported as an outcome.
#[async_trait]
pub trait Checker: Send + Sync {
  async fn check(
    &self,
    endpoint: &Endpoint,
    script: &str,
    timeout: Duration,
  ) -> CheckOutcome;
}

/// Runs checker scripts as `<script> <address> <port>`.
///
/// Exit code 0 means up, any other exit code means down. Spawn failures
/// and timeouts are errors.
#[derive(Default)]
pub struct ScriptChecker {
  base_dir: Option<PathBuf>,
}

impl ScriptChecker {
  /// Relative script paths are resolved against `base_dir`.
  pub fn new(base_dir: Option<PathBuf>) -> Self {
    ScriptChecker { base_dir }
  }

  fn resolve(&self, script: &str) -> PathBuf {
    let path = Path::new(script);
    match &self.base_dir {
      Some(base) if path.is_relative() => base.join(path),
      _ => path.to_path_buf(),
    }
  }
}

#[async_trait]
impl Checker for ScriptChecker {
  async fn check(
    &self,
    endpoint: &Endpoint,
    script: &str,
    timeout: Duration,
  ) -> CheckOutcome {
    let executable = self.resolve(script);
    let args = [endpoint.address.clone(), endpoint.port.to_string()];
    let working_directory = executable.parent().filter(|p| p.is_dir());

    match child_output_helper(&executable, working_directory, &args, timeout)
      .await
    {
      Ok(output) if output.status.success() => {
        CheckOutcome::new(CheckStatus::Up, output_message(&output))
      }
      Ok(output) => {
        let mut message = output_message(&output);
        if message.is_empty() {
          message = format!("checker exited with {}", output.status);
        }
        CheckOutcome::new(CheckStatus::Down, message)
      }
      Err(err) => CheckOutcome::new(CheckStatus::Error, err.to_string()),
    }
  }
}
