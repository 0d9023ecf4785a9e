use std::error::Error;
use std::ops::Deref;
use std::{
  ffi::OsStr,
  io,
  path::Path,
  process::{Output, Stdio},
  time::Duration,
};

use serde::{Deserialize, Serialize, Serializer};
use tokio::{process::Command, time};

#[derive(Debug, Display)]
pub enum TimeoutCommandError {
  #[display(fmt = "could not spawn child: {}", _0)]
  Spawn(io::Error),
  #[display(fmt = "child execution failed: {}", _0)]
  Io(io::Error),
  #[display(fmt = "child timed out after {:?}", _0)]
  TimedOut(Duration),
}

impl Error for TimeoutCommandError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      TimeoutCommandError::Spawn(err) => Some(err),
      TimeoutCommandError::Io(err) => Some(err),
      TimeoutCommandError::TimedOut(_) => None,
    }
  }
}

/// Run a child process with a timeout, capturing stdout and stderr.
///
/// The child is killed if the timeout elapses. A non-zero exit status is
/// not an error here; callers inspect `Output::status`.
pub async fn child_output_helper<Args, Arg>(
  executable: impl AsRef<OsStr>,
  working_directory: Option<&Path>,
  args: Args,
  timeout: Duration,
) -> Result<Output, TimeoutCommandError>
where
  Args: IntoIterator<Item = Arg>,
  Arg: AsRef<OsStr>,
{
  let mut command = Command::new(executable.as_ref());
  command
    .args(args)
    .stdin(Stdio::null())
    .stderr(Stdio::piped())
    .stdout(Stdio::piped())
    .kill_on_drop(true);
  if let Some(dir) = working_directory {
    command.current_dir(dir);
  }
  debug!("{:?}", command);

  let child = command.spawn().map_err(TimeoutCommandError::Spawn)?;

  match time::timeout(timeout, child.wait_with_output()).await {
    Ok(output) => output.map_err(TimeoutCommandError::Io),
    Err(_) => Err(TimeoutCommandError::TimedOut(timeout)),
  }
}

/// Trimmed, lossy view of a child's stdout followed by its stderr.
pub fn output_message(output: &Output) -> String {
  let stdout = String::from_utf8_lossy(&output.stdout);
  let stderr = String::from_utf8_lossy(&output.stderr);
  let mut message = stdout.trim().to_owned();
  if !stderr.trim().is_empty() {
    if !message.is_empty() {
      message.push('\n');
    }
    message.push_str(stderr.trim());
  }
  message
}

/// Integer number of seconds that can be decoded from serde
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Seconds(pub Duration);

impl Seconds {
  pub const fn new(seconds: u64) -> Self {
    Seconds(Duration::from_secs(seconds))
  }
}

impl Deref for Seconds {
  type Target = Duration;

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl From<Seconds> for Duration {
  fn from(seconds: Seconds) -> Duration {
    seconds.0
  }
}

impl Serialize for Seconds {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let seconds = self.0.as_secs();
    seconds.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for Seconds {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let seconds = u64::deserialize(deserializer)?;
    let duration = Duration::from_secs(seconds);
    Ok(Seconds(duration))
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  #[tokio::test]
  async fn captures_output() {
    let output = child_output_helper(
      "echo",
      None,
      &["foo", "bar"],
      Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(output.status.success());
    assert_eq!(output_message(&output), "foo bar");
  }

  #[tokio::test]
  async fn times_out() {
    let result =
      child_output_helper("sleep", None, &["60"], Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(TimeoutCommandError::TimedOut(_))));
  }

  #[tokio::test]
  async fn missing_executable_fails_to_spawn() {
    let result = child_output_helper(
      "/definitely/not/a/binary",
      None,
      Vec::<&str>::new(),
      Duration::from_secs(1),
    )
    .await;
    assert!(matches!(result, Err(TimeoutCommandError::Spawn(_))));
  }
}
