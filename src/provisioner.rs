//! Per-team runtime environments.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::DockerConfig;
use crate::utils::{child_output_helper, output_message};

/// Where a team's service can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
  pub env_name: String,
  pub address: String,
  pub port: u16,
  pub credentials: Option<String>,
}

/// Creates, feeds, and destroys team environments.
#[async_trait]
pub trait Provisioner: Send + Sync {
  /// Create and start an environment named `env_name` from `image`.
  async fn provision(&self, env_name: &str, image: &str) -> Result<Endpoint>;

  /// Place a flag inside a running environment.
  async fn inject_flag(&self, endpoint: &Endpoint, flag: &str) -> Result<()>;

  /// Destroy an environment by name, whether or not it finished
  /// provisioning. Returns whether something was actually removed.
  async fn teardown(&self, env_name: &str) -> Result<bool>;

  async fn health_query(&self, endpoint: &Endpoint) -> Result<bool>;
}

/// Runs each environment as a container through the docker CLI.
pub struct DockerProvisioner {
  config: DockerConfig,
}

impl DockerProvisioner {
  pub fn new(config: DockerConfig) -> Self {
    DockerProvisioner { config }
  }

  fn timeout(&self) -> Duration {
    self.config.command_timeout.into()
  }

  async fn docker<I, S>(&self, args: I) -> Result<(bool, String)>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
  {
    let output =
      child_output_helper(&self.config.binary, None, args, self.timeout())
        .await
        .context("docker invocation failed")?;
    Ok((output.status.success(), output_message(&output)))
  }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
  async fn provision(&self, env_name: &str, image: &str) -> Result<Endpoint> {
    // a leftover container from an earlier attempt would block the name
    let _ = self.docker(["rm", "-f", env_name]).await;

    let mut args = vec!["run", "-d", "--restart", "unless-stopped"];
    args.extend(["--name", env_name]);
    if let Some(network) = &self.config.network {
      args.extend(["--network", network.as_str()]);
    }
    args.push(image);

    let (ok, message) = self.docker(&args).await?;
    if !ok {
      bail!("docker run {} failed: {}", env_name, message);
    }

    let (ok, address) = self
      .docker([
        "inspect",
        "-f",
        "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
        env_name,
      ])
      .await?;
    let address = address.split_whitespace().next().map(str::to_owned);
    match address {
      Some(address) if ok => Ok(Endpoint {
        env_name: env_name.to_owned(),
        address,
        port: self.config.service_port,
        credentials: None,
      }),
      _ => bail!("container {} has no address", env_name),
    }
  }

  async fn inject_flag(&self, endpoint: &Endpoint, flag: &str) -> Result<()> {
    let script = format!("printf '%s\\n' \"$1\" > {}", self.config.flag_path);
    let (ok, message) = self
      .docker([
        "exec",
        endpoint.env_name.as_str(),
        "sh",
        "-c",
        script.as_str(),
        "sh",
        flag,
      ])
      .await?;
    if !ok {
      bail!("flag injection into {} failed: {}", endpoint.env_name, message);
    }
    Ok(())
  }

  async fn teardown(&self, env_name: &str) -> Result<bool> {
    let (ok, message) = self.docker(["rm", "-f", env_name]).await?;
    if !ok {
      bail!("docker rm {} failed: {}", env_name, message);
    }
    Ok(!message.is_empty())
  }

  async fn health_query(&self, endpoint: &Endpoint) -> Result<bool> {
    let (ok, running) = self
      .docker([
        "inspect",
        "-f",
        "{{.State.Running}}",
        endpoint.env_name.as_str(),
      ])
      .await?;
    Ok(ok && running.trim() == "true")
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::utils::Seconds;

  fn provisioner(binary: &str) -> DockerProvisioner {
    DockerProvisioner::new(DockerConfig {
      binary: binary.to_owned(),
      command_timeout: Seconds::new(5),
      ..DockerConfig::default()
    })
  }

  #[tokio::test]
  async fn teardown_reports_missing_binary() {
    let provisioner = provisioner("/nonexistent/docker");
    assert!(provisioner.teardown("ad-g1-t1").await.is_err());
  }

  #[tokio::test]
  async fn teardown_succeeds_when_cli_succeeds() {
    // `echo` stands in for a docker CLI that prints the removed name
    let provisioner = provisioner("echo");
    assert!(provisioner.teardown("ad-g1-t1").await.unwrap());
  }

  #[tokio::test]
  async fn failing_cli_is_unhealthy() {
    let provisioner = provisioner("false");
    let endpoint = Endpoint {
      env_name: "ad-g1-t1".to_owned(),
      address: "10.0.0.2".to_owned(),
      port: 1337,
      credentials: None,
    };
    assert!(!provisioner.health_query(&endpoint).await.unwrap());
    assert!(provisioner.inject_flag(&endpoint, "FLAG{x}").await.is_err());
  }
}
