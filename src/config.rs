use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::CheckStatus;
use crate::utils::Seconds;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TeamConfig {
  pub id: i64,
  pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
  #[serde(default = "default_bind_addr")]
  pub bind_addr: SocketAddr,
  #[serde(default = "default_database_url")]
  pub database_url: String,
  #[serde(default)]
  pub teams: Vec<TeamConfig>,
  /// Relative checker references are resolved against this directory.
  #[serde(default)]
  pub checker_dir: Option<PathBuf>,

  #[serde(default)]
  pub scheduler: SchedulerConfig,
  #[serde(default)]
  pub scoring: ScoringConfig,
  #[serde(default)]
  pub broadcast: BroadcastConfig,
  #[serde(default)]
  pub docker: DockerConfig,
}

fn default_bind_addr() -> SocketAddr {
  SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_database_url() -> String {
  "sqlite://gameserver.db".to_owned()
}

impl Default for Config {
  fn default() -> Self {
    Config {
      bind_addr: default_bind_addr(),
      database_url: default_database_url(),
      teams: Vec::new(),
      checker_dir: None,
      scheduler: SchedulerConfig::default(),
      scoring: ScoringConfig::default(),
      broadcast: BroadcastConfig::default(),
      docker: DockerConfig::default(),
    }
  }
}

impl Config {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
      .with_context(|| format!("couldn't read config {}", path.display()))?;
    Self::from_str(&contents)
  }

  #[allow(clippy::should_implement_trait)]
  pub fn from_str(contents: &str) -> Result<Self> {
    let config: Config =
      toml::from_str(contents).context("couldn't parse config")?;
    anyhow::ensure!(
      config.scheduler.max_workers > 0,
      "scheduler.max_workers must be at least 1"
    );
    Ok(config)
  }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Upper bound on concurrent per-team tasks within one phase.
  pub max_workers: usize,
  pub check_timeout: Seconds,
  pub inject_timeout: Seconds,
  /// Bounded wait for each team's environment during `start`.
  pub provision_grace: Seconds,
  pub teardown_timeout: Seconds,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    SchedulerConfig {
      max_workers: 16,
      check_timeout: Seconds::new(10),
      inject_timeout: Seconds::new(10),
      provision_grace: Seconds::new(120),
      teardown_timeout: Seconds::new(30),
    }
  }
}

/// Point policy. All values are per event.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringConfig {
  pub attack_points: i64,
  pub defense_penalty: i64,
  pub sla_up: i64,
  pub sla_down: i64,
  pub sla_error: i64,
  /// Number of ticks a flag can be captured for.
  pub flag_retention: i64,
}

impl Default for ScoringConfig {
  fn default() -> Self {
    ScoringConfig {
      attack_points: 10,
      defense_penalty: 10,
      sla_up: 1,
      sla_down: 0,
      sla_error: -1,
      flag_retention: 5,
    }
  }
}

impl ScoringConfig {
  pub fn sla_points(&self, status: CheckStatus) -> i64 {
    match status {
      CheckStatus::Up => self.sla_up,
      CheckStatus::Down => self.sla_down,
      CheckStatus::Error => self.sla_error,
    }
  }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcastConfig {
  pub channel_capacity: usize,
  pub heartbeat_interval: Seconds,
  /// Subscribers silent for this many heartbeats are pruned.
  pub max_missed_heartbeats: u32,
  pub timer_interval: Seconds,
}

impl Default for BroadcastConfig {
  fn default() -> Self {
    BroadcastConfig {
      channel_capacity: 64,
      heartbeat_interval: Seconds::new(30),
      max_missed_heartbeats: 3,
      timer_interval: Seconds::new(1),
    }
  }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DockerConfig {
  pub binary: String,
  pub network: Option<String>,
  /// Port the vulnbox service listens on inside the container.
  pub service_port: u16,
  pub flag_path: String,
  pub command_timeout: Seconds,
}

impl Default for DockerConfig {
  fn default() -> Self {
    DockerConfig {
      binary: "docker".to_owned(),
      network: None,
      service_port: 1337,
      flag_path: "/flag".to_owned(),
      command_timeout: Seconds::new(60),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[test]
  fn parses_minimal_config_with_defaults() {
    let config = Config::from_str(
      r#"
        database_url = "sqlite::memory:"

        [[teams]]
        id = 1
        name = "alpha"

        [[teams]]
        id = 2
        name = "bravo"

        [scoring]
        attack_points = 50
        flag_retention = 2
      "#,
    )
    .unwrap();

    assert_eq!(config.teams.len(), 2);
    assert_eq!(config.teams[1].name, "bravo");
    assert_eq!(config.scoring.attack_points, 50);
    assert_eq!(config.scoring.flag_retention, 2);
    // untouched fields keep their defaults
    assert_eq!(config.scoring.defense_penalty, 10);
    assert_eq!(*config.scheduler.check_timeout, Duration::from_secs(10));
    assert_eq!(config.bind_addr.port(), 8000);
  }

  #[test]
  fn rejects_empty_worker_pool() {
    let err = Config::from_str("[scheduler]\nmax_workers = 0\n").unwrap_err();
    assert!(err.to_string().contains("max_workers"));
  }

  #[test]
  fn sla_policy() {
    let scoring = ScoringConfig::default();
    assert_eq!(scoring.sla_points(CheckStatus::Up), 1);
    assert_eq!(scoring.sla_points(CheckStatus::Down), 0);
    assert_eq!(scoring.sla_points(CheckStatus::Error), -1);
  }
}
