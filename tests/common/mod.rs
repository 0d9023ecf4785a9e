#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adgameserver::checker::{CheckOutcome, Checker};
use adgameserver::controllers::game::{GameForm, ResourceRefs};
use adgameserver::dal::Db;
use adgameserver::models::{CheckStatus, Game};
use adgameserver::provisioner::{Endpoint, Provisioner};
use adgameserver::{Config, GameServer, TeamConfig};
use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

/// Records every call and fails on request.
#[derive(Default)]
pub struct MockProvisioner {
  pub provisioned: Mutex<Vec<String>>,
  pub injected: Mutex<Vec<(String, String)>>,
  pub torn_down: Mutex<Vec<String>>,
  /// Environments whose provisioning fails.
  pub broken: Mutex<HashSet<String>>,
  pub fail_teardown: AtomicBool,
}

impl MockProvisioner {
  pub fn break_env(&self, env_name: &str) {
    self.broken.lock().unwrap().insert(env_name.to_owned());
  }

  pub fn injected(&self) -> Vec<(String, String)> {
    self.injected.lock().unwrap().clone()
  }

  pub fn torn_down(&self) -> Vec<String> {
    let mut torn_down = self.torn_down.lock().unwrap().clone();
    torn_down.sort();
    torn_down
  }
}

#[async_trait]
impl Provisioner for MockProvisioner {
  async fn provision(&self, env_name: &str, _image: &str) -> Result<Endpoint> {
    if self.broken.lock().unwrap().contains(env_name) {
      bail!("image pull failed for {}", env_name);
    }
    let mut provisioned = self.provisioned.lock().unwrap();
    provisioned.push(env_name.to_owned());
    Ok(Endpoint {
      env_name: env_name.to_owned(),
      address: format!("10.0.0.{}", provisioned.len()),
      port: 1337,
      credentials: None,
    })
  }

  async fn inject_flag(&self, endpoint: &Endpoint, flag: &str) -> Result<()> {
    self
      .injected
      .lock()
      .unwrap()
      .push((endpoint.env_name.clone(), flag.to_owned()));
    Ok(())
  }

  async fn teardown(&self, env_name: &str) -> Result<bool> {
    if self.fail_teardown.load(Ordering::SeqCst) {
      bail!("docker daemon unreachable");
    }
    self.torn_down.lock().unwrap().push(env_name.to_owned());
    Ok(true)
  }

  async fn health_query(&self, _endpoint: &Endpoint) -> Result<bool> {
    Ok(true)
  }
}

/// Reports a fixed status. Can be held at the gate to keep a tick in flight.
pub struct MockChecker {
  pub status: Mutex<CheckStatus>,
  pub gate: Option<Arc<Semaphore>>,
  pub entered: Notify,
}

impl MockChecker {
  pub fn new() -> Self {
    MockChecker {
      status: Mutex::new(CheckStatus::Up),
      gate: None,
      entered: Notify::new(),
    }
  }

  /// A checker that blocks every probe until the gate gets permits.
  pub fn gated() -> (Self, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let checker = MockChecker {
      gate: Some(gate.clone()),
      ..MockChecker::new()
    };
    (checker, gate)
  }
}

#[async_trait]
impl Checker for MockChecker {
  async fn check(
    &self,
    _endpoint: &Endpoint,
    _script: &str,
    _timeout: Duration,
  ) -> CheckOutcome {
    self.entered.notify_one();
    if let Some(gate) = &self.gate {
      let _permit = gate.acquire().await;
    }
    let status = *self.status.lock().unwrap();
    CheckOutcome::new(status, "")
  }
}

pub struct Harness {
  pub gameserver: GameServer,
  pub provisioner: Arc<MockProvisioner>,
  pub checker: Arc<MockChecker>,
}

pub fn config(teams: i64) -> Config {
  let mut config = Config::default();
  config.teams = (1..=teams)
    .map(|id| TeamConfig {
      id,
      name: format!("team{}", id),
    })
    .collect();
  config
}

pub async fn harness(teams: i64) -> Harness {
  harness_with(config(teams), MockChecker::new()).await
}

pub async fn harness_with(config: Config, checker: MockChecker) -> Harness {
  let _ = env_logger::builder().is_test(true).try_init();
  let db = Db::in_memory().await.unwrap();
  let provisioner = Arc::new(MockProvisioner::default());
  let checker = Arc::new(checker);
  let gameserver = GameServer::with_parts(
    config,
    db,
    provisioner.clone(),
    checker.clone(),
  )
  .await
  .unwrap();
  Harness {
    gameserver,
    provisioner,
    checker,
  }
}

impl Harness {
  /// A draft game with both resources assigned and every roster team added.
  pub async fn ready_game(&self, max_ticks: Option<i64>) -> Game {
    let game = self
      .gameserver
      .create_game(GameForm {
        name: "finals".to_owned(),
        tick_duration: 60,
        max_ticks,
        ..GameForm::default()
      })
      .await
      .unwrap();
    self
      .gameserver
      .assign_refs(
        game.id,
        ResourceRefs {
          vulnbox_ref: Some("vulnbox:latest".to_owned()),
          checker_ref: Some("check.sh".to_owned()),
        },
      )
      .await
      .unwrap();
    for team in &self.gameserver.config().teams {
      self
        .gameserver
        .add_team(game.id, team.id, false)
        .await
        .unwrap();
    }
    self.gameserver.get_game(game.id).await.unwrap()
  }

  pub async fn wait_for_tick(&self, game_id: i64, tick: i64) {
    let gameserver = self.gameserver.clone();
    wait_for(&format!("tick {}", tick), || {
      let gameserver = gameserver.clone();
      async move {
        let game = gameserver.get_game(game_id).await.unwrap();
        game.current_tick >= tick
      }
    })
    .await;
  }
}

/// Poll until `check` holds, failing the test after five seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while !check().await {
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for {}", what);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}
