use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::broadcast::{Broadcaster, Event, Snapshot, Subscription};
use crate::checker::{Checker, ScriptChecker};
use crate::controllers::flag::SubmitOutcome;
use crate::controllers::game::{GameForm, GameList, GameUpdate, ResourceRefs};
use crate::controllers;
use crate::dal::{self, Db};
use crate::models::{Game, GameStatus, GameTeam, Scoreboard, ScoreboardEntry};
use crate::provisioner::{DockerProvisioner, Provisioner};
use crate::scheduler::{self, TeardownReport};
use crate::{Config, Error, Result};

/// Handle of a game's runner task.
struct Runner {
  stop: watch::Sender<bool>,
  abort: AbortHandle,
  done: Shared<BoxFuture<'static, ()>>,
}

struct Inner {
  db: Db,
  config: Config,
  provisioner: Arc<dyn Provisioner>,
  checker: Arc<dyn Checker>,
  broadcaster: Broadcaster,
  runners: Mutex<HashMap<i64, Runner>>,
  /// Serializes lifecycle operations per game.
  locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

/// Outcome of `stop` and `force_stop`.
#[derive(Clone, Debug, Serialize)]
pub struct StopReport {
  pub message: String,
  pub containers_stopped: usize,
  pub teardown_failures: usize,
  pub new_status: GameStatus,
}

/// The game engine. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct GameServer(Arc<Inner>);

impl GameServer {
  /// Connect to the configured database and use the docker provisioner and
  /// script checker.
  pub async fn new(config: Config) -> anyhow::Result<Self> {
    let db = Db::connect(&config.database_url).await?;
    db.migrate().await?;
    let provisioner = Arc::new(DockerProvisioner::new(config.docker.clone()));
    let checker = Arc::new(ScriptChecker::new(config.checker_dir.clone()));
    Self::with_parts(config, db, provisioner, checker).await
  }

  pub async fn with_parts(
    config: Config,
    db: Db,
    provisioner: Arc<dyn Provisioner>,
    checker: Arc<dyn Checker>,
  ) -> anyhow::Result<Self> {
    // load teams into db
    for team in &config.teams {
      dal::team::create(&db, team.id, &team.name).await?;
    }

    // ticks cut short by a previous run are not resumed
    let cleared = dal::tick::clear_in_progress(&db).await?;
    if cleared > 0 {
      warn!("marked {} interrupted ticks as error", cleared);
    }

    let broadcaster = Broadcaster::new(config.broadcast.clone());
    Ok(GameServer(Arc::new(Inner {
      db,
      config,
      provisioner,
      checker,
      broadcaster,
      runners: Mutex::new(HashMap::new()),
      locks: Mutex::new(HashMap::new()),
    })))
  }

  pub fn database(&self) -> &Db {
    &self.0.db
  }

  pub fn config(&self) -> &Config {
    &self.0.config
  }

  pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
    &self.0.provisioner
  }

  pub fn checker(&self) -> &Arc<dyn Checker> {
    &self.0.checker
  }

  pub fn broadcaster(&self) -> &Broadcaster {
    &self.0.broadcaster
  }

  /// Put games left on the clock by a previous run back on it.
  pub async fn resume(&self) -> Result<usize> {
    let games = dal::game::with_status(
      self.database(),
      &[GameStatus::Deploying, GameStatus::Running],
    )
    .await?;
    for game in &games {
      info!("resuming game_id={} status={}", game.id, game.status);
      self.spawn_runner(game.id, game.status == GameStatus::Deploying);
    }
    Ok(games.len())
  }

  fn runners(&self) -> MutexGuard<'_, HashMap<i64, Runner>> {
    self.0.runners.lock().unwrap_or_else(PoisonError::into_inner)
  }

  async fn lock_game(&self, game_id: i64) -> OwnedMutexGuard<()> {
    let lock = self
      .0
      .locks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(game_id)
      .or_default()
      .clone();
    lock.lock_owned().await
  }

  fn spawn_runner(&self, game_id: i64, deploy: bool) {
    let (stop, stop_rx) = watch::channel(false);
    // the runner may remove itself when it finishes; hold the map until it
    // is registered
    let mut runners = self.runners();
    let handle =
      tokio::spawn(scheduler::run(self.clone(), game_id, deploy, stop_rx));
    let abort = handle.abort_handle();
    let done = handle.map(|_| ()).boxed().shared();
    if let Some(old) = runners.insert(game_id, Runner { stop, abort, done }) {
      old.abort.abort();
    }
  }

  /// Ask a game's runner to stop after its current tick and wait for it.
  async fn drain_runner(&self, game_id: i64) {
    let done = self.runners().get(&game_id).map(|runner| {
      let _ = runner.stop.send(true);
      runner.done.clone()
    });
    if let Some(done) = done {
      done.await;
    }
    self.runners().remove(&game_id);
  }

  pub(crate) fn forget_runner(&self, game_id: i64) {
    self.runners().remove(&game_id);
  }

  pub fn is_on_clock(&self, game_id: i64) -> bool {
    self.runners().contains_key(&game_id)
  }

  async fn game(&self, game_id: i64) -> Result<Game> {
    controllers::game::get(self.database(), game_id).await
  }

  /// Make sure subscribers of a game have a snapshot to start from.
  pub(crate) async fn ensure_snapshot(&self, game: &Game) -> Result<()> {
    if self.broadcaster().snapshot(game.id).is_some() {
      return Ok(());
    }
    let db = self.database();
    let mut snapshot = Snapshot::new(game);
    snapshot.scoreboard =
      controllers::scoreboard::from_db(db, game.id, &self.config().scoring)
        .await?;
    snapshot.tick_started_at = dal::tick::current(db, game.id)
      .await?
      .and_then(|tick| tick.started_at);
    self.broadcaster().seed(snapshot);
    Ok(())
  }

  /// Publish the current status of a game.
  pub(crate) async fn announce(&self, game_id: i64) -> Result<Game> {
    let game = self.game(game_id).await?;
    self.ensure_snapshot(&game).await?;
    self.broadcaster().game_state(&game);
    Ok(game)
  }

  pub async fn create_game(&self, form: GameForm) -> Result<Game> {
    controllers::game::create(self.database(), form).await
  }

  pub async fn get_game(&self, game_id: i64) -> Result<Game> {
    self.game(game_id).await
  }

  pub async fn list_games(&self, skip: i64, limit: i64) -> Result<GameList> {
    controllers::game::list(self.database(), skip, limit).await
  }

  pub async fn update_game(
    &self,
    game_id: i64,
    update: GameUpdate,
  ) -> Result<Game> {
    let _guard = self.lock_game(game_id).await;
    controllers::game::update(self.database(), game_id, update).await?;
    self.announce(game_id).await
  }

  pub async fn delete_game(&self, game_id: i64) -> Result<()> {
    let _guard = self.lock_game(game_id).await;
    controllers::game::delete(self.database(), game_id).await?;
    self.broadcaster().remove_game(game_id);
    Ok(())
  }

  pub async fn assign_refs(
    &self,
    game_id: i64,
    refs: ResourceRefs,
  ) -> Result<Game> {
    let _guard = self.lock_game(game_id).await;
    controllers::game::assign_refs(self.database(), game_id, refs).await
  }

  /// Start a draft game (deploy, then run) or resume a paused one.
  pub async fn start(&self, game_id: i64) -> Result<Game> {
    let _guard = self.lock_game(game_id).await;
    let db = self.database();
    let game = self.game(game_id).await?;

    match game.status {
      GameStatus::Draft => {
        if game.vulnbox_ref.is_none() || game.checker_ref.is_none() {
          return Err(Error::Validation(
            "assign a vulnbox and a checker before starting".to_owned(),
          ));
        }
        if dal::game_team::list(db, game_id).await?.is_empty() {
          return Err(Error::Validation("game has no teams".to_owned()));
        }
        self
          .transition(&game, &[GameStatus::Draft], GameStatus::Deploying)
          .await?;
        let game = self.announce(game_id).await?;
        info!("deploying game_id={}", game_id);
        self.spawn_runner(game_id, true);
        Ok(game)
      }
      GameStatus::Paused => {
        // the paused runner may still be finishing its last tick
        self.drain_runner(game_id).await;
        self
          .transition(&game, &[GameStatus::Paused], GameStatus::Running)
          .await?;
        let game = self.announce(game_id).await?;
        info!("resumed game_id={} at tick {}", game_id, game.current_tick);
        self.spawn_runner(game_id, false);
        Ok(game)
      }
      status => Err(Error::Conflict(format!(
        "game {} is {}, only draft or paused games can be started",
        game_id, status
      ))),
    }
  }

  /// Stop the clock of a running game. The tick in flight, if any, runs to
  /// completion before this returns.
  pub async fn pause(&self, game_id: i64) -> Result<Game> {
    let _guard = self.lock_game(game_id).await;
    let game = self.game(game_id).await?;
    self
      .transition(&game, &[GameStatus::Running], GameStatus::Paused)
      .await?;
    self.drain_runner(game_id).await;
    let game = self.announce(game_id).await?;
    info!("paused game_id={} at tick {}", game_id, game.current_tick);
    Ok(game)
  }

  /// Gracefully end a running or paused game: finish the tick in flight,
  /// tear down every environment, then mark the game finished.
  pub async fn stop(&self, game_id: i64) -> Result<StopReport> {
    let _guard = self.lock_game(game_id).await;
    let game = self.game(game_id).await?;
    if !matches!(game.status, GameStatus::Running | GameStatus::Paused) {
      return Err(Error::Conflict(format!(
        "game {} is {}, only running or paused games can be stopped",
        game_id, game.status
      )));
    }

    self.drain_runner(game_id).await;
    // the last tick may have finished the game on its own
    let game = self.game(game_id).await?;
    if game.status == GameStatus::Finished {
      return Err(Error::Conflict(format!("game {} is finished", game_id)));
    }
    let teardown = scheduler::teardown_all(self, game_id).await?;
    dal::game_team::deactivate_all(self.database(), game_id).await?;
    self
      .transition(
        &game,
        &[GameStatus::Running, GameStatus::Paused],
        GameStatus::Finished,
      )
      .await?;
    let game = self.announce(game_id).await?;
    info!(
      "stopped game_id={} stopped={} failed={}",
      game_id, teardown.stopped, teardown.failed
    );
    Ok(report("game stopped", teardown, game.status))
  }

  /// End a game from any state, abandoning whatever is in flight. The game
  /// always ends up finished; teardown is best effort.
  pub async fn force_stop(&self, game_id: i64) -> Result<StopReport> {
    let game = self.game(game_id).await?;
    self
      .transition(
        &game,
        &[
          GameStatus::Draft,
          GameStatus::Deploying,
          GameStatus::Running,
          GameStatus::Paused,
        ],
        GameStatus::Finished,
      )
      .await?;
    warn!("force-stopping game_id={} from {}", game_id, game.status);

    let runner = self.runners().remove(&game_id);
    if let Some(runner) = runner {
      runner.abort.abort();
      runner.done.await;
    }
    match dal::tick::fail_active(self.database(), game_id).await {
      Ok(0) => {}
      Ok(_) => warn!("abandoned the tick in flight game_id={}", game_id),
      Err(err) => {
        error!("could not close active tick game_id={}: {:#}", game_id, err)
      }
    }

    let teardown = match scheduler::teardown_all(self, game_id).await {
      Ok(teardown) => teardown,
      Err(err) => {
        error!("teardown failed game_id={}: {}", game_id, err);
        TeardownReport::default()
      }
    };
    if let Err(err) =
      dal::game_team::deactivate_all(self.database(), game_id).await
    {
      error!("could not deactivate teams game_id={}: {:#}", game_id, err);
    }
    let status = match self.announce(game_id).await {
      Ok(game) => game.status,
      Err(err) => {
        error!("could not announce game_id={}: {}", game_id, err);
        GameStatus::Finished
      }
    };
    Ok(report("game force-stopped", teardown, status))
  }

  async fn transition(
    &self,
    game: &Game,
    from: &[GameStatus],
    to: GameStatus,
  ) -> Result<()> {
    if from.contains(&game.status)
      && dal::game::transition(self.database(), game.id, from, to).await?
    {
      return Ok(());
    }
    let current = self.game(game.id).await?;
    Err(Error::Conflict(format!(
      "game {} is {}, can't move to {}",
      game.id, current.status, to
    )))
  }

  pub async fn teams(&self, game_id: i64) -> Result<Vec<GameTeam>> {
    self.game(game_id).await?;
    Ok(dal::game_team::list(self.database(), game_id).await?)
  }

  pub async fn team(&self, game_id: i64, team_id: i64) -> Result<GameTeam> {
    dal::game_team::get(self.database(), game_id, team_id)
      .await?
      .ok_or_else(|| {
        Error::NotFound(format!("team {} in game {}", team_id, game_id))
      })
  }

  /// Add a team. Past `draft` this needs `force`, and the team's
  /// environment is provisioned right away.
  pub async fn add_team(
    &self,
    game_id: i64,
    team_id: i64,
    force: bool,
  ) -> Result<GameTeam> {
    let _guard = self.lock_game(game_id).await;
    let db = self.database();
    let game_team =
      controllers::game::add_team(db, game_id, team_id, force).await?;
    let game = self.game(game_id).await?;

    let image = match (&game.status, &game.vulnbox_ref) {
      (GameStatus::Draft, _) | (_, None) => return Ok(game_team),
      (_, Some(image)) => image,
    };
    let provision = self.provisioner().provision(&game_team.env_name, image);
    match timeout(*self.config().scheduler.provision_grace, provision).await {
      Ok(Ok(endpoint)) => {
        dal::game_team::set_endpoint(db, game_id, team_id, &endpoint).await?;
        info!("provisioned late game_id={} team_id={}", game_id, team_id);
      }
      Ok(Err(err)) => warn!(
        "provisioning failed game_id={} team_id={}: {:#}",
        game_id, team_id, err
      ),
      Err(_) => warn!(
        "provisioning timed out game_id={} team_id={}",
        game_id, team_id
      ),
    }
    self.team(game_id, team_id).await
  }

  /// Remove a team, tearing down its environment if the game got past
  /// `draft`.
  pub async fn remove_team(
    &self,
    game_id: i64,
    team_id: i64,
    force: bool,
  ) -> Result<GameTeam> {
    let _guard = self.lock_game(game_id).await;
    let removed =
      controllers::game::remove_team(self.database(), game_id, team_id, force)
        .await?;
    let game = self.game(game_id).await?;
    if game.status != GameStatus::Draft {
      scheduler::teardown_team(self, &removed).await;
    }
    Ok(removed)
  }

  pub async fn submit_flag(
    &self,
    game_id: i64,
    team_id: i64,
    flag: &str,
  ) -> Result<SubmitOutcome> {
    controllers::flag::submit(
      self.database(),
      &self.config().scoring,
      game_id,
      team_id,
      flag,
    )
    .await
  }

  /// The latest published scoreboard of a game.
  pub async fn scoreboard(&self, game_id: i64) -> Result<Scoreboard> {
    let game = self.game(game_id).await?;
    self.ensure_snapshot(&game).await?;
    let entries = self.broadcaster().scoreboard(game_id).unwrap_or_default();
    Ok(Scoreboard {
      game_id,
      game_name: game.name,
      status: game.status,
      current_tick: game.current_tick,
      entries,
    })
  }

  /// Scoreboards of every game that has left `draft`.
  pub async fn scoreboards(&self) -> Result<Vec<Scoreboard>> {
    let games = dal::game::with_status(
      self.database(),
      &[
        GameStatus::Deploying,
        GameStatus::Running,
        GameStatus::Paused,
        GameStatus::Finished,
      ],
    )
    .await?;
    let mut boards = Vec::with_capacity(games.len());
    for game in games {
      boards.push(self.scoreboard(game.id).await?);
    }
    Ok(boards)
  }

  pub async fn team_score(
    &self,
    game_id: i64,
    team_id: i64,
  ) -> Result<ScoreboardEntry> {
    self
      .scoreboard(game_id)
      .await?
      .entries
      .into_iter()
      .find(|entry| entry.team_id == team_id)
      .ok_or_else(|| {
        Error::NotFound(format!("team {} in game {}", team_id, game_id))
      })
  }

  /// Subscribe to a game's live events, starting with a full snapshot.
  pub async fn subscribe(&self, game_id: i64) -> Result<Subscription> {
    let game = self.game(game_id).await?;
    self.ensure_snapshot(&game).await?;
    Ok(self.broadcaster().subscribe(game_id))
  }

  /// A fresh `scoreboard` event, for clients asking to refresh.
  pub async fn scoreboard_event(&self, game_id: i64) -> Result<Event> {
    let board = self.scoreboard(game_id).await?;
    Ok(Event::Scoreboard {
      game_id,
      entries: board.entries,
    })
  }
}

fn report(
  message: &str,
  teardown: TeardownReport,
  new_status: GameStatus,
) -> StopReport {
  StopReport {
    message: message.to_owned(),
    containers_stopped: teardown.stopped,
    teardown_failures: teardown.failed,
    new_status,
  }
}
