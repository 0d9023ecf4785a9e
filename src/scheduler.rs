//! The per-game clock and the tick pipeline.
//!
//! Every game on the clock has exactly one runner task. A runner first
//! deploys the game if asked to, then fires a tick immediately and on every
//! `tick_duration` boundary after that until it is told to stop. A stop
//! request is only looked at between ticks, so a tick in flight always
//! completes all of its phases.

use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};

use crate::check_up::{self, CheckReport};
use crate::controllers::scoreboard;
use crate::dal;
use crate::flag_io::{self, DistributionReport};
use crate::models::{Game, GameStatus, GameTeam, Tick};
use crate::{Error, GameServer, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
  pub tick_number: i64,
  pub flags: DistributionReport,
  pub checks: CheckReport,
  /// The game hit `max_ticks` and should be wound down.
  pub finished: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
  pub stopped: usize,
  pub failed: usize,
}

/// Body of a runner task.
pub(crate) async fn run(
  gameserver: GameServer,
  game_id: i64,
  deploy: bool,
  stop: watch::Receiver<bool>,
) {
  match prepare(&gameserver, game_id, deploy).await {
    Some(period) => clock(gameserver, game_id, period, stop).await,
    // nothing will ever tick, so don't look like it
    None => gameserver.forget_runner(game_id),
  }
}

/// Deploy if asked to and read the tick period. `None` means the game can't
/// go on the clock.
async fn prepare(
  gameserver: &GameServer,
  game_id: i64,
  deploy: bool,
) -> Option<Duration> {
  if deploy {
    match deploy_game(gameserver, game_id).await {
      Ok(true) => {}
      Ok(false) => return None,
      Err(err) => {
        error!("deployment failed game_id={}: {}", game_id, err);
        return None;
      }
    }
  }

  match dal::game::get(gameserver.database(), game_id).await {
    Ok(Some(game)) => {
      Some(Duration::from_secs(game.tick_duration.max(1) as u64))
    }
    Ok(None) => None,
    Err(err) => {
      error!("could not load game game_id={}: {:#}", game_id, err);
      None
    }
  }
}

/// Provision every team of a deploying game, then put it on the clock.
/// Returns false if the game left `deploying` in the meantime.
async fn deploy_game(gameserver: &GameServer, game_id: i64) -> Result<bool> {
  let db = gameserver.database();
  let scheduler = &gameserver.config().scheduler;

  let game = dal::game::get(db, game_id)
    .await?
    .ok_or_else(|| Error::not_found("game", game_id))?;
  if game.status != GameStatus::Deploying {
    return Ok(false);
  }
  let image = game.vulnbox_ref.as_deref().ok_or_else(|| {
    Error::Provisioning(format!("game {} has no vulnbox", game_id))
  })?;

  let teams = dal::game_team::list(db, game_id).await?;
  let deadline = Instant::now() + *scheduler.provision_grace;
  let jobs: Vec<_> = teams
    .iter()
    .map(|team| provision_team(gameserver, &game, image, team, deadline))
    .collect();
  let ready: Vec<bool> = stream::iter(jobs)
    .buffer_unordered(scheduler.max_workers)
    .collect()
    .await;
  let ready = ready.into_iter().filter(|ok| *ok).count();
  info!(
    "deployed game_id={} ready={}/{}",
    game_id,
    ready,
    teams.len()
  );

  if !dal::game::transition(
    db,
    game_id,
    &[GameStatus::Deploying],
    GameStatus::Running,
  )
  .await?
  {
    info!("game_id={} left deploying, not starting the clock", game_id);
    return Ok(false);
  }
  // the game is running now, a failed announcement must not keep it off the
  // clock
  if let Err(err) = gameserver.announce(game_id).await {
    error!("could not announce game_id={}: {}", game_id, err);
  }
  Ok(true)
}

async fn provision_team(
  gameserver: &GameServer,
  game: &Game,
  image: &str,
  team: &GameTeam,
  deadline: Instant,
) -> bool {
  let db = gameserver.database();
  let provision = gameserver.provisioner().provision(&team.env_name, image);
  let failure = match timeout_at(deadline, provision).await {
    Ok(Ok(endpoint)) => {
      match dal::game_team::set_endpoint(db, game.id, team.team_id, &endpoint)
        .await
      {
        Ok(()) => {
          info!(
            "provisioned game_id={} team_id={} env={} address={}:{}",
            game.id,
            team.team_id,
            endpoint.env_name,
            endpoint.address,
            endpoint.port
          );
          return true;
        }
        Err(err) => format!("{:#}", err),
      }
    }
    Ok(Err(err)) => format!("{:#}", err),
    Err(_) => "grace period expired".to_owned(),
  };

  warn!(
    "{} game_id={} team_id={}",
    Error::Provisioning(failure),
    game.id,
    team.team_id
  );
  if let Err(err) =
    dal::game_team::set_active(db, game.id, team.team_id, false).await
  {
    error!(
      "could not deactivate game_id={} team_id={}: {:#}",
      game.id, team.team_id, err
    );
  }
  false
}

async fn clock(
  gameserver: GameServer,
  game_id: i64,
  period: Duration,
  mut stop: watch::Receiver<bool>,
) {
  let mut interval = tokio::time::interval(period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
  info!("clock started game_id={} period={}s", game_id, period.as_secs());

  loop {
    tokio::select! {
      biased;
      _ = stop.changed() => break,
      _ = interval.tick() => {}
    }

    match tick(&gameserver, game_id).await {
      Ok(report) if report.finished => {
        finish(&gameserver, game_id).await;
        break;
      }
      Ok(_) => {}
      Err(Error::Conflict(reason)) => debug!("tick skipped: {}", reason),
      Err(err) => {
        // the next boundary retries the same tick number
        error!("tick failed game_id={}: {}", game_id, err);
        gameserver.broadcaster().error(game_id, &err);
      }
    }
  }
  info!("clock stopped game_id={}", game_id);
}

/// Run one tick of a running game: distribute flags, check services, score
/// and publish. On a fatal error the tick is marked `error` and nothing is
/// advanced.
pub async fn tick(gameserver: &GameServer, game_id: i64) -> Result<TickReport> {
  let db = gameserver.database();
  let game = dal::game::get(db, game_id)
    .await?
    .ok_or_else(|| Error::not_found("game", game_id))?;
  if game.status != GameStatus::Running {
    return Err(Error::Conflict(format!(
      "game {} is {}, not ticking",
      game_id, game.status
    )));
  }
  if game.max_ticks_reached() {
    return Ok(TickReport {
      tick_number: game.current_tick,
      finished: true,
      ..TickReport::default()
    });
  }

  let number = game.current_tick + 1;
  let tick = dal::tick::begin(db, game_id, number).await?;
  info!("=== TICK {} game_id={}", number, game_id);

  match run_phases(gameserver, &game, &tick).await {
    Ok(report) => Ok(report),
    Err(err) => {
      if let Err(fail_err) = dal::tick::fail(db, tick.id).await {
        error!(
          "could not mark tick {} game_id={} as failed: {:#}",
          number, game_id, fail_err
        );
      }
      Err(err)
    }
  }
}

async fn run_phases(
  gameserver: &GameServer,
  game: &Game,
  tick: &Tick,
) -> Result<TickReport> {
  let db = gameserver.database();
  let teams = dal::game_team::list(db, game.id).await?;

  let flags = flag_io::distribute(gameserver, game, tick, &teams).await;
  let checks = check_up::check_all(gameserver, game, tick, &teams).await;

  let watermark = dal::tick::seal_submissions(db, tick).await?;
  let entries =
    scoreboard::from_db(db, game.id, &gameserver.config().scoring).await?;

  dal::tick::complete(db, tick).await?;
  let game = dal::game::get(db, game.id)
    .await?
    .ok_or_else(|| Error::not_found("game", game.id))?;

  let started_at = tick.started_at.unwrap_or_else(Utc::now);
  gameserver.ensure_snapshot(&game).await?;
  let broadcaster = gameserver.broadcaster();
  broadcaster.tick_change(&game, started_at);
  broadcaster.scoreboard_update(game.id, tick.tick_number, entries);

  info!(
    "tick {} done game_id={} flags={}/{} up={} down={} error={} scored_through={}",
    tick.tick_number,
    game.id,
    flags.injected,
    flags.minted,
    checks.up,
    checks.down,
    checks.error,
    watermark
  );

  Ok(TickReport {
    tick_number: tick.tick_number,
    flags,
    checks,
    finished: game.max_ticks_reached(),
  })
}

/// Wind down a game that reached its last tick. Checks are already drained
/// since the final tick completed.
async fn finish(gameserver: &GameServer, game_id: i64) {
  let db = gameserver.database();
  match dal::game::transition(
    db,
    game_id,
    &[GameStatus::Running],
    GameStatus::Finished,
  )
  .await
  {
    Ok(true) => {}
    Ok(false) => return,
    Err(err) => {
      error!("could not finish game_id={}: {:#}", game_id, err);
      return;
    }
  }
  info!("game_id={} reached max_ticks, finishing", game_id);

  match teardown_all(gameserver, game_id).await {
    Ok(report) => info!(
      "torn down game_id={} stopped={} failed={}",
      game_id, report.stopped, report.failed
    ),
    Err(err) => error!("teardown failed game_id={}: {}", game_id, err),
  }
  if let Err(err) = dal::game_team::deactivate_all(db, game_id).await {
    error!("could not deactivate teams game_id={}: {:#}", game_id, err);
  }
  if let Err(err) = gameserver.announce(game_id).await {
    error!("could not announce game_id={}: {}", game_id, err);
  }
  gameserver.forget_runner(game_id);
}

/// Tear down the environment of every team of a game, whatever state it is
/// in. Failures are counted and logged, never propagated.
pub(crate) async fn teardown_all(
  gameserver: &GameServer,
  game_id: i64,
) -> Result<TeardownReport> {
  let teams = dal::game_team::list(gameserver.database(), game_id).await?;
  let workers = gameserver.config().scheduler.max_workers;

  let jobs: Vec<_> = teams
    .iter()
    .map(|team| teardown_team(gameserver, team))
    .collect();
  let results: Vec<Option<bool>> = stream::iter(jobs)
    .buffer_unordered(workers)
    .collect()
    .await;

  let mut report = TeardownReport::default();
  for result in results {
    match result {
      Some(true) => report.stopped += 1,
      Some(false) => {}
      None => report.failed += 1,
    }
  }
  Ok(report)
}

/// `Some(removed)` on success, `None` on failure.
pub(crate) async fn teardown_team(
  gameserver: &GameServer,
  team: &GameTeam,
) -> Option<bool> {
  let teardown_timeout = *gameserver.config().scheduler.teardown_timeout;
  let teardown = gameserver.provisioner().teardown(&team.env_name);
  match timeout(teardown_timeout, teardown).await {
    Ok(Ok(removed)) => {
      info!(
        "teardown game_id={} team_id={} env={} removed={}",
        team.game_id, team.team_id, team.env_name, removed
      );
      Some(removed)
    }
    Ok(Err(err)) => {
      warn!(
        "teardown failed game_id={} team_id={} env={}: {:#}",
        team.game_id, team.team_id, team.env_name, err
      );
      None
    }
    Err(_) => {
      warn!(
        "teardown timed out game_id={} team_id={} env={}",
        team.game_id, team.team_id, team.env_name
      );
      None
    }
  }
}
