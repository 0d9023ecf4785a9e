//! Tick phase 2: probe every team's service and record its SLA status.

use futures::stream::{self, StreamExt};
use tokio::time::timeout;

use crate::checker::CheckOutcome;
use crate::dal;
use crate::models::{CheckStatus, Game, GameTeam, Tick};
use crate::{Error, GameServer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
  pub up: usize,
  pub down: usize,
  pub error: usize,
}

impl CheckReport {
  fn count(&mut self, status: CheckStatus) {
    match status {
      CheckStatus::Up => self.up += 1,
      CheckStatus::Down => self.down += 1,
      CheckStatus::Error => self.error += 1,
    }
  }
}

/// Check all teams of a game, in parallel up to the worker limit. Every
/// team ends up with exactly one recorded status for the tick.
pub async fn check_all(
  gameserver: &GameServer,
  game: &Game,
  tick: &Tick,
  teams: &[GameTeam],
) -> CheckReport {
  let workers = gameserver.config().scheduler.max_workers;

  let checks: Vec<_> = teams
    .iter()
    .map(|team| check_up(gameserver, game, tick, team))
    .collect();
  let outcomes: Vec<CheckStatus> = stream::iter(checks)
    .buffer_unordered(workers)
    .collect()
    .await;

  let mut report = CheckReport::default();
  for status in outcomes {
    report.count(status);
  }
  report
}

async fn check_up(
  gameserver: &GameServer,
  game: &Game,
  tick: &Tick,
  team: &GameTeam,
) -> CheckStatus {
  let outcome = probe(gameserver, game, team).await;
  debug!(
    "check_up game_id={} team_id={} tick={} => {} {:?}",
    game.id, team.team_id, tick.tick_number, outcome.status, outcome.message
  );

  if let Err(err) = dal::service_status::upsert(
    gameserver.database(),
    tick,
    team.team_id,
    outcome.status,
    &outcome.message,
  )
  .await
  {
    error!(
      "could not record check game_id={} team_id={} tick={}: {:#}",
      game.id, team.team_id, tick.tick_number, err
    );
  }
  outcome.status
}

async fn probe(
  gameserver: &GameServer,
  game: &Game,
  team: &GameTeam,
) -> CheckOutcome {
  let script = match &game.checker_ref {
    Some(script) => script,
    None => return CheckOutcome::new(CheckStatus::Error, "no checker assigned"),
  };
  let endpoint = match team.endpoint() {
    Some(endpoint) if team.is_active => endpoint,
    _ => {
      return CheckOutcome::new(CheckStatus::Down, "environment is not running")
    }
  };

  let check_timeout = *gameserver.config().scheduler.check_timeout;
  let probe = gameserver.checker().check(&endpoint, script, check_timeout);
  let mut outcome = match timeout(check_timeout, probe).await {
    Ok(outcome) => outcome,
    Err(_) => {
      let err = Error::CheckerTimeout(format!(
        "no answer from {}:{} within {}s",
        endpoint.address,
        endpoint.port,
        check_timeout.as_secs()
      ));
      warn!(
        "check_up game_id={} team_id={}: {}",
        game.id, team.team_id, err
      );
      return CheckOutcome::new(CheckStatus::Error, err.to_string());
    }
  };

  // tell a broken service apart from a dead environment
  if outcome.status != CheckStatus::Up {
    let health = gameserver.provisioner().health_query(&endpoint);
    if let Ok(Ok(false)) = timeout(check_timeout, health).await {
      outcome.message = format!("{} (environment is down)", outcome.message)
        .trim_start()
        .to_owned();
    }
  }
  outcome
}
