//! Tick phase 1: mint a flag for every team and plant it in the team's
//! environment.

use futures::stream::{self, StreamExt};
use tokio::time::timeout;

use crate::dal;
use crate::key::generate_flag;
use crate::models::{Game, GameTeam, Tick};
use crate::GameServer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DistributionReport {
  pub minted: usize,
  pub injected: usize,
}

#[derive(Clone, Copy)]
enum Delivery {
  Failed,
  Minted,
  Injected,
}

/// Mint and inject flags for all teams of a game. Per-team failures are
/// logged and never abort the phase.
pub async fn distribute(
  gameserver: &GameServer,
  game: &Game,
  tick: &Tick,
  teams: &[GameTeam],
) -> DistributionReport {
  let workers = gameserver.config().scheduler.max_workers;

  let jobs: Vec<_> = teams
    .iter()
    .map(|team| deliver(gameserver, game, tick, team))
    .collect();
  let deliveries: Vec<Delivery> = stream::iter(jobs)
    .buffer_unordered(workers)
    .collect()
    .await;

  let mut report = DistributionReport::default();
  for delivery in deliveries {
    match delivery {
      Delivery::Failed => {}
      Delivery::Minted => report.minted += 1,
      Delivery::Injected => {
        report.minted += 1;
        report.injected += 1;
      }
    }
  }
  report
}

async fn deliver(
  gameserver: &GameServer,
  game: &Game,
  tick: &Tick,
  team: &GameTeam,
) -> Delivery {
  let db = gameserver.database();
  let inject_timeout = gameserver.config().scheduler.inject_timeout;
  let info = format!(
    "game_id={} team_id={} tick={}",
    game.id, team.team_id, tick.tick_number
  );

  let value =
    match generate_flag(&game.secret, game.id, team.team_id, tick.tick_number)
    {
      Ok(value) => value,
      Err(err) => {
        error!("could not derive flag {}: {:#}", info, err);
        return Delivery::Failed;
      }
    };
  let flag = match dal::flag::insert(db, tick, team.team_id, &value).await {
    Ok(flag) => flag,
    Err(err) => {
      error!("could not store flag {}: {:#}", info, err);
      return Delivery::Failed;
    }
  };

  let endpoint = match team.endpoint() {
    Some(endpoint) if team.is_active => endpoint,
    _ => {
      debug!("set_flag skipped, environment inactive {}", info);
      return Delivery::Minted;
    }
  };

  info!("set_flag {} flag_id={}", info, flag.id);
  let injection = gameserver
    .provisioner()
    .inject_flag(&endpoint, &flag.flag_value);
  match timeout(*inject_timeout, injection).await {
    Ok(Ok(())) => Delivery::Injected,
    Ok(Err(err)) => {
      warn!("set_flag failed {}: {:#}", info, err);
      Delivery::Minted
    }
    Err(_) => {
      warn!(
        "set_flag timed out after {}s {}",
        inject_timeout.as_secs(),
        info
      );
      Delivery::Minted
    }
  }
}
