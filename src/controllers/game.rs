//! Game resource management: everything that doesn't touch the clock.

use crate::dal::{self, game::NewGame, Db};
use crate::key::generate_secret;
use crate::models::{Game, GameStatus, GameTeam};
use crate::{Error, Result};

pub const MIN_TICK_DURATION: i64 = 10;
pub const MAX_TICK_DURATION: i64 = 600;
const MAX_NAME_LEN: usize = 100;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GameForm {
  pub name: String,
  pub tick_duration: i64,
  #[serde(default)]
  pub max_ticks: Option<i64>,
  #[serde(default)]
  pub vulnbox_ref: Option<String>,
  #[serde(default)]
  pub checker_ref: Option<String>,
}

impl GameForm {
  fn validate(&self) -> Result<()> {
    let name = self.name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
      return Err(Error::Validation(format!(
        "name must be 1 to {} characters",
        MAX_NAME_LEN
      )));
    }
    if !(MIN_TICK_DURATION..=MAX_TICK_DURATION).contains(&self.tick_duration) {
      return Err(Error::Validation(format!(
        "tick_duration must be between {} and {} seconds",
        MIN_TICK_DURATION, MAX_TICK_DURATION
      )));
    }
    if let Some(max_ticks) = self.max_ticks {
      if max_ticks < 1 {
        return Err(Error::Validation(
          "max_ticks must be at least 1".to_owned(),
        ));
      }
    }
    Ok(())
  }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GameUpdate {
  pub name: Option<String>,
  pub tick_duration: Option<i64>,
  /// `Some(None)` clears the bound.
  #[serde(default, with = "double_option")]
  pub max_ticks: Option<Option<i64>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResourceRefs {
  pub vulnbox_ref: Option<String>,
  pub checker_ref: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GameList {
  pub games: Vec<Game>,
  pub total: i64,
}

pub async fn create(db: &Db, form: GameForm) -> Result<Game> {
  form.validate()?;
  let secret = generate_secret();
  let game = dal::game::create(
    db,
    NewGame {
      name: form.name.trim(),
      tick_duration: form.tick_duration,
      max_ticks: form.max_ticks,
      vulnbox_ref: form.vulnbox_ref.as_deref(),
      checker_ref: form.checker_ref.as_deref(),
      secret: &secret,
    },
  )
  .await?;
  info!("created game game_id={} name={:?}", game.id, game.name);
  Ok(game)
}

pub async fn get(db: &Db, game_id: i64) -> Result<Game> {
  dal::game::get(db, game_id)
    .await?
    .ok_or_else(|| Error::not_found("game", game_id))
}

pub async fn list(db: &Db, skip: i64, limit: i64) -> Result<GameList> {
  let (games, total) =
    dal::game::list(db, skip.max(0), limit.clamp(1, 500)).await?;
  Ok(GameList { games, total })
}

/// Change the settings of a game that isn't on the clock.
///
/// The clock reads `tick_duration` when it starts, so running games must be
/// paused first.
pub async fn update(db: &Db, game_id: i64, update: GameUpdate) -> Result<Game> {
  let game = get(db, game_id).await?;
  if !matches!(game.status, GameStatus::Draft | GameStatus::Paused) {
    return Err(Error::Conflict(format!(
      "game {} is {}, only draft or paused games can be edited",
      game_id, game.status
    )));
  }

  let form = GameForm {
    name: update.name.unwrap_or(game.name),
    tick_duration: update.tick_duration.unwrap_or(game.tick_duration),
    max_ticks: update.max_ticks.unwrap_or(game.max_ticks),
    ..GameForm::default()
  };
  form.validate()?;
  if let Some(max_ticks) = form.max_ticks {
    if max_ticks < game.current_tick {
      return Err(Error::Validation(format!(
        "max_ticks can't be below the current tick {}",
        game.current_tick
      )));
    }
  }

  dal::game::update(
    db,
    game_id,
    form.name.trim(),
    form.tick_duration,
    form.max_ticks,
  )
  .await?;
  get(db, game_id).await
}

/// Delete a game. Only drafts can be deleted; their teams, ticks and flags
/// go with them.
pub async fn delete(db: &Db, game_id: i64) -> Result<()> {
  let game = get(db, game_id).await?;
  if !dal::game::delete_draft(db, game_id).await? {
    return Err(Error::Conflict(format!(
      "game {} is {}, only drafts can be deleted",
      game_id, game.status
    )));
  }
  info!("deleted game game_id={}", game_id);
  Ok(())
}

/// Attach the vulnbox image and checker script. Both are frozen once the
/// game leaves `draft`.
pub async fn assign_refs(
  db: &Db,
  game_id: i64,
  refs: ResourceRefs,
) -> Result<Game> {
  if refs.vulnbox_ref.is_none() && refs.checker_ref.is_none() {
    return Err(Error::Validation(
      "nothing to assign: give vulnbox_ref or checker_ref".to_owned(),
    ));
  }
  for value in [&refs.vulnbox_ref, &refs.checker_ref].into_iter().flatten() {
    if value.trim().is_empty() {
      return Err(Error::Validation("references must not be empty".to_owned()));
    }
  }

  let game = get(db, game_id).await?;
  let assigned = dal::game::assign_refs(
    db,
    game_id,
    refs.vulnbox_ref.as_deref().map(str::trim),
    refs.checker_ref.as_deref().map(str::trim),
  )
  .await?;
  if !assigned {
    return Err(Error::Conflict(format!(
      "game {} is {}, resources can only change in draft",
      game_id, game.status
    )));
  }
  get(db, game_id).await
}

/// Bind a roster team to a game.
pub async fn add_team(
  db: &Db,
  game_id: i64,
  team_id: i64,
  force: bool,
) -> Result<GameTeam> {
  let game = get(db, game_id).await?;
  check_roster_change(&game, force)?;
  if dal::team::get(db, team_id).await?.is_none() {
    return Err(Error::not_found("team", team_id));
  }
  if !dal::game_team::add(db, game_id, team_id).await? {
    return Err(Error::Conflict(format!(
      "team {} is already in game {}",
      team_id, game_id
    )));
  }
  dal::game_team::get(db, game_id, team_id)
    .await?
    .ok_or_else(|| Error::not_found("game team", team_id))
}

/// Unbind a team, returning the binding that was removed. Tearing down its
/// environment is up to the caller.
pub async fn remove_team(
  db: &Db,
  game_id: i64,
  team_id: i64,
  force: bool,
) -> Result<GameTeam> {
  let game = get(db, game_id).await?;
  check_roster_change(&game, force)?;
  let game_team = dal::game_team::get(db, game_id, team_id)
    .await?
    .ok_or_else(|| {
      Error::NotFound(format!("team {} in game {}", team_id, game_id))
    })?;
  dal::game_team::remove(db, game_id, team_id).await?;
  Ok(game_team)
}

fn check_roster_change(game: &Game, force: bool) -> Result<()> {
  match game.status {
    GameStatus::Draft => Ok(()),
    GameStatus::Finished => Err(Error::Conflict(format!(
      "game {} is finished",
      game.id
    ))),
    _ if force => Ok(()),
    status => Err(Error::Conflict(format!(
      "game {} is {}, teams can only change in draft without force",
      game.id, status
    ))),
  }
}

/// Distinguishes a missing field from an explicit `null`.
mod double_option {
  use serde::{Deserialize, Deserializer};

  pub fn deserialize<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
  where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
  {
    Deserialize::deserialize(de).map(Some)
  }
}
