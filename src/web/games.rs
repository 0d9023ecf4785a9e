use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::controllers::game::{GameForm, GameList, GameUpdate, ResourceRefs};
use crate::dal;
use crate::models::{Flag, FlagStats, Game, GameStatus, GameTeam, Tick};
use crate::{Error, GameServer, StopReport};

use super::utils::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct Page {
  #[serde(default)]
  skip: i64,
  #[serde(default = "default_limit")]
  limit: i64,
}

fn default_limit() -> i64 {
  100
}

#[derive(Serialize)]
pub struct DeleteResponse {
  success: bool,
  message: String,
}

pub async fn list(
  State(gameserver): State<GameServer>,
  Query(page): Query<Page>,
) -> ApiResult<GameList> {
  Ok(Json(gameserver.list_games(page.skip, page.limit).await?))
}

pub async fn create(
  State(gameserver): State<GameServer>,
  form: Result<Json<GameForm>, JsonRejection>,
) -> Result<(StatusCode, Json<Game>), ApiError> {
  let Json(form) = form?;
  let game = gameserver.create_game(form).await?;
  Ok((StatusCode::CREATED, Json(game)))
}

pub async fn get(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<Game> {
  Ok(Json(gameserver.get_game(game_id).await?))
}

pub async fn update(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
  update: Result<Json<GameUpdate>, JsonRejection>,
) -> ApiResult<Game> {
  let Json(update) = update?;
  Ok(Json(gameserver.update_game(game_id, update).await?))
}

pub async fn delete(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<DeleteResponse> {
  gameserver.delete_game(game_id).await?;
  Ok(Json(DeleteResponse {
    success: true,
    message: format!("game {} deleted", game_id),
  }))
}

pub async fn start(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<Game> {
  Ok(Json(gameserver.start(game_id).await?))
}

pub async fn pause(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<Game> {
  Ok(Json(gameserver.pause(game_id).await?))
}

pub async fn stop(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<StopReport> {
  Ok(Json(gameserver.stop(game_id).await?))
}

pub async fn force_stop(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<StopReport> {
  Ok(Json(gameserver.force_stop(game_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct VulnboxQuery {
  #[serde(alias = "vulnboxId")]
  vulnbox_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckerQuery {
  #[serde(alias = "checkerId")]
  checker_id: String,
}

pub async fn assign_vulnbox(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
  query: Result<Query<VulnboxQuery>, QueryRejection>,
) -> ApiResult<Game> {
  let Query(query) = query?;
  let refs = ResourceRefs {
    vulnbox_ref: Some(query.vulnbox_id),
    checker_ref: None,
  };
  Ok(Json(gameserver.assign_refs(game_id, refs).await?))
}

pub async fn assign_checker(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
  query: Result<Query<CheckerQuery>, QueryRejection>,
) -> ApiResult<Game> {
  let Query(query) = query?;
  let refs = ResourceRefs {
    vulnbox_ref: None,
    checker_ref: Some(query.checker_id),
  };
  Ok(Json(gameserver.assign_refs(game_id, refs).await?))
}

pub async fn list_teams(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<Vec<GameTeam>> {
  Ok(Json(gameserver.teams(game_id).await?))
}

pub async fn get_team(
  State(gameserver): State<GameServer>,
  Path((game_id, team_id)): Path<(i64, i64)>,
) -> ApiResult<GameTeam> {
  Ok(Json(gameserver.team(game_id, team_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct TeamForm {
  #[serde(alias = "teamId")]
  team_id: i64,
  #[serde(default)]
  force: bool,
}

pub async fn add_team(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
  form: Result<Json<TeamForm>, JsonRejection>,
) -> Result<(StatusCode, Json<GameTeam>), ApiError> {
  let Json(form) = form?;
  let team = gameserver.add_team(game_id, form.team_id, form.force).await?;
  Ok((StatusCode::CREATED, Json(team)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
  #[serde(default)]
  force: bool,
}

pub async fn remove_team(
  State(gameserver): State<GameServer>,
  Path((game_id, team_id)): Path<(i64, i64)>,
  Query(query): Query<ForceQuery>,
) -> ApiResult<DeleteResponse> {
  gameserver.remove_team(game_id, team_id, query.force).await?;
  Ok(Json(DeleteResponse {
    success: true,
    message: format!("team {} removed from game {}", team_id, game_id),
  }))
}

#[derive(Debug, Deserialize)]
pub struct GameQuery {
  #[serde(alias = "gameId")]
  game_id: i64,
}

pub async fn list_ticks(
  State(gameserver): State<GameServer>,
  query: Result<Query<GameQuery>, QueryRejection>,
) -> ApiResult<Vec<Tick>> {
  let Query(query) = query?;
  gameserver.get_game(query.game_id).await?;
  let ticks = dal::tick::list(gameserver.database(), query.game_id).await?;
  Ok(Json(ticks))
}

pub async fn current_tick(
  State(gameserver): State<GameServer>,
  query: Result<Query<GameQuery>, QueryRejection>,
) -> ApiResult<Option<Tick>> {
  let Query(query) = query?;
  gameserver.get_game(query.game_id).await?;
  let tick = dal::tick::current(gameserver.database(), query.game_id).await?;
  Ok(Json(tick))
}

pub async fn get_tick(
  State(gameserver): State<GameServer>,
  Path(tick_id): Path<i64>,
) -> ApiResult<Tick> {
  let tick = dal::tick::get(gameserver.database(), tick_id)
    .await?
    .ok_or_else(|| Error::not_found("tick", tick_id))?;
  Ok(Json(tick))
}

#[derive(Debug, Deserialize)]
pub struct FlagQuery {
  #[serde(alias = "gameId")]
  game_id: i64,
  #[serde(default, alias = "teamId")]
  team_id: Option<i64>,
  #[serde(default, alias = "tickNumber")]
  tick_number: Option<i64>,
}

/// Flags never carry their value out of the server while a game can still
/// be played.
#[derive(Serialize)]
pub struct FlagView {
  id: i64,
  tick_number: i64,
  team_id: i64,
  flag_value: Option<String>,
  is_stolen: bool,
  stolen_by: Option<i64>,
}

impl FlagView {
  fn new(flag: Flag, reveal: bool) -> Self {
    FlagView {
      id: flag.id,
      tick_number: flag.tick_number,
      team_id: flag.team_id,
      flag_value: if reveal { Some(flag.flag_value) } else { None },
      is_stolen: flag.is_stolen,
      stolen_by: flag.stolen_by,
    }
  }
}

pub async fn list_flags(
  State(gameserver): State<GameServer>,
  query: Result<Query<FlagQuery>, QueryRejection>,
) -> ApiResult<Vec<FlagView>> {
  let Query(query) = query?;
  let game = gameserver.get_game(query.game_id).await?;
  let reveal = game.status == GameStatus::Finished;
  let flags = dal::flag::list(
    gameserver.database(),
    query.game_id,
    query.team_id,
    query.tick_number,
  )
  .await?;
  let flags = flags
    .into_iter()
    .map(|flag| FlagView::new(flag, reveal))
    .collect();
  Ok(Json(flags))
}

pub async fn flag_stats(
  State(gameserver): State<GameServer>,
  query: Result<Query<GameQuery>, QueryRejection>,
) -> ApiResult<FlagStats> {
  let Query(query) = query?;
  gameserver.get_game(query.game_id).await?;
  let stats = dal::flag::stats(gameserver.database(), query.game_id).await?;
  Ok(Json(stats))
}
