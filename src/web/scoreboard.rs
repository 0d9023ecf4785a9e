use axum::extract::{Path, Query, State};
use axum::Json;

use crate::dal::{self, service_status::StatusFilter};
use crate::models::{Scoreboard, ScoreboardEntry, ServiceStatus};
use crate::GameServer;

use super::utils::ApiResult;

pub async fn scoreboards(
  State(gameserver): State<GameServer>,
) -> ApiResult<Vec<Scoreboard>> {
  Ok(Json(gameserver.scoreboards().await?))
}

pub async fn scoreboard(
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> ApiResult<Scoreboard> {
  Ok(Json(gameserver.scoreboard(game_id).await?))
}

pub async fn team_score(
  State(gameserver): State<GameServer>,
  Path((game_id, team_id)): Path<(i64, i64)>,
) -> ApiResult<ScoreboardEntry> {
  Ok(Json(gameserver.team_score(game_id, team_id).await?))
}

/// SLA history, newest tick first.
pub async fn check_up(
  State(gameserver): State<GameServer>,
  Query(filter): Query<StatusFilter>,
) -> ApiResult<Vec<ServiceStatus>> {
  let statuses = dal::service_status::list(gameserver.database(), &filter)
    .await?;
  Ok(Json(statuses))
}
