use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;

use crate::controllers::flag::SubmitOutcome;
use crate::dal::{self, submission::SubmissionFilter};
use crate::models::Submission;
use crate::{Error, GameServer};

use super::utils::ApiResult;

#[derive(Debug, Deserialize)]
pub struct Form {
  #[serde(alias = "gameId")]
  game_id: i64,
  #[serde(alias = "teamId")]
  team_id: i64,
  flag: String,
}

// Submitting flags as someone else only sabotages yourself, so the team id is
// taken at face value.
pub async fn submit_flag(
  State(gameserver): State<GameServer>,
  form: Result<Json<Form>, JsonRejection>,
) -> ApiResult<SubmitOutcome> {
  let Json(form) = form?;
  let outcome = gameserver
    .submit_flag(form.game_id, form.team_id, &form.flag)
    .await?;
  Ok(Json(outcome))
}

pub async fn list(
  State(gameserver): State<GameServer>,
  Query(filter): Query<SubmissionFilter>,
) -> ApiResult<Vec<Submission>> {
  let submissions =
    dal::submission::list(gameserver.database(), &filter).await?;
  Ok(Json(submissions))
}

pub async fn get(
  State(gameserver): State<GameServer>,
  Path(submission_id): Path<i64>,
) -> ApiResult<Submission> {
  let submission = dal::submission::get(gameserver.database(), submission_id)
    .await?
    .ok_or_else(|| Error::not_found("submission", submission_id))?;
  Ok(Json(submission))
}
