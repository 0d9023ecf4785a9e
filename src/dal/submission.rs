use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;

use crate::models::{Submission, SubmissionStatus};

use super::Db;

pub struct NewSubmission<'a> {
  pub game_id: i64,
  pub team_id: i64,
  pub submitted_flag: &'a str,
  pub flag_id: Option<i64>,
  pub tick_number: i64,
  pub status: SubmissionStatus,
  pub points: i64,
}

/// Append a submission. Submissions are never updated afterwards.
pub async fn insert(
  conn: &mut SqliteConnection,
  new: NewSubmission<'_>,
) -> Result<Submission> {
  sqlx::query_as(
    "
    INSERT INTO submissions
      (game_id, team_id, submitted_flag, flag_id, tick_number,
       status, points, submitted_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    RETURNING *
    ",
  )
  .bind(new.game_id)
  .bind(new.team_id)
  .bind(new.submitted_flag)
  .bind(new.flag_id)
  .bind(new.tick_number)
  .bind(new.status)
  .bind(new.points)
  .bind(Utc::now())
  .fetch_one(conn)
  .await
  .context("could not insert submission")
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmissionFilter {
  #[serde(alias = "gameId")]
  pub game_id: Option<i64>,
  #[serde(alias = "teamId")]
  pub team_id: Option<i64>,
  pub status: Option<SubmissionStatus>,
  pub skip: Option<i64>,
  pub limit: Option<i64>,
}

pub async fn list(db: &Db, filter: &SubmissionFilter) -> Result<Vec<Submission>> {
  sqlx::query_as(
    "
    SELECT * FROM submissions
    WHERE (? IS NULL OR game_id = ?)
      AND (? IS NULL OR team_id = ?)
      AND (? IS NULL OR status = ?)
    ORDER BY id DESC
    LIMIT ? OFFSET ?
    ",
  )
  .bind(filter.game_id)
  .bind(filter.game_id)
  .bind(filter.team_id)
  .bind(filter.team_id)
  .bind(filter.status)
  .bind(filter.status)
  .bind(filter.limit.unwrap_or(50).clamp(1, 500))
  .bind(filter.skip.unwrap_or(0).max(0))
  .fetch_all(&db.0)
  .await
  .context("could not list submissions")
}

pub async fn get(db: &Db, submission_id: i64) -> Result<Option<Submission>> {
  sqlx::query_as("SELECT * FROM submissions WHERE id = ?")
    .bind(submission_id)
    .fetch_optional(&db.0)
    .await
    .context("could not look up submission")
}

/// Accepted submissions of a game with `id <= through`, in id order.
pub async fn accepted_through(
  db: &Db,
  game_id: i64,
  through: i64,
) -> Result<Vec<Submission>> {
  sqlx::query_as(
    "
    SELECT * FROM submissions
    WHERE game_id = ? AND status = 'accepted' AND id <= ?
    ORDER BY id
    ",
  )
  .bind(game_id)
  .bind(through)
  .fetch_all(&db.0)
  .await
  .context("could not list accepted submissions")
}
