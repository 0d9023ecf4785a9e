use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::{CheckStatus, ServiceStatus, Tick};

use super::Db;

/// Record the SLA result of a team for a tick, replacing an earlier attempt.
pub async fn upsert(
  db: &Db,
  tick: &Tick,
  team_id: i64,
  status: CheckStatus,
  message: &str,
) -> Result<()> {
  sqlx::query(
    "
    INSERT INTO service_statuses
      (game_id, tick_id, tick_number, team_id, status, message, checked_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (tick_id, team_id) DO UPDATE
    SET status = excluded.status,
        message = excluded.message,
        checked_at = excluded.checked_at
    ",
  )
  .bind(tick.game_id)
  .bind(tick.id)
  .bind(tick.tick_number)
  .bind(team_id)
  .bind(status)
  .bind(message)
  .bind(Utc::now())
  .execute(&db.0)
  .await
  .context("could not insert service status")?;
  Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusFilter {
  #[serde(alias = "gameId")]
  pub game_id: Option<i64>,
  #[serde(alias = "teamId")]
  pub team_id: Option<i64>,
  #[serde(alias = "tickId")]
  pub tick_id: Option<i64>,
  pub skip: Option<i64>,
  pub limit: Option<i64>,
}

pub async fn list(db: &Db, filter: &StatusFilter) -> Result<Vec<ServiceStatus>> {
  sqlx::query_as(
    "
    SELECT * FROM service_statuses
    WHERE (? IS NULL OR game_id = ?)
      AND (? IS NULL OR team_id = ?)
      AND (? IS NULL OR tick_id = ?)
    ORDER BY tick_number DESC, team_id
    LIMIT ? OFFSET ?
    ",
  )
  .bind(filter.game_id)
  .bind(filter.game_id)
  .bind(filter.team_id)
  .bind(filter.team_id)
  .bind(filter.tick_id)
  .bind(filter.tick_id)
  .bind(filter.limit.unwrap_or(50).clamp(1, 500))
  .bind(filter.skip.unwrap_or(0).max(0))
  .fetch_all(&db.0)
  .await
  .context("could not list service statuses")
}

pub async fn for_game(db: &Db, game_id: i64) -> Result<Vec<ServiceStatus>> {
  sqlx::query_as(
    "SELECT * FROM service_statuses WHERE game_id = ? ORDER BY tick_number, team_id",
  )
  .bind(game_id)
  .fetch_all(&db.0)
  .await
  .context("could not load service statuses")
}
