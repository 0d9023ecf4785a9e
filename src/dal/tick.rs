use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::Tick;

use super::Db;

/// Mark ticks left `active` by a previous run as `error`.
pub async fn clear_in_progress(db: &Db) -> Result<u64> {
  let result = sqlx::query(
    "UPDATE ticks SET status = 'error', ended_at = ? WHERE status = 'active'",
  )
  .bind(Utc::now())
  .execute(&db.0)
  .await
  .context("could not clear in-progress ticks")?;
  Ok(result.rows_affected())
}

/// Open tick `tick_number` for a game, making it the only active tick.
///
/// Re-opening a tick that previously failed keeps its id, flags, and
/// scoring watermark.
pub async fn begin(db: &Db, game_id: i64, tick_number: i64) -> Result<Tick> {
  let mut tx = db.begin().await.context("could not start transaction")?;
  let now = Utc::now();

  sqlx::query(
    "
    UPDATE ticks SET status = 'error', ended_at = ?
    WHERE game_id = ? AND status = 'active' AND tick_number != ?
    ",
  )
  .bind(now)
  .bind(game_id)
  .bind(tick_number)
  .execute(&mut *tx)
  .await
  .context("could not close stale ticks")?;

  sqlx::query(
    "
    INSERT INTO ticks (game_id, tick_number, status, started_at)
    VALUES (?, ?, 'active', ?)
    ON CONFLICT (game_id, tick_number) DO UPDATE
    SET status = 'active', started_at = excluded.started_at, ended_at = NULL
    ",
  )
  .bind(game_id)
  .bind(tick_number)
  .bind(now)
  .execute(&mut *tx)
  .await
  .context("could not open tick")?;

  let tick = sqlx::query_as(
    "SELECT * FROM ticks WHERE game_id = ? AND tick_number = ?",
  )
  .bind(game_id)
  .bind(tick_number)
  .fetch_one(&mut *tx)
  .await
  .context("could not read opened tick")?;

  tx.commit().await.context("could not commit tick")?;
  Ok(tick)
}

/// Fix the scoring window of a tick at the newest submission so far.
/// An existing watermark is kept, so repeated calls are no-ops.
pub async fn seal_submissions(db: &Db, tick: &Tick) -> Result<i64> {
  sqlx::query(
    "
    UPDATE ticks
    SET scored_through = COALESCE(
      scored_through,
      (SELECT COALESCE(MAX(id), 0) FROM submissions WHERE game_id = ?)
    )
    WHERE id = ?
    ",
  )
  .bind(tick.game_id)
  .bind(tick.id)
  .execute(&db.0)
  .await
  .context("could not seal tick submissions")?;

  let (watermark,): (i64,) =
    sqlx::query_as("SELECT scored_through FROM ticks WHERE id = ?")
      .bind(tick.id)
      .fetch_one(&db.0)
      .await
      .context("could not read tick watermark")?;
  Ok(watermark)
}

/// Close a tick and advance the game's current tick in one step.
pub async fn complete(db: &Db, tick: &Tick) -> Result<()> {
  let mut tx = db.begin().await.context("could not start transaction")?;

  sqlx::query(
    "UPDATE ticks SET status = 'completed', ended_at = ? WHERE id = ?",
  )
  .bind(Utc::now())
  .bind(tick.id)
  .execute(&mut *tx)
  .await
  .context("could not complete tick")?;

  sqlx::query(
    "
    UPDATE games SET current_tick = ?
    WHERE id = ? AND current_tick < ?
    ",
  )
  .bind(tick.tick_number)
  .bind(tick.game_id)
  .bind(tick.tick_number)
  .execute(&mut *tx)
  .await
  .context("could not bump current tick")?;

  tx.commit().await.context("could not commit tick")?;
  Ok(())
}

pub async fn fail(db: &Db, tick_id: i64) -> Result<()> {
  sqlx::query(
    "
    UPDATE ticks SET status = 'error', ended_at = ?
    WHERE id = ? AND status = 'active'
    ",
  )
  .bind(Utc::now())
  .bind(tick_id)
  .execute(&db.0)
  .await
  .context("could not fail tick")?;
  Ok(())
}

/// Close whatever tick of a game is still `active` as `error`, for a tick
/// that was abandoned mid-flight.
pub async fn fail_active(db: &Db, game_id: i64) -> Result<u64> {
  let result = sqlx::query(
    "
    UPDATE ticks SET status = 'error', ended_at = ?
    WHERE game_id = ? AND status = 'active'
    ",
  )
  .bind(Utc::now())
  .bind(game_id)
  .execute(&db.0)
  .await
  .context("could not fail active tick")?;
  Ok(result.rows_affected())
}

pub async fn get(db: &Db, tick_id: i64) -> Result<Option<Tick>> {
  sqlx::query_as("SELECT * FROM ticks WHERE id = ?")
    .bind(tick_id)
    .fetch_optional(&db.0)
    .await
    .context("could not look up tick")
}

pub async fn list(db: &Db, game_id: i64) -> Result<Vec<Tick>> {
  sqlx::query_as("SELECT * FROM ticks WHERE game_id = ? ORDER BY tick_number")
    .bind(game_id)
    .fetch_all(&db.0)
    .await
    .context("could not list ticks")
}

/// Ticks that have a scoring window, in order.
pub async fn list_scored(db: &Db, game_id: i64) -> Result<Vec<Tick>> {
  sqlx::query_as(
    "
    SELECT * FROM ticks
    WHERE game_id = ? AND scored_through IS NOT NULL
    ORDER BY tick_number
    ",
  )
  .bind(game_id)
  .fetch_all(&db.0)
  .await
  .context("could not list scored ticks")
}

/// The active tick if there is one, otherwise the newest tick.
pub async fn current(db: &Db, game_id: i64) -> Result<Option<Tick>> {
  sqlx::query_as(
    "
    SELECT * FROM ticks WHERE game_id = ?
    ORDER BY (status = 'active') DESC, tick_number DESC
    LIMIT 1
    ",
  )
  .bind(game_id)
  .fetch_optional(&db.0)
  .await
  .context("could not look up current tick")
}
