use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::{Game, GameStatus};

use super::Db;

pub struct NewGame<'a> {
  pub name: &'a str,
  pub tick_duration: i64,
  pub max_ticks: Option<i64>,
  pub vulnbox_ref: Option<&'a str>,
  pub checker_ref: Option<&'a str>,
  pub secret: &'a str,
}

pub async fn create(db: &Db, game: NewGame<'_>) -> Result<Game> {
  let id = sqlx::query(
    "
    INSERT INTO games
      (name, status, current_tick, max_ticks, tick_duration,
       vulnbox_ref, checker_ref, secret, created_at)
    VALUES (?, 'draft', 0, ?, ?, ?, ?, ?, ?)
    ",
  )
  .bind(game.name)
  .bind(game.max_ticks)
  .bind(game.tick_duration)
  .bind(game.vulnbox_ref)
  .bind(game.checker_ref)
  .bind(game.secret)
  .bind(Utc::now())
  .execute(&db.0)
  .await
  .context("could not insert game")?
  .last_insert_rowid();

  get(db, id)
    .await?
    .context("game vanished right after insert")
}

pub async fn get(db: &Db, game_id: i64) -> Result<Option<Game>> {
  sqlx::query_as("SELECT * FROM games WHERE id = ?")
    .bind(game_id)
    .fetch_optional(&db.0)
    .await
    .context("could not look up game")
}

pub async fn list(db: &Db, skip: i64, limit: i64) -> Result<(Vec<Game>, i64)> {
  let games = sqlx::query_as("SELECT * FROM games ORDER BY id LIMIT ? OFFSET ?")
    .bind(limit)
    .bind(skip)
    .fetch_all(&db.0)
    .await
    .context("could not list games")?;
  let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM games")
    .fetch_one(&db.0)
    .await
    .context("could not count games")?;
  Ok((games, total))
}

/// All games currently in one of `statuses`.
pub async fn with_status(
  db: &Db,
  statuses: &[GameStatus],
) -> Result<Vec<Game>> {
  let sql = format!(
    "SELECT * FROM games WHERE status IN ({}) ORDER BY id",
    status_list(statuses)
  );
  sqlx::query_as(&sql)
    .fetch_all(&db.0)
    .await
    .context("could not list games by status")
}

pub async fn update(
  db: &Db,
  game_id: i64,
  name: &str,
  tick_duration: i64,
  max_ticks: Option<i64>,
) -> Result<()> {
  sqlx::query(
    "UPDATE games SET name = ?, tick_duration = ?, max_ticks = ? WHERE id = ?",
  )
  .bind(name)
  .bind(tick_duration)
  .bind(max_ticks)
  .bind(game_id)
  .execute(&db.0)
  .await
  .context("could not update game")?;
  Ok(())
}

/// Set the vulnbox/checker references. Only succeeds while the game is a
/// draft; returns whether a row changed.
pub async fn assign_refs(
  db: &Db,
  game_id: i64,
  vulnbox_ref: Option<&str>,
  checker_ref: Option<&str>,
) -> Result<bool> {
  let result = sqlx::query(
    "
    UPDATE games
    SET vulnbox_ref = COALESCE(?, vulnbox_ref),
        checker_ref = COALESCE(?, checker_ref)
    WHERE id = ? AND status = 'draft'
    ",
  )
  .bind(vulnbox_ref)
  .bind(checker_ref)
  .bind(game_id)
  .execute(&db.0)
  .await
  .context("could not assign game resources")?;
  Ok(result.rows_affected() == 1)
}

/// Delete a draft game and everything it owns.
pub async fn delete_draft(db: &Db, game_id: i64) -> Result<bool> {
  let result =
    sqlx::query("DELETE FROM games WHERE id = ? AND status = 'draft'")
      .bind(game_id)
      .execute(&db.0)
      .await
      .context("could not delete game")?;
  Ok(result.rows_affected() == 1)
}

/// Compare-and-set the game status. Returns false when the game was not in
/// any of the `from` states.
pub async fn transition(
  db: &Db,
  game_id: i64,
  from: &[GameStatus],
  to: GameStatus,
) -> Result<bool> {
  let sql = format!(
    "UPDATE games SET status = ? WHERE id = ? AND status IN ({})",
    status_list(from)
  );
  let result = sqlx::query(&sql)
    .bind(to)
    .bind(game_id)
    .execute(&db.0)
    .await
    .context("could not update game status")?;
  Ok(result.rows_affected() == 1)
}

fn status_list(statuses: &[GameStatus]) -> String {
  statuses
    .iter()
    .map(|status| format!("'{}'", status.as_str()))
    .collect::<Vec<_>>()
    .join(", ")
}
