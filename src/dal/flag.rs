use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;

use crate::models::{Flag, FlagStats, TeamFlagStats, Tick};

use super::Db;

/// Store a minted flag, or return the one already stored for the same
/// (game, team, tick).
pub async fn insert(
  db: &Db,
  tick: &Tick,
  team_id: i64,
  flag_value: &str,
) -> Result<Flag> {
  sqlx::query(
    "
    INSERT INTO flags
      (game_id, tick_id, tick_number, team_id, flag_value, created_at)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT (game_id, team_id, tick_number) DO NOTHING
    ",
  )
  .bind(tick.game_id)
  .bind(tick.id)
  .bind(tick.tick_number)
  .bind(team_id)
  .bind(flag_value)
  .bind(Utc::now())
  .execute(&db.0)
  .await
  .context("could not insert flag")?;

  sqlx::query_as(
    "
    SELECT * FROM flags
    WHERE game_id = ? AND team_id = ? AND tick_number = ?
    ",
  )
  .bind(tick.game_id)
  .bind(team_id)
  .bind(tick.tick_number)
  .fetch_one(&db.0)
  .await
  .context("could not read minted flag")
}

pub async fn find_by_flag(
  db: &Db,
  game_id: i64,
  flag_value: &str,
) -> Result<Option<Flag>> {
  sqlx::query_as("SELECT * FROM flags WHERE game_id = ? AND flag_value = ?")
    .bind(game_id)
    .bind(flag_value)
    .fetch_optional(&db.0)
    .await
    .context("could not look up flag")
}

pub async fn get(
  conn: &mut SqliteConnection,
  flag_id: i64,
) -> Result<Option<Flag>> {
  sqlx::query_as("SELECT * FROM flags WHERE id = ?")
    .bind(flag_id)
    .fetch_optional(conn)
    .await
    .context("could not look up flag")
}

/// Claim a flag for `team_id` if nobody has yet. Returns whether this call
/// won the claim; the conditional update is the single arbiter.
pub async fn claim(
  conn: &mut SqliteConnection,
  flag_id: i64,
  team_id: i64,
) -> Result<bool> {
  let result = sqlx::query(
    "
    UPDATE flags SET is_stolen = 1, stolen_by = ?
    WHERE id = ? AND stolen_by IS NULL
    ",
  )
  .bind(team_id)
  .bind(flag_id)
  .execute(conn)
  .await
  .context("could not claim flag")?;
  Ok(result.rows_affected() == 1)
}

pub async fn list(
  db: &Db,
  game_id: i64,
  team_id: Option<i64>,
  tick_number: Option<i64>,
) -> Result<Vec<Flag>> {
  sqlx::query_as(
    "
    SELECT * FROM flags
    WHERE game_id = ?
      AND (? IS NULL OR team_id = ?)
      AND (? IS NULL OR tick_number = ?)
    ORDER BY tick_number, team_id
    ",
  )
  .bind(game_id)
  .bind(team_id)
  .bind(team_id)
  .bind(tick_number)
  .bind(tick_number)
  .fetch_all(&db.0)
  .await
  .context("could not list flags")
}

pub async fn stats(db: &Db, game_id: i64) -> Result<FlagStats> {
  let (total, stolen): (i64, i64) = sqlx::query_as(
    "
    SELECT COUNT(*), COALESCE(SUM(is_stolen), 0)
    FROM flags WHERE game_id = ?
    ",
  )
  .bind(game_id)
  .fetch_one(&db.0)
  .await
  .context("could not count flags")?;

  let by_team: Vec<TeamFlagStats> = sqlx::query_as(
    "
    SELECT gt.team_id AS team_id,
      (SELECT COUNT(*) FROM flags f
        WHERE f.game_id = gt.game_id AND f.team_id = gt.team_id) AS owned,
      (SELECT COUNT(*) FROM flags f
        WHERE f.game_id = gt.game_id AND f.team_id = gt.team_id
          AND f.is_stolen = 1) AS lost,
      (SELECT COUNT(*) FROM flags f
        WHERE f.game_id = gt.game_id AND f.stolen_by = gt.team_id) AS captured
    FROM game_teams gt
    WHERE gt.game_id = ?
    ORDER BY gt.team_id
    ",
  )
  .bind(game_id)
  .fetch_all(&db.0)
  .await
  .context("could not compute per-team flag stats")?;

  Ok(FlagStats {
    total,
    stolen,
    by_team,
  })
}
