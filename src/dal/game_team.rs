use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::GameTeam;
use crate::provisioner::Endpoint;

use super::Db;

/// Environment name the provisioner uses for a team in a game.
pub fn env_name(game_id: i64, team_id: i64) -> String {
  format!("ad-g{}-t{}", game_id, team_id)
}

/// Bind a team to a game. Returns false if it was already bound.
pub async fn add(db: &Db, game_id: i64, team_id: i64) -> Result<bool> {
  let result = sqlx::query(
    "
    INSERT INTO game_teams (game_id, team_id, env_name, is_active, added_at)
    VALUES (?, ?, ?, 0, ?)
    ON CONFLICT (game_id, team_id) DO NOTHING
    ",
  )
  .bind(game_id)
  .bind(team_id)
  .bind(env_name(game_id, team_id))
  .bind(Utc::now())
  .execute(&db.0)
  .await
  .context("could not add team to game")?;
  Ok(result.rows_affected() == 1)
}

pub async fn remove(db: &Db, game_id: i64, team_id: i64) -> Result<bool> {
  let result =
    sqlx::query("DELETE FROM game_teams WHERE game_id = ? AND team_id = ?")
      .bind(game_id)
      .bind(team_id)
      .execute(&db.0)
      .await
      .context("could not remove team from game")?;
  Ok(result.rows_affected() == 1)
}

pub async fn get(
  db: &Db,
  game_id: i64,
  team_id: i64,
) -> Result<Option<GameTeam>> {
  sqlx::query_as("SELECT * FROM game_teams WHERE game_id = ? AND team_id = ?")
    .bind(game_id)
    .bind(team_id)
    .fetch_optional(&db.0)
    .await
    .context("could not look up game team")
}

pub async fn list(db: &Db, game_id: i64) -> Result<Vec<GameTeam>> {
  sqlx::query_as(
    "SELECT * FROM game_teams WHERE game_id = ? ORDER BY added_at, team_id",
  )
  .bind(game_id)
  .fetch_all(&db.0)
  .await
  .context("could not list game teams")
}

/// Record a provisioned environment and mark the team active.
pub async fn set_endpoint(
  db: &Db,
  game_id: i64,
  team_id: i64,
  endpoint: &Endpoint,
) -> Result<()> {
  sqlx::query(
    "
    UPDATE game_teams
    SET address = ?, port = ?, credentials = ?, is_active = 1
    WHERE game_id = ? AND team_id = ?
    ",
  )
  .bind(&endpoint.address)
  .bind(i64::from(endpoint.port))
  .bind(&endpoint.credentials)
  .bind(game_id)
  .bind(team_id)
  .execute(&db.0)
  .await
  .context("could not store team endpoint")?;
  Ok(())
}

pub async fn set_active(
  db: &Db,
  game_id: i64,
  team_id: i64,
  is_active: bool,
) -> Result<()> {
  sqlx::query(
    "UPDATE game_teams SET is_active = ? WHERE game_id = ? AND team_id = ?",
  )
  .bind(is_active)
  .bind(game_id)
  .bind(team_id)
  .execute(&db.0)
  .await
  .context("could not update team activity")?;
  Ok(())
}

/// Mark every team of a game inactive, e.g. after teardown.
pub async fn deactivate_all(db: &Db, game_id: i64) -> Result<()> {
  sqlx::query("UPDATE game_teams SET is_active = 0 WHERE game_id = ?")
    .bind(game_id)
    .execute(&db.0)
    .await
    .context("could not deactivate game teams")?;
  Ok(())
}
