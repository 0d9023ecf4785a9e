use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::Team;

use super::Db;

/// Insert a roster team if it isn't known yet. Existing rows are untouched.
pub async fn create(db: &Db, team_id: i64, name: &str) -> Result<()> {
  sqlx::query(
    "
    INSERT INTO teams (id, name, registered_at)
    VALUES (?, ?, ?)
    ON CONFLICT (id) DO NOTHING
    ",
  )
  .bind(team_id)
  .bind(name)
  .bind(Utc::now())
  .execute(&db.0)
  .await
  .context("could not insert team")?;

  Ok(())
}

pub async fn get(db: &Db, team_id: i64) -> Result<Option<Team>> {
  sqlx::query_as("SELECT * FROM teams WHERE id = ?")
    .bind(team_id)
    .fetch_optional(&db.0)
    .await
    .context("could not look up team")
}

/// All teams in registration order.
pub async fn get_all(db: &Db) -> Result<Vec<Team>> {
  sqlx::query_as("SELECT * FROM teams ORDER BY registered_at, id")
    .fetch_all(&db.0)
    .await
    .context("could not list teams")
}
