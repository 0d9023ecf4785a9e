//! Database abstraction layer

use std::ops::Deref;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub mod flag;
pub mod game;
pub mod game_team;
pub mod service_status;
pub mod submission;
pub mod team;
pub mod tick;

#[derive(Debug, Clone)]
pub struct Db(pub SqlitePool);

impl Deref for Db {
  type Target = SqlitePool;

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Db {
  pub async fn connect(database_url: impl AsRef<str>) -> Result<Self> {
    let options = SqliteConnectOptions::from_str(database_url.as_ref())
      .context("invalid database url")?
      .create_if_missing(true)
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(8)
      .connect_with(options)
      .await
      .context("could not connect to the database")?;
    Ok(Db(pool))
  }

  /// A private in-memory database, migrated and ready to use.
  ///
  /// Every SQLite connection to `:memory:` is its own database, so the pool
  /// holds exactly one connection that is never recycled.
  pub async fn in_memory() -> Result<Self> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
      .context("invalid database url")?
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .min_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await
      .context("could not open in-memory database")?;
    let db = Db(pool);
    db.migrate().await?;
    Ok(db)
  }

  pub async fn migrate(&self) -> Result<()> {
    sqlx::migrate!("./migrations")
      .run(&self.0)
      .await
      .context("could not run migrations")
  }
}
