use std::path::PathBuf;

use adgameserver::dal::Db;
use adgameserver::{Config, GameServer};
use anyhow::{Context, Result};
use structopt::StructOpt;

#[derive(StructOpt)]
struct Opt {
  #[structopt(subcommand)]
  cmd: Command,

  #[structopt(long = "config")]
  config: PathBuf,
}

#[derive(StructOpt)]
enum Command {
  /// Serve the API and run every game on the clock.
  #[structopt(name = "run")]
  Run,

  /// Apply pending schema migrations and exit.
  #[structopt(name = "migrate")]
  Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  )
  .init();
  let opt = Opt::from_args();

  // read the config file
  let config = Config::from_file(&opt.config)?;

  match opt.cmd {
    Command::Run => {
      let bind_addr = config.bind_addr;
      let gameserver = GameServer::new(config)
        .await
        .context("couldn't load gameserver")?;

      let resumed = gameserver.resume().await?;
      if resumed > 0 {
        log::info!("resumed {} games", resumed);
      }
      gameserver.broadcaster().spawn_pruner();

      adgameserver::web::run(gameserver, bind_addr).await
    }
    Command::Migrate => {
      let db = Db::connect(&config.database_url)
        .await
        .context("couldn't connect to the db")?;
      db.migrate().await.context("failed to migrate")?;
      log::info!("migrations applied");
      Ok(())
    }
  }
}
