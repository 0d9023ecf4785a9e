mod games;
mod scoreboard;
mod submit_flag;
mod utils;
mod ws;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

use crate::GameServer;

pub use self::utils::ApiError;

/// All HTTP and WebSocket routes of the game server.
pub fn router(gameserver: GameServer) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/games", get(games::list).post(games::create))
    .route(
      "/games/:game_id",
      get(games::get).patch(games::update).delete(games::delete),
    )
    .route("/games/:game_id/start", post(games::start))
    .route("/games/:game_id/pause", post(games::pause))
    .route("/games/:game_id/stop", post(games::stop))
    .route("/games/:game_id/force-stop", post(games::force_stop))
    .route("/games/:game_id/assign-vulnbox", post(games::assign_vulnbox))
    .route("/games/:game_id/assign-checker", post(games::assign_checker))
    .route(
      "/games/:game_id/teams",
      get(games::list_teams).post(games::add_team),
    )
    .route(
      "/games/:game_id/teams/:team_id",
      get(games::get_team).delete(games::remove_team),
    )
    .route("/ticks", get(games::list_ticks))
    .route("/ticks/current", get(games::current_tick))
    .route("/ticks/:tick_id", get(games::get_tick))
    .route("/flags", get(games::list_flags))
    .route("/flags/stats", get(games::flag_stats))
    .route(
      "/submissions",
      get(submit_flag::list).post(submit_flag::submit_flag),
    )
    .route("/submissions/:submission_id", get(submit_flag::get))
    .route("/scoreboard", get(scoreboard::scoreboards))
    .route("/scoreboard/:game_id", get(scoreboard::scoreboard))
    .route(
      "/scoreboard/:game_id/team/:team_id",
      get(scoreboard::team_score),
    )
    .route("/checker/statuses", get(scoreboard::check_up))
    .route("/ws/game/:game_id", get(ws::upgrade))
    .with_state(gameserver)
}

pub async fn run(gameserver: GameServer, bind_addr: SocketAddr) -> Result<()> {
  let listener = TcpListener::bind(bind_addr)
    .await
    .with_context(|| format!("couldn't bind {}", bind_addr))?;
  info!("listening on {}", bind_addr);
  axum::serve(listener, router(gameserver))
    .await
    .context("http server failed")
}

async fn health() -> Json<serde_json::Value> {
  Json(json!({
    "status": "healthy",
    "version": env!("CARGO_PKG_VERSION"),
  }))
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use axum::body::Body;
  use axum::http::{Request, StatusCode};
  use tower::ServiceExt;

  use super::*;
  use crate::checker::ScriptChecker;
  use crate::dal::Db;
  use crate::provisioner::DockerProvisioner;
  use crate::{Config, TeamConfig};

  async fn gameserver() -> GameServer {
    let config = Config {
      teams: vec![TeamConfig {
        id: 1,
        name: "alpha".to_owned(),
      }],
      ..Config::default()
    };
    let db = Db::in_memory().await.unwrap();
    let provisioner = Arc::new(DockerProvisioner::new(config.docker.clone()));
    let checker = Arc::new(ScriptChecker::new(None));
    GameServer::with_parts(config, db, provisioner, checker)
      .await
      .unwrap()
  }

  async fn send(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
  ) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
      Some(body) => {
        request = request.header("content-type", "application/json");
        Body::from(body.to_string())
      }
      None => Body::empty(),
    };
    let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
      .await
      .unwrap();
    let json = if bytes.is_empty() {
      serde_json::Value::Null
    } else {
      serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
  }

  #[tokio::test]
  async fn health_check() {
    let app = router(gameserver().await);
    let (status, body) = send(app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
  }

  #[tokio::test]
  async fn game_crud_over_http() {
    let gameserver = gameserver().await;
    let app = router(gameserver.clone());

    let (status, game) = send(
      app.clone(),
      "POST",
      "/games",
      Some(json!({ "name": "quals", "tick_duration": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(game["status"], "draft");
    assert!(game.get("secret").is_none());
    let id = game["id"].as_i64().unwrap();

    let (status, game) = send(
      app.clone(),
      "POST",
      &format!("/games/{}/assign-vulnbox?vulnboxId=web:1", id),
      None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(game["vulnbox_ref"], "web:1");

    let (status, team) = send(
      app.clone(),
      "POST",
      &format!("/games/{}/teams", id),
      Some(json!({ "team_id": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(team["env_name"], format!("ad-g{}-t1", id));

    let (status, list) = send(app.clone(), "GET", "/games", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    let (status, _) =
      send(app.clone(), "DELETE", &format!("/games/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) =
      send(app, "GET", &format!("/games/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found_error");
  }

  #[tokio::test]
  async fn errors_carry_their_kind() {
    let app = router(gameserver().await);

    let (status, body) = send(
      app.clone(),
      "POST",
      "/games",
      Some(json!({ "name": "", "tick_duration": 60 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    let (status, body) = send(
      app.clone(),
      "POST",
      "/games",
      Some(json!({ "tick_duration": "soon" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    let (_, game) = send(
      app.clone(),
      "POST",
      "/games",
      Some(json!({ "name": "quals", "tick_duration": 60 })),
    )
    .await;
    let (status, body) = send(
      app.clone(),
      "POST",
      &format!("/games/{}/pause", game["id"]),
      None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict_error");

    let (status, body) = send(
      app,
      "POST",
      "/submissions",
      Some(json!({ "game_id": game["id"], "team_id": 1, "flag": "FLAG{x}" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict_error");
  }
}
