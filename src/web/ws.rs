//! Live game feed over WebSocket.
//!
//! The server pushes every broadcast event as a JSON text frame, plus a
//! `tick_timer` on a fixed interval. Clients may send `ping` (answered with
//! `pong`) or `refresh` (answered with the current scoreboard); any frame
//! counts as a heartbeat.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::time::MissedTickBehavior;

use crate::broadcast::{Event, Subscription};
use crate::GameServer;

use super::utils::ApiError;

type Sender = SplitSink<WebSocket, Message>;

pub async fn upgrade(
  ws: WebSocketUpgrade,
  State(gameserver): State<GameServer>,
  Path(game_id): Path<i64>,
) -> Result<Response, ApiError> {
  // unknown games are refused before the upgrade
  let subscription = gameserver.subscribe(game_id).await?;
  Ok(ws.on_upgrade(move |socket| serve(gameserver, subscription, socket)))
}

async fn serve(
  gameserver: GameServer,
  mut subscription: Subscription,
  socket: WebSocket,
) {
  let game_id = subscription.game_id;
  let (mut sender, mut receiver) = socket.split();
  let period = Duration::from(gameserver.broadcaster().config().timer_interval)
    .max(Duration::from_secs(1));
  let mut timer = tokio::time::interval(period);
  timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
  debug!(
    "ws connected game_id={} subscriber={}",
    game_id, subscription.id
  );

  loop {
    let sent = tokio::select! {
      event = subscription.recv() => match event {
        Some(event) => send(&mut sender, &event).await,
        // pruned or the game went away
        None => break,
      },
      _ = timer.tick() => match gameserver.broadcaster().timer(game_id) {
        Some(event) => send(&mut sender, &event).await,
        None => true,
      },
      frame = receiver.next() => match frame {
        Some(Ok(Message::Close(_))) | None => break,
        Some(Ok(message)) => {
          subscription.touch();
          answer(&gameserver, game_id, &mut sender, message).await
        }
        Some(Err(err)) => {
          debug!("ws read failed game_id={}: {}", game_id, err);
          break;
        }
      },
    };
    if !sent {
      break;
    }
  }
  debug!(
    "ws disconnected game_id={} subscriber={}",
    game_id, subscription.id
  );
}

async fn answer(
  gameserver: &GameServer,
  game_id: i64,
  sender: &mut Sender,
  message: Message,
) -> bool {
  let text = match &message {
    Message::Text(text) => text.trim(),
    _ => return true,
  };
  match text {
    "ping" => sender.send(Message::Text("pong".to_owned())).await.is_ok(),
    "refresh" => match gameserver.scoreboard_event(game_id).await {
      Ok(event) => send(sender, &event).await,
      Err(err) => {
        let event = Event::Error {
          game_id,
          kind: err.kind().to_owned(),
          message: err.to_string(),
        };
        send(sender, &event).await
      }
    },
    _ => true,
  }
}

/// Returns false once the client is gone.
async fn send(sender: &mut Sender, event: &Event) -> bool {
  let text = match serde_json::to_string(event) {
    Ok(text) => text,
    Err(err) => {
      error!("could not encode event: {}", err);
      return true;
    }
  };
  sender.send(Message::Text(text)).await.is_ok()
}
