//! Per-game live updates.
//!
//! Every game has a cached snapshot (status, tick timer, scoreboard) and a
//! set of subscribers, each fed through its own bounded channel. A new
//! subscriber gets the full snapshot before any incremental event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::BroadcastConfig;
use crate::models::{Game, GameStatus, ScoreboardEntry};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TickTimer {
  pub game_id: i64,
  pub current_tick: i64,
  pub tick_duration_seconds: i64,
  pub seconds_elapsed: i64,
  pub seconds_remaining: i64,
  pub progress_percent: i64,
  pub tick_started_at: Option<DateTime<Utc>>,
  pub game_status: GameStatus,
  pub server_time: DateTime<Utc>,
}

/// Messages sent to subscribers, tagged by `type` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
  Initial {
    game_name: String,
    max_ticks: Option<i64>,
    #[serde(flatten)]
    timer: TickTimer,
  },
  TickTimer(TickTimer),
  TickChange {
    game_id: i64,
    new_tick: i64,
    tick_duration_seconds: i64,
    tick_started_at: Option<DateTime<Utc>>,
  },
  Scoreboard {
    game_id: i64,
    entries: Vec<ScoreboardEntry>,
  },
  ScoreboardUpdate {
    game_id: i64,
    tick: i64,
  },
  GameState {
    game_id: i64,
    status: GameStatus,
    current_tick: i64,
  },
  Error {
    game_id: i64,
    kind: String,
    message: String,
  },
}

/// Latest known state of a game, as shown to new subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
  pub game_id: i64,
  pub game_name: String,
  pub status: GameStatus,
  pub current_tick: i64,
  pub max_ticks: Option<i64>,
  pub tick_duration: i64,
  /// When the most recent tick boundary fired.
  pub tick_started_at: Option<DateTime<Utc>>,
  pub scoreboard: Vec<ScoreboardEntry>,
}

impl Snapshot {
  pub fn new(game: &Game) -> Self {
    Snapshot {
      game_id: game.id,
      game_name: game.name.clone(),
      status: game.status,
      current_tick: game.current_tick,
      max_ticks: game.max_ticks,
      tick_duration: game.tick_duration,
      tick_started_at: None,
      scoreboard: Vec::new(),
    }
  }

  pub fn timer(&self, now: DateTime<Utc>) -> TickTimer {
    let duration = self.tick_duration.max(1);
    let elapsed = match (self.status, self.tick_started_at) {
      (GameStatus::Running, Some(started)) => {
        (now - started).num_seconds().clamp(0, duration)
      }
      _ => 0,
    };
    let remaining = if self.status == GameStatus::Running {
      duration - elapsed
    } else {
      0
    };
    TickTimer {
      game_id: self.game_id,
      current_tick: self.current_tick,
      tick_duration_seconds: self.tick_duration,
      seconds_elapsed: elapsed,
      seconds_remaining: remaining,
      progress_percent: elapsed * 100 / duration,
      tick_started_at: self.tick_started_at,
      game_status: self.status,
      server_time: now,
    }
  }

  fn initial(&self, now: DateTime<Utc>) -> Event {
    Event::Initial {
      game_name: self.game_name.clone(),
      max_ticks: self.max_ticks,
      timer: self.timer(now),
    }
  }
}

struct Subscriber {
  id: u64,
  tx: mpsc::Sender<Event>,
  last_seen: Instant,
}

#[derive(Default)]
struct Channel {
  snapshot: Option<Snapshot>,
  subscribers: Vec<Subscriber>,
}

struct Inner {
  config: BroadcastConfig,
  next_id: AtomicU64,
  channels: Mutex<HashMap<i64, Channel>>,
}

/// Fans game events out to subscribers. Cloning shares the same state.
#[derive(Clone)]
pub struct Broadcaster(Arc<Inner>);

impl Broadcaster {
  pub fn new(config: BroadcastConfig) -> Self {
    Broadcaster(Arc::new(Inner {
      config,
      next_id: AtomicU64::new(1),
      channels: Mutex::new(HashMap::new()),
    }))
  }

  fn channels(&self) -> MutexGuard<'_, HashMap<i64, Channel>> {
    self.0.channels.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn config(&self) -> &BroadcastConfig {
    &self.0.config
  }

  pub fn snapshot(&self, game_id: i64) -> Option<Snapshot> {
    self
      .channels()
      .get(&game_id)
      .and_then(|channel| channel.snapshot.clone())
  }

  pub fn scoreboard(&self, game_id: i64) -> Option<Vec<ScoreboardEntry>> {
    self.snapshot(game_id).map(|snapshot| snapshot.scoreboard)
  }

  /// Install a snapshot without notifying anyone, e.g. when loading a game
  /// from the database.
  pub fn seed(&self, snapshot: Snapshot) {
    let game_id = snapshot.game_id;
    self.channels().entry(game_id).or_default().snapshot = Some(snapshot);
  }

  /// Register a subscriber. The returned subscription already holds the
  /// initial snapshot and scoreboard if the game is known.
  pub fn subscribe(&self, game_id: i64) -> Subscription {
    let capacity = self.0.config.channel_capacity.max(2);
    let (tx, rx) = mpsc::channel(capacity);
    let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);

    let mut channels = self.channels();
    let channel = channels.entry(game_id).or_default();
    if let Some(snapshot) = &channel.snapshot {
      // the channel is fresh and has room for both
      let _ = tx.try_send(snapshot.initial(Utc::now()));
      let _ = tx.try_send(Event::Scoreboard {
        game_id,
        entries: snapshot.scoreboard.clone(),
      });
    }
    channel.subscribers.push(Subscriber {
      id,
      tx,
      last_seen: Instant::now(),
    });
    debug!("subscribed game_id={} subscriber={}", game_id, id);

    Subscription {
      id,
      game_id,
      events: rx,
      broadcaster: self.clone(),
    }
  }

  fn unsubscribe(&self, game_id: i64, id: u64) {
    if let Some(channel) = self.channels().get_mut(&game_id) {
      channel.subscribers.retain(|subscriber| subscriber.id != id);
    }
  }

  fn touch(&self, game_id: i64, id: u64) {
    if let Some(channel) = self.channels().get_mut(&game_id) {
      if let Some(subscriber) =
        channel.subscribers.iter_mut().find(|s| s.id == id)
      {
        subscriber.last_seen = Instant::now();
      }
    }
  }

  pub fn subscriber_count(&self, game_id: i64) -> usize {
    self
      .channels()
      .get(&game_id)
      .map_or(0, |channel| channel.subscribers.len())
  }

  /// Send an event to every subscriber of a game.
  ///
  /// A subscriber whose queue is full is dropped rather than waited on;
  /// it gets a fresh snapshot when it reconnects.
  pub fn publish(&self, game_id: i64, event: Event) {
    let mut channels = self.channels();
    let channel = match channels.get_mut(&game_id) {
      Some(channel) => channel,
      None => return,
    };
    channel.subscribers.retain(|subscriber| {
      match subscriber.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
          warn!(
            "dropping slow subscriber game_id={} subscriber={}",
            game_id, subscriber.id
          );
          false
        }
        Err(TrySendError::Closed(_)) => false,
      }
    });
  }

  /// Record a status or tick change and tell subscribers.
  pub fn game_state(&self, game: &Game) {
    self.update(game);
    self.publish(
      game.id,
      Event::GameState {
        game_id: game.id,
        status: game.status,
        current_tick: game.current_tick,
      },
    );
  }

  pub fn tick_change(&self, game: &Game, started_at: DateTime<Utc>) {
    {
      let mut channels = self.channels();
      let channel = channels.entry(game.id).or_default();
      let snapshot = channel.snapshot.get_or_insert_with(|| Snapshot::new(game));
      refresh(snapshot, game);
      snapshot.tick_started_at = Some(started_at);
    }
    self.publish(
      game.id,
      Event::TickChange {
        game_id: game.id,
        new_tick: game.current_tick,
        tick_duration_seconds: game.tick_duration,
        tick_started_at: Some(started_at),
      },
    );
  }

  /// Replace the cached scoreboard of a game and announce it.
  pub fn scoreboard_update(
    &self,
    game_id: i64,
    tick: i64,
    entries: Vec<ScoreboardEntry>,
  ) {
    self.set_scoreboard(game_id, entries.clone());
    self.publish(game_id, Event::Scoreboard { game_id, entries });
    self.publish(game_id, Event::ScoreboardUpdate { game_id, tick });
  }

  pub fn set_scoreboard(&self, game_id: i64, entries: Vec<ScoreboardEntry>) {
    if let Some(snapshot) = self
      .channels()
      .get_mut(&game_id)
      .and_then(|channel| channel.snapshot.as_mut())
    {
      snapshot.scoreboard = entries;
    }
  }

  pub fn error(&self, game_id: i64, err: &crate::Error) {
    self.publish(
      game_id,
      Event::Error {
        game_id,
        kind: err.kind().to_owned(),
        message: err.to_string(),
      },
    );
  }

  /// The current tick timer of a game, if it is known.
  pub fn timer(&self, game_id: i64) -> Option<Event> {
    self
      .snapshot(game_id)
      .map(|snapshot| Event::TickTimer(snapshot.timer(Utc::now())))
  }

  fn update(&self, game: &Game) {
    let mut channels = self.channels();
    let channel = channels.entry(game.id).or_default();
    match &mut channel.snapshot {
      Some(snapshot) => refresh(snapshot, game),
      None => channel.snapshot = Some(Snapshot::new(game)),
    }
  }

  /// Forget a deleted game, disconnecting its subscribers.
  pub fn remove_game(&self, game_id: i64) {
    self.channels().remove(&game_id);
  }

  /// Drop subscribers that went away or stayed silent for too many
  /// heartbeats. Returns how many were dropped.
  pub fn prune(&self) -> usize {
    self.prune_at(Instant::now())
  }

  fn prune_at(&self, now: Instant) -> usize {
    let config = &self.0.config;
    let limit =
      Duration::from(config.heartbeat_interval) * config.max_missed_heartbeats;
    let mut pruned = 0;
    for (game_id, channel) in self.channels().iter_mut() {
      let before = channel.subscribers.len();
      channel.subscribers.retain(|subscriber| {
        let silent = now.saturating_duration_since(subscriber.last_seen);
        let keep = !subscriber.tx.is_closed() && silent <= limit;
        if !keep {
          debug!(
            "pruned subscriber game_id={} subscriber={}",
            game_id, subscriber.id
          );
        }
        keep
      });
      pruned += before - channel.subscribers.len();
    }
    pruned
  }

  /// Prune once per heartbeat interval, forever.
  pub fn spawn_pruner(&self) -> JoinHandle<()> {
    let broadcaster = self.clone();
    let period = Duration::from(self.0.config.heartbeat_interval)
      .max(Duration::from_secs(1));
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      loop {
        interval.tick().await;
        let pruned = broadcaster.prune();
        if pruned > 0 {
          info!("pruned {} silent subscribers", pruned);
        }
      }
    })
  }
}

fn refresh(snapshot: &mut Snapshot, game: &Game) {
  snapshot.game_name = game.name.clone();
  snapshot.status = game.status;
  snapshot.current_tick = game.current_tick;
  snapshot.max_ticks = game.max_ticks;
  snapshot.tick_duration = game.tick_duration;
}

/// A live feed of one game's events. Unsubscribes on drop.
pub struct Subscription {
  pub id: u64,
  pub game_id: i64,
  events: mpsc::Receiver<Event>,
  broadcaster: Broadcaster,
}

impl Subscription {
  /// Next event, or `None` once the subscriber was pruned.
  pub async fn recv(&mut self) -> Option<Event> {
    self.events.recv().await
  }

  pub fn try_recv(&mut self) -> Option<Event> {
    self.events.try_recv().ok()
  }

  /// Count client activity as a heartbeat.
  pub fn touch(&self) {
    self.broadcaster.touch(self.game_id, self.id);
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.broadcaster.unsubscribe(self.game_id, self.id);
  }
}
