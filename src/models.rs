use chrono::{DateTime, Utc};

use crate::provisioner::Endpoint;

macro_rules! string_enum {
  ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident => $s:literal),* $(,)? }) => {
    $(#[$meta])*
    #[derive(
      Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
    )]
    #[serde(rename_all = "snake_case")]
    #[sqlx(rename_all = "snake_case")]
    pub enum $name {
      $($variant),*
    }

    impl $name {
      pub fn as_str(&self) -> &'static str {
        match self {
          $($name::$variant => $s),*
        }
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
      }
    }

    impl std::str::FromStr for $name {
      type Err = crate::Error;

      fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
          $($s => Ok($name::$variant),)*
          other => Err(crate::Error::Validation(format!(
            "unknown {} `{}`",
            stringify!($name),
            other
          ))),
        }
      }
    }
  };
}

string_enum! {
  /// Lifecycle of a game. Only `Running` advances ticks.
  pub enum GameStatus {
    Draft => "draft",
    Deploying => "deploying",
    Running => "running",
    Paused => "paused",
    Finished => "finished",
  }
}

string_enum! {
  pub enum TickStatus {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    Error => "error",
  }
}

string_enum! {
  /// Terminal classification of a flag submission.
  pub enum SubmissionStatus {
    Accepted => "accepted",
    Rejected => "rejected",
    Invalid => "invalid",
    Duplicate => "duplicate",
    OwnFlag => "own_flag",
    Expired => "expired",
  }
}

string_enum! {
  /// Result of an SLA probe.
  pub enum CheckStatus {
    Up => "up",
    Down => "down",
    Error => "error",
  }
}

/// A team from the read-only roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Team {
  pub id: i64,
  pub name: String,
  pub registered_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Game {
  pub id: i64,
  pub name: String,
  pub status: GameStatus,
  pub current_tick: i64,
  pub max_ticks: Option<i64>,
  /// Seconds between tick boundaries.
  pub tick_duration: i64,
  pub vulnbox_ref: Option<String>,
  pub checker_ref: Option<String>,
  #[serde(skip_serializing)]
  pub secret: String,
  pub created_at: DateTime<Utc>,
}

impl Game {
  pub fn max_ticks_reached(&self) -> bool {
    matches!(self.max_ticks, Some(max) if self.current_tick >= max)
  }
}

/// Binds a team to a game and records where its environment lives.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct GameTeam {
  pub game_id: i64,
  pub team_id: i64,
  pub env_name: String,
  pub address: Option<String>,
  pub port: Option<i64>,
  pub credentials: Option<String>,
  pub is_active: bool,
  pub added_at: DateTime<Utc>,
}

impl GameTeam {
  /// Where the team's service lives, once its environment is up.
  pub fn endpoint(&self) -> Option<Endpoint> {
    let address = self.address.clone()?;
    let port = u16::try_from(self.port?).ok()?;
    Some(Endpoint {
      env_name: self.env_name.clone(),
      address,
      port,
      credentials: self.credentials.clone(),
    })
  }
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Tick {
  pub id: i64,
  pub game_id: i64,
  pub tick_number: i64,
  pub status: TickStatus,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
  /// Highest submission id folded into this tick's score.
  pub scored_through: Option<i64>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Flag {
  pub id: i64,
  pub game_id: i64,
  pub tick_id: i64,
  pub tick_number: i64,
  pub team_id: i64,
  pub flag_value: String,
  pub is_stolen: bool,
  pub stolen_by: Option<i64>,
  pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Submission {
  pub id: i64,
  pub game_id: i64,
  pub team_id: i64,
  pub submitted_flag: String,
  pub flag_id: Option<i64>,
  pub tick_number: i64,
  pub status: SubmissionStatus,
  pub points: i64,
  pub submitted_at: DateTime<Utc>,
}

/// One SLA result per (tick, team).
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct ServiceStatus {
  pub id: i64,
  pub game_id: i64,
  pub tick_id: i64,
  pub tick_number: i64,
  pub team_id: i64,
  pub status: CheckStatus,
  pub message: String,
  pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreboardEntry {
  pub team_id: i64,
  pub team_name: String,
  pub attack_points: i64,
  /// Non-positive: the loss from flags stolen from this team.
  pub defense_points: i64,
  pub sla_points: i64,
  pub total_points: i64,
  pub rank: u32,
  pub flags_captured: i64,
  pub flags_lost: i64,
}

/// A game's ranked scoreboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Scoreboard {
  pub game_id: i64,
  pub game_name: String,
  pub status: GameStatus,
  pub current_tick: i64,
  pub entries: Vec<ScoreboardEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlagStats {
  pub total: i64,
  pub stolen: i64,
  pub by_team: Vec<TeamFlagStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TeamFlagStats {
  pub team_id: i64,
  pub owned: i64,
  pub lost: i64,
  pub captured: i64,
}
