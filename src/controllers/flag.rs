//! Flag submission validation.

use log::{debug, info};
use sqlx::SqliteConnection;

use crate::config::ScoringConfig;
use crate::dal::{self, submission::NewSubmission, Db};
use crate::models::{Flag, GameStatus, Submission, SubmissionStatus};
use crate::{Error, Result};

const MAX_FLAG_LEN: usize = 256;

#[derive(Clone, Debug, Serialize)]
pub struct SubmitOutcome {
  pub status: SubmissionStatus,
  pub points: i64,
  pub message: String,
  pub submission: Submission,
}

/// Classify a submitted flag and append the resulting submission.
///
/// Every well-formed submission against a running game ends in exactly one
/// terminal status; only requests that never enter the pipeline (bad
/// input, unknown game or team, game not running) return an error.
pub async fn submit(
  db: &Db,
  policy: &ScoringConfig,
  game_id: i64,
  team_id: i64,
  raw_flag: &str,
) -> Result<SubmitOutcome> {
  let value = raw_flag.trim();
  if value.is_empty() {
    return Err(Error::Validation("flag must not be empty".to_owned()));
  }
  if value.len() > MAX_FLAG_LEN {
    return Err(Error::Validation(format!(
      "flag is longer than {} characters",
      MAX_FLAG_LEN
    )));
  }

  let game = dal::game::get(db, game_id)
    .await?
    .ok_or_else(|| Error::not_found("game", game_id))?;
  if game.status != GameStatus::Running {
    return Err(Error::Conflict(format!(
      "game {} is {}, submissions are closed",
      game_id, game.status
    )));
  }
  if dal::game_team::get(db, game_id, team_id).await?.is_none() {
    return Err(Error::NotFound(format!(
      "team {} in game {}",
      team_id, game_id
    )));
  }

  let flag = dal::flag::find_by_flag(db, game_id, value).await?;
  let verdict = classify(policy, game.current_tick, team_id, flag);

  let record = |status, flag_id, points| NewSubmission {
    game_id,
    team_id,
    submitted_flag: value,
    flag_id,
    tick_number: game.current_tick,
    status,
    points,
  };

  let (submission, message) = match verdict {
    Verdict::Final(status, flag_id, message) => {
      let mut conn = db.acquire().await.map_err(Error::from)?;
      let submission =
        dal::submission::insert(&mut conn, record(status, flag_id, 0)).await?;
      (submission, message)
    }
    Verdict::Claimable(flag) => {
      let mut tx = db.begin().await.map_err(Error::from)?;
      // the claim runs first so the transaction holds the write lock
      // before anything else happens
      let (status, points, message) =
        match claim(&mut tx, &flag, team_id).await {
          Ok(()) => (
            SubmissionStatus::Accepted,
            policy.attack_points,
            format!(
              "captured team {}'s flag from tick {}",
              flag.team_id, flag.tick_number
            ),
          ),
          Err(err @ Error::ConcurrencyConflict(_)) => {
            debug!("{} game_id={} team_id={}", err, game_id, team_id);
            let current = dal::flag::get(&mut tx, flag.id).await?;
            lost_claim(team_id, current.as_ref().and_then(|f| f.stolen_by))
          }
          Err(err) => return Err(err),
        };
      let submission =
        dal::submission::insert(&mut tx, record(status, Some(flag.id), points))
          .await?;
      tx.commit().await.map_err(Error::from)?;
      (submission, message)
    }
  };

  if submission.status == SubmissionStatus::Accepted {
    info!(
      "flag accepted game_id={} team_id={} flag_id={:?} points={}",
      game_id, team_id, submission.flag_id, submission.points
    );
  } else {
    debug!(
      "flag {} game_id={} team_id={}",
      submission.status, game_id, team_id
    );
  }

  Ok(SubmitOutcome {
    status: submission.status,
    points: submission.points,
    message,
    submission,
  })
}

/// Take a flag for `team_id`. Losing to an earlier claim is a
/// `ConcurrencyConflict`.
async fn claim(
  conn: &mut SqliteConnection,
  flag: &Flag,
  team_id: i64,
) -> Result<()> {
  if dal::flag::claim(conn, flag.id, team_id).await? {
    Ok(())
  } else {
    Err(Error::ConcurrencyConflict(format!(
      "flag {} was claimed by an earlier submission",
      flag.id
    )))
  }
}

enum Verdict {
  Final(SubmissionStatus, Option<i64>, String),
  Claimable(Flag),
}

/// Checks that don't need the claim, in priority order.
fn classify(
  policy: &ScoringConfig,
  current_tick: i64,
  team_id: i64,
  flag: Option<Flag>,
) -> Verdict {
  let flag = match flag {
    Some(flag) => flag,
    None => {
      return Verdict::Final(
        SubmissionStatus::Invalid,
        None,
        "no such flag in this game".to_owned(),
      )
    }
  };

  if flag.team_id == team_id {
    return Verdict::Final(
      SubmissionStatus::OwnFlag,
      Some(flag.id),
      "you can't submit your own flag".to_owned(),
    );
  }

  if current_tick - flag.tick_number >= policy.flag_retention {
    return Verdict::Final(
      SubmissionStatus::Expired,
      Some(flag.id),
      format!(
        "flag from tick {} expired (retention {} ticks)",
        flag.tick_number, policy.flag_retention
      ),
    );
  }

  match flag.stolen_by {
    None => Verdict::Claimable(flag),
    stolen_by => {
      let (status, _, message) = lost_claim(team_id, stolen_by);
      Verdict::Final(status, Some(flag.id), message)
    }
  }
}

fn lost_claim(
  team_id: i64,
  stolen_by: Option<i64>,
) -> (SubmissionStatus, i64, String) {
  if stolen_by == Some(team_id) {
    (
      SubmissionStatus::Duplicate,
      0,
      "you already captured this flag".to_owned(),
    )
  } else {
    (
      SubmissionStatus::Rejected,
      0,
      "flag was already captured by another team".to_owned(),
    )
  }
}
