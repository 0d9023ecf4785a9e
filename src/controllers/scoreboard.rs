//! Scoring engine.
//!
//! The scoreboard is a pure projection of ticks, accepted submissions,
//! flags and SLA results; it is never stored. Each scored tick owns the
//! accepted submissions with `prev_watermark < id <= watermark`.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;

use crate::config::ScoringConfig;
use crate::dal::{self, Db};
use crate::models::{
  Flag, ScoreboardEntry, ServiceStatus, Submission, SubmissionStatus, Team,
  Tick,
};

/// Point changes for one team caused by a single tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScoreDelta {
  pub attack_points: i64,
  pub defense_points: i64,
  pub sla_points: i64,
  pub flags_captured: i64,
  pub flags_lost: i64,
}

impl ScoreDelta {
  fn apply(&self, entry: &mut ScoreboardEntry) {
    entry.attack_points += self.attack_points;
    entry.defense_points += self.defense_points;
    entry.sla_points += self.sla_points;
    entry.flags_captured += self.flags_captured;
    entry.flags_lost += self.flags_lost;
    entry.total_points =
      entry.attack_points + entry.defense_points + entry.sla_points;
  }
}

/// Everything the projection is computed from.
pub struct ScoringInput<'a> {
  /// Teams of the game, in registration order.
  pub teams: &'a [Team],
  pub ticks: &'a [Tick],
  pub submissions: &'a [Submission],
  pub flags: &'a HashMap<i64, Flag>,
  pub statuses: &'a [ServiceStatus],
}

/// Deltas of one tick whose window is `(lower, tick.scored_through]`.
pub fn tick_deltas(
  policy: &ScoringConfig,
  tick: &Tick,
  lower: i64,
  input: &ScoringInput<'_>,
) -> BTreeMap<i64, ScoreDelta> {
  let mut deltas: BTreeMap<i64, ScoreDelta> = BTreeMap::new();
  let upper = match tick.scored_through {
    Some(upper) => upper,
    None => return deltas,
  };

  for submission in input.submissions {
    if submission.status != SubmissionStatus::Accepted
      || submission.id <= lower
      || submission.id > upper
    {
      continue;
    }

    let attacker = deltas.entry(submission.team_id).or_default();
    attacker.attack_points += submission.points;
    attacker.flags_captured += 1;

    let owner = submission
      .flag_id
      .and_then(|flag_id| input.flags.get(&flag_id));
    if let Some(flag) = owner {
      let victim = deltas.entry(flag.team_id).or_default();
      victim.defense_points -= policy.defense_penalty;
      victim.flags_lost += 1;
    }
  }

  for status in input.statuses.iter().filter(|s| s.tick_id == tick.id) {
    deltas.entry(status.team_id).or_default().sla_points +=
      policy.sla_points(status.status);
  }

  deltas
}

/// Fold every scored tick into a ranked scoreboard.
pub fn compute(
  policy: &ScoringConfig,
  input: &ScoringInput<'_>,
) -> Vec<ScoreboardEntry> {
  let mut entries: Vec<ScoreboardEntry> = input
    .teams
    .iter()
    .map(|team| ScoreboardEntry {
      team_id: team.id,
      team_name: team.name.clone(),
      ..Default::default()
    })
    .collect();
  let index: HashMap<i64, usize> = entries
    .iter()
    .enumerate()
    .map(|(i, entry)| (entry.team_id, i))
    .collect();

  let mut ticks: Vec<&Tick> = input
    .ticks
    .iter()
    .filter(|tick| tick.scored_through.is_some())
    .collect();
  ticks.sort_by_key(|tick| tick.tick_number);

  let mut lower = 0;
  for tick in ticks {
    for (team_id, delta) in tick_deltas(policy, tick, lower, input) {
      // teams removed from the game keep no entry
      if let Some(&i) = index.get(&team_id) {
        delta.apply(&mut entries[i]);
      }
    }
    lower = lower.max(tick.scored_through.unwrap_or(lower));
  }

  rank(&mut entries);
  entries
}

/// Order by total points, then fewer flags lost, then registration order
/// (the incoming order), and number the ranks from 1.
pub fn rank(entries: &mut [ScoreboardEntry]) {
  let registration: HashMap<i64, usize> = entries
    .iter()
    .enumerate()
    .map(|(i, entry)| (entry.team_id, i))
    .collect();
  entries.sort_by(|a, b| {
    b.total_points
      .cmp(&a.total_points)
      .then(a.flags_lost.cmp(&b.flags_lost))
      .then_with(|| {
        registration
          .get(&a.team_id)
          .cmp(&registration.get(&b.team_id))
      })
  });
  for (i, entry) in entries.iter_mut().enumerate() {
    entry.rank = i as u32 + 1;
  }
}

/// Rebuild a game's scoreboard from persisted records alone.
pub async fn from_db(
  db: &Db,
  game_id: i64,
  policy: &ScoringConfig,
) -> Result<Vec<ScoreboardEntry>> {
  let members: HashSet<i64> = dal::game_team::list(db, game_id)
    .await?
    .into_iter()
    .map(|game_team| game_team.team_id)
    .collect();
  let teams: Vec<Team> = dal::team::get_all(db)
    .await?
    .into_iter()
    .filter(|team| members.contains(&team.id))
    .collect();

  let ticks = dal::tick::list_scored(db, game_id).await?;
  let through = ticks
    .iter()
    .filter_map(|tick| tick.scored_through)
    .max()
    .unwrap_or(0);
  let submissions =
    dal::submission::accepted_through(db, game_id, through).await?;
  let flags = dal::flag::list(db, game_id, None, None)
    .await?
    .into_iter()
    .map(|flag| (flag.id, flag))
    .collect();
  let statuses = dal::service_status::for_game(db, game_id).await?;

  Ok(compute(
    policy,
    &ScoringInput {
      teams: &teams,
      ticks: &ticks,
      submissions: &submissions,
      flags: &flags,
      statuses: &statuses,
    },
  ))
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::models::{CheckStatus, TickStatus};

  fn team(id: i64, registered: i64) -> Team {
    Team {
      id,
      name: format!("team{}", id),
      registered_at: Utc.timestamp_opt(registered, 0).unwrap(),
    }
  }

  fn tick(id: i64, number: i64, watermark: Option<i64>) -> Tick {
    Tick {
      id,
      game_id: 1,
      tick_number: number,
      status: TickStatus::Completed,
      started_at: None,
      ended_at: None,
      scored_through: watermark,
    }
  }

  fn flag(id: i64, owner: i64, tick_number: i64) -> Flag {
    Flag {
      id,
      game_id: 1,
      tick_id: tick_number,
      tick_number,
      team_id: owner,
      flag_value: format!("FLAG{{{}}}", id),
      is_stolen: true,
      stolen_by: None,
      created_at: Utc::now(),
    }
  }

  fn accepted(id: i64, attacker: i64, flag_id: i64, points: i64) -> Submission {
    Submission {
      id,
      game_id: 1,
      team_id: attacker,
      submitted_flag: String::new(),
      flag_id: Some(flag_id),
      tick_number: 1,
      status: SubmissionStatus::Accepted,
      points,
      submitted_at: Utc::now(),
    }
  }

  fn status(tick_id: i64, team_id: i64, status: CheckStatus) -> ServiceStatus {
    ServiceStatus {
      id: 0,
      game_id: 1,
      tick_id,
      tick_number: tick_id,
      team_id,
      status,
      message: String::new(),
      checked_at: Utc::now(),
    }
  }

  struct Fixture {
    teams: Vec<Team>,
    ticks: Vec<Tick>,
    submissions: Vec<Submission>,
    flags: HashMap<i64, Flag>,
    statuses: Vec<ServiceStatus>,
  }

  impl Fixture {
    fn input(&self) -> ScoringInput<'_> {
      ScoringInput {
        teams: &self.teams,
        ticks: &self.ticks,
        submissions: &self.submissions,
        flags: &self.flags,
        statuses: &self.statuses,
      }
    }
  }

  fn fixture() -> Fixture {
    Fixture {
      teams: vec![team(1, 100), team(2, 200), team(3, 300)],
      ticks: vec![tick(1, 1, Some(1)), tick(2, 2, Some(3))],
      // submission 1 in tick 1, submissions 2 and 3 in tick 2
      submissions: vec![
        accepted(1, 1, 10, 10),
        accepted(2, 1, 11, 10),
        accepted(3, 2, 12, 10),
      ],
      flags: [flag(10, 2, 1), flag(11, 3, 1), flag(12, 3, 2)]
        .into_iter()
        .map(|f| (f.id, f))
        .collect(),
      statuses: vec![
        status(1, 1, CheckStatus::Up),
        status(1, 2, CheckStatus::Up),
        status(1, 3, CheckStatus::Down),
        status(2, 1, CheckStatus::Up),
        status(2, 2, CheckStatus::Error),
        status(2, 3, CheckStatus::Up),
      ],
    }
  }

  #[test]
  fn tick_windows_split_submissions() {
    let policy = ScoringConfig::default();
    let fixture = fixture();
    let input = fixture.input();

    let first = tick_deltas(&policy, &input.ticks[0], 0, &input);
    assert_eq!(first[&1].attack_points, 10);
    assert_eq!(first[&2].defense_points, -10);
    assert_eq!(first[&3].sla_points, 0);

    let second = tick_deltas(&policy, &input.ticks[1], 1, &input);
    assert_eq!(second[&1].flags_captured, 1);
    assert_eq!(second[&2].attack_points, 10);
    assert_eq!(second[&2].sla_points, -1);
    assert_eq!(second[&3].flags_lost, 2);
  }

  #[test]
  fn cumulative_scoreboard() {
    let policy = ScoringConfig::default();
    let fixture = fixture();
    let board = compute(&policy, &fixture.input());

    let by_team: HashMap<i64, &ScoreboardEntry> =
      board.iter().map(|e| (e.team_id, e)).collect();
    // team 1: 2 captures, up twice
    assert_eq!(by_team[&1].total_points, 20 + 2);
    // team 2: 1 capture, 1 loss, up then error
    assert_eq!(by_team[&2].total_points, 10 - 10 + 1 - 1);
    // team 3: 2 losses, down then up
    assert_eq!(by_team[&3].total_points, -20 + 1);
    assert_eq!(by_team[&3].defense_points, -20);

    let order: Vec<i64> = board.iter().map(|e| e.team_id).collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert_eq!(board[0].rank, 1);
    assert_eq!(board[2].rank, 3);
  }

  #[test]
  fn recompute_is_idempotent() {
    let policy = ScoringConfig::default();
    let fixture = fixture();
    assert_eq!(
      compute(&policy, &fixture.input()),
      compute(&policy, &fixture.input())
    );
  }

  #[test]
  fn unscored_ticks_and_late_submissions_are_ignored() {
    let policy = ScoringConfig::default();
    let mut fixture = fixture();
    fixture.ticks.push(tick(3, 3, None));
    fixture.submissions.push(accepted(4, 3, 10, 10));
    fixture.statuses.push(status(3, 3, CheckStatus::Up));

    let board = compute(&policy, &fixture.input());
    let third = board.iter().find(|e| e.team_id == 3).unwrap();
    assert_eq!(third.attack_points, 0);
    assert_eq!(third.sla_points, 1);
  }

  #[test]
  fn ties_break_on_losses_then_registration() {
    let mut entries = vec![
      ScoreboardEntry {
        team_id: 5,
        total_points: 10,
        flags_lost: 1,
        ..Default::default()
      },
      ScoreboardEntry {
        team_id: 9,
        total_points: 10,
        flags_lost: 0,
        ..Default::default()
      },
      ScoreboardEntry {
        team_id: 2,
        total_points: 10,
        flags_lost: 1,
        ..Default::default()
      },
    ];
    rank(&mut entries);
    let order: Vec<i64> = entries.iter().map(|e| e.team_id).collect();
    // 9 lost fewer; 5 registered before 2
    assert_eq!(order, vec![9, 5, 2]);
    assert_eq!(
      entries.iter().map(|e| e.rank).collect::<Vec<_>>(),
      vec![1, 2, 3]
    );
  }

  #[test]
  fn policy_is_configurable() {
    let policy = ScoringConfig {
      attack_points: 0,
      defense_penalty: 3,
      sla_up: 5,
      sla_down: -2,
      sla_error: -4,
      flag_retention: 5,
    };
    let fixture = fixture();
    let board = compute(&policy, &fixture.input());
    let third = board.iter().find(|e| e.team_id == 3).unwrap();
    assert_eq!(third.defense_points, -6);
    assert_eq!(third.sla_points, -2 + 5);
  }
}
