mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use adgameserver::broadcast::Event;
use adgameserver::controllers::game::GameForm;
use adgameserver::controllers::scoreboard;
use adgameserver::dal;
use adgameserver::models::{
  CheckStatus, GameStatus, SubmissionStatus, TickStatus,
};

use crate::common::{harness, harness_with, wait_for, MockChecker};

#[tokio::test]
async fn first_tick_mints_one_flag_per_team() {
  let h = harness(2).await;
  let game = h.ready_game(None).await;

  let started = h.gameserver.start(game.id).await.unwrap();
  assert_eq!(started.status, GameStatus::Deploying);
  h.wait_for_tick(game.id, 1).await;

  let db = h.gameserver.database();
  let flags = dal::flag::list(db, game.id, None, None).await.unwrap();
  assert_eq!(flags.len(), 2);
  assert!(flags.iter().all(|flag| flag.tick_number == 1));
  assert_ne!(flags[0].flag_value, flags[1].flag_value);
  assert!(flags
    .iter()
    .all(|flag| flag.flag_value.starts_with("FLAG{")));

  let mut injected = h.provisioner.injected();
  injected.sort();
  assert_eq!(injected.len(), 2);
  assert_eq!(injected[0].0, format!("ad-g{}-t1", game.id));

  let statuses = dal::service_status::for_game(db, game.id).await.unwrap();
  assert_eq!(statuses.len(), 2);
  assert!(statuses.iter().all(|s| s.status == CheckStatus::Up));

  let game = h.gameserver.get_game(game.id).await.unwrap();
  assert_eq!(game.status, GameStatus::Running);
  h.gameserver.force_stop(game.id).await.unwrap();
}

#[tokio::test]
async fn pause_lets_the_tick_in_flight_finish() {
  let (checker, gate) = MockChecker::gated();
  let h = harness_with(common::config(2), checker).await;
  let game = h.ready_game(None).await;

  h.gameserver.start(game.id).await.unwrap();
  // phase 2 of tick 1 is now stuck on the checker
  h.checker.entered.notified().await;

  let gameserver = h.gameserver.clone();
  let pause = tokio::spawn(async move { gameserver.pause(game.id).await });
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(!pause.is_finished());

  gate.add_permits(100);
  let paused = pause.await.unwrap().unwrap();
  assert_eq!(paused.status, GameStatus::Paused);
  assert_eq!(paused.current_tick, 1);
  assert!(!h.gameserver.is_on_clock(game.id));

  let db = h.gameserver.database();
  let ticks = dal::tick::list(db, game.id).await.unwrap();
  assert_eq!(ticks.len(), 1);
  assert_eq!(ticks[0].status, TickStatus::Completed);
  assert_eq!(
    dal::service_status::for_game(db, game.id).await.unwrap().len(),
    2
  );
}

#[tokio::test]
async fn resume_continues_from_the_next_tick() {
  let h = harness(2).await;
  let game = h.ready_game(None).await;

  h.gameserver.start(game.id).await.unwrap();
  h.wait_for_tick(game.id, 1).await;
  h.gameserver.pause(game.id).await.unwrap();

  let resumed = h.gameserver.start(game.id).await.unwrap();
  assert_eq!(resumed.status, GameStatus::Running);
  h.wait_for_tick(game.id, 2).await;
  h.gameserver.pause(game.id).await.unwrap();

  let db = h.gameserver.database();
  let numbers: Vec<i64> = dal::tick::list(db, game.id)
    .await
    .unwrap()
    .into_iter()
    .map(|tick| tick.tick_number)
    .collect();
  assert_eq!(numbers, vec![1, 2]);
  // environments are only provisioned once
  assert_eq!(h.provisioner.provisioned.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn force_stop_finishes_even_when_teardown_fails() {
  let h = harness(2).await;
  let game = h.ready_game(None).await;
  h.provisioner.fail_teardown.store(true, Ordering::SeqCst);

  h.gameserver.start(game.id).await.unwrap();
  h.wait_for_tick(game.id, 1).await;

  let report = h.gameserver.force_stop(game.id).await.unwrap();
  assert_eq!(report.new_status, GameStatus::Finished);
  assert_eq!(report.containers_stopped, 0);
  assert_eq!(report.teardown_failures, 2);
  assert!(!h.gameserver.is_on_clock(game.id));

  let teams = h.gameserver.teams(game.id).await.unwrap();
  assert!(teams.iter().all(|team| !team.is_active));

  let err = h.gameserver.force_stop(game.id).await.unwrap_err();
  assert_eq!(err.kind(), "conflict_error");
}

#[tokio::test]
async fn force_stop_abandons_the_tick_in_flight() {
  let (checker, _gate) = MockChecker::gated();
  let h = harness_with(common::config(2), checker).await;
  let game = h.ready_game(None).await;

  h.gameserver.start(game.id).await.unwrap();
  // tick 1 is stuck on the checker and the gate never opens
  h.checker.entered.notified().await;

  let report = h.gameserver.force_stop(game.id).await.unwrap();
  assert_eq!(report.new_status, GameStatus::Finished);
  assert!(!h.gameserver.is_on_clock(game.id));

  let db = h.gameserver.database();
  let ticks = dal::tick::list(db, game.id).await.unwrap();
  assert_eq!(ticks.len(), 1);
  assert_eq!(ticks[0].status, TickStatus::Error);
  assert!(ticks[0].ended_at.is_some());
  let current = dal::tick::current(db, game.id).await.unwrap().unwrap();
  assert_ne!(current.status, TickStatus::Active);

  // the abandoned tick never advanced the game
  let game = h.gameserver.get_game(game.id).await.unwrap();
  assert_eq!(game.current_tick, 0);
  assert_eq!(h.provisioner.torn_down().len(), 2);
}

#[tokio::test]
async fn runner_that_cannot_deploy_leaves_the_clock() {
  let h = harness(1).await;
  let db = h.gameserver.database();
  // left deploying by a previous run, without a vulnbox to deploy
  let game = h
    .gameserver
    .create_game(GameForm {
      name: "broken".to_owned(),
      tick_duration: 60,
      ..GameForm::default()
    })
    .await
    .unwrap();
  assert!(dal::game::transition(
    db,
    game.id,
    &[GameStatus::Draft],
    GameStatus::Deploying
  )
  .await
  .unwrap());

  assert_eq!(h.gameserver.resume().await.unwrap(), 1);
  let gameserver = h.gameserver.clone();
  wait_for("runner to give up", || {
    let gameserver = gameserver.clone();
    async move { !gameserver.is_on_clock(game.id) }
  })
  .await;

  let game = h.gameserver.get_game(game.id).await.unwrap();
  assert_eq!(game.current_tick, 0);
  assert!(dal::tick::list(db, game.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn force_stop_a_draft_game() {
  let h = harness(1).await;
  let game = h.ready_game(None).await;

  let report = h.gameserver.force_stop(game.id).await.unwrap();
  assert_eq!(report.new_status, GameStatus::Finished);
  // nothing was provisioned, but teardown is attempted by name anyway
  assert_eq!(h.provisioner.torn_down(), vec![format!("ad-g{}-t1", game.id)]);
}

#[tokio::test]
async fn stop_tears_down_every_environment() {
  let h = harness(2).await;
  let game = h.ready_game(None).await;

  h.gameserver.start(game.id).await.unwrap();
  h.wait_for_tick(game.id, 1).await;

  let report = h.gameserver.stop(game.id).await.unwrap();
  assert_eq!(report.new_status, GameStatus::Finished);
  assert_eq!(report.containers_stopped, 2);
  assert_eq!(report.teardown_failures, 0);
  assert_eq!(
    h.provisioner.torn_down(),
    vec![format!("ad-g{}-t1", game.id), format!("ad-g{}-t2", game.id)]
  );

  let err = h.gameserver.stop(game.id).await.unwrap_err();
  assert_eq!(err.kind(), "conflict_error");
  let err = h.gameserver.start(game.id).await.unwrap_err();
  assert_eq!(err.kind(), "conflict_error");
}

#[tokio::test]
async fn game_finishes_after_max_ticks() {
  let h = harness(2).await;
  let game = h.ready_game(Some(1)).await;

  h.gameserver.start(game.id).await.unwrap();
  let gameserver = h.gameserver.clone();
  wait_for("game to finish", || {
    let gameserver = gameserver.clone();
    async move {
      let game = gameserver.get_game(game.id).await.unwrap();
      game.status == GameStatus::Finished && !gameserver.is_on_clock(game.id)
    }
  })
  .await;

  let game = h.gameserver.get_game(game.id).await.unwrap();
  assert_eq!(game.current_tick, 1);
  assert_eq!(h.provisioner.torn_down().len(), 2);
}

#[tokio::test]
async fn failed_provisioning_deactivates_only_that_team() {
  let h = harness(2).await;
  let game = h.ready_game(None).await;
  h.provisioner.break_env(&format!("ad-g{}-t2", game.id));

  h.gameserver.start(game.id).await.unwrap();
  h.wait_for_tick(game.id, 1).await;

  let healthy = h.gameserver.team(game.id, 1).await.unwrap();
  let broken = h.gameserver.team(game.id, 2).await.unwrap();
  assert!(healthy.is_active);
  assert!(!broken.is_active);
  assert!(broken.address.is_none());

  let db = h.gameserver.database();
  // the broken team still owns a flag, it just never got planted
  assert_eq!(dal::flag::list(db, game.id, None, None).await.unwrap().len(), 2);
  assert_eq!(h.provisioner.injected().len(), 1);

  let statuses = dal::service_status::for_game(db, game.id).await.unwrap();
  let broken_status = statuses.iter().find(|s| s.team_id == 2).unwrap();
  assert_eq!(broken_status.status, CheckStatus::Down);

  h.gameserver.force_stop(game.id).await.unwrap();
}

#[tokio::test]
async fn captured_flags_are_scored_and_replayable() {
  let h = harness(2).await;
  let game = h.ready_game(None).await;
  let db = h.gameserver.database();

  h.gameserver.start(game.id).await.unwrap();
  h.wait_for_tick(game.id, 1).await;

  let victim = dal::flag::list(db, game.id, Some(2), Some(1))
    .await
    .unwrap()
    .remove(0);
  let outcome = h
    .gameserver
    .submit_flag(game.id, 1, &victim.flag_value)
    .await
    .unwrap();
  assert_eq!(outcome.status, SubmissionStatus::Accepted);
  assert_eq!(outcome.points, 10);

  let again = h
    .gameserver
    .submit_flag(game.id, 1, &victim.flag_value)
    .await
    .unwrap();
  assert_eq!(again.status, SubmissionStatus::Duplicate);

  h.gameserver.pause(game.id).await.unwrap();
  h.gameserver.start(game.id).await.unwrap();
  h.wait_for_tick(game.id, 2).await;
  h.gameserver.pause(game.id).await.unwrap();

  let board = h.gameserver.scoreboard(game.id).await.unwrap();
  assert_eq!(board.current_tick, 2);
  let attacker = &board.entries[0];
  assert_eq!(attacker.team_id, 1);
  assert_eq!(attacker.rank, 1);
  assert_eq!(attacker.attack_points, 10);
  assert_eq!(attacker.sla_points, 2);
  assert_eq!(attacker.flags_captured, 1);
  let defender = &board.entries[1];
  assert_eq!(defender.defense_points, -10);
  assert_eq!(defender.total_points, -8);
  assert_eq!(defender.flags_lost, 1);

  let replayed =
    scoreboard::from_db(db, game.id, &h.gameserver.config().scoring)
      .await
      .unwrap();
  assert_eq!(replayed, board.entries);
}

#[tokio::test]
async fn subscribers_follow_the_game() {
  let h = harness(1).await;
  let game = h.ready_game(None).await;

  let mut subscription = h.gameserver.subscribe(game.id).await.unwrap();
  match subscription.recv().await.unwrap() {
    Event::Initial { game_name, .. } => assert_eq!(game_name, "finals"),
    other => panic!("expected initial, got {:?}", other),
  }
  assert!(matches!(
    subscription.recv().await.unwrap(),
    Event::Scoreboard { .. }
  ));

  h.gameserver.start(game.id).await.unwrap();
  h.wait_for_tick(game.id, 1).await;
  h.gameserver.pause(game.id).await.unwrap();

  let mut events = Vec::new();
  while let Some(event) = subscription.try_recv() {
    events.push(event);
  }
  let states: Vec<GameStatus> = events
    .iter()
    .filter_map(|event| match event {
      Event::GameState { status, .. } => Some(*status),
      _ => None,
    })
    .collect();
  assert_eq!(
    states,
    vec![GameStatus::Deploying, GameStatus::Running, GameStatus::Paused]
  );
  assert!(events.iter().any(|event| matches!(
    event,
    Event::TickChange { new_tick: 1, .. }
  )));
  assert!(events
    .iter()
    .any(|event| matches!(event, Event::ScoreboardUpdate { tick: 1, .. })));
}
