use chrono::{TimeZone, Utc};
use serde_json::json;
use std::time::Duration;

use super::support::{agent, runner};
use crate::core::forge::types::AgentStatus;
use crate::core::forge::{ForgeScheduler, RunStatus, RunType, SchedulerSettings};
use crate::core::store::test_store;
use crate::core::store::types::{AgentProfileInput, NewRun};

fn scheduler(store: &crate::core::store::ForgeStore) -> ForgeScheduler {
    ForgeScheduler::new(runner(store, None), SchedulerSettings::default())
}

#[tokio::test]
async fn tick_starts_due_agent_once_per_day() {
    let store = test_store();
    let profile = agent(&store, None).await;
    let sched = scheduler(&store);
    let now = Utc.with_ymd_and_hms(2026, 7, 1, 0, 5, 0).unwrap();

    let first = sched.tick(now).await.unwrap();
    assert!(first.in_window);
    assert_eq!(first.date, "2026-07-01");
    assert_eq!(first.started.len(), 1);
    assert_eq!(first.started[0].agent_id, profile.id);

    let second = sched.tick(now + chrono::Duration::minutes(1)).await.unwrap();
    assert!(second.already_ticked);
    assert!(second.started.is_empty());

    let stored = store.get_agent(&profile.id).await.unwrap().unwrap();
    assert_eq!(stored.last_scheduled_run_date.as_deref(), Some("2026-07-01"));
    let run = store.get_run(&first.started[0].run_id).await.unwrap().unwrap();
    assert_eq!(run.run_type, RunType::Scheduled);
    assert_eq!(run.scheduled_for.as_deref(), Some("2026-07-01"));
}

#[tokio::test]
async fn persisted_date_guards_a_restarted_scheduler() {
    let store = test_store();
    let profile = agent(&store, None).await;
    store.mark_scheduled(&profile.id, "2026-07-01").await.unwrap();

    let report = scheduler(&store)
        .tick(Utc.with_ymd_and_hms(2026, 7, 1, 0, 2, 0).unwrap())
        .await
        .unwrap();
    assert!(report.started.is_empty());
    assert_eq!(report.not_due, vec![profile.id]);
}

#[tokio::test]
async fn tick_outside_window_does_nothing() {
    let store = test_store();
    agent(&store, None).await;
    let report = scheduler(&store)
        .tick(Utc.with_ymd_and_hms(2026, 7, 1, 0, 10, 0).unwrap())
        .await
        .unwrap();
    assert!(!report.in_window);
    assert!(report.started.is_empty());
    assert!(store.list_agents().await.unwrap()[0].last_scheduled_run_date.is_none());
}

#[tokio::test]
async fn cadence_is_measured_in_whole_days() {
    let store = test_store();
    let every_three = store
        .create_agent(&AgentProfileInput {
            name: Some("Every three days".into()),
            cadence_days: Some(3),
            ..Default::default()
        })
        .await
        .unwrap();
    store.mark_scheduled(&every_three.id, "2026-06-29").await.unwrap();

    let sched = scheduler(&store);
    let report = sched
        .tick(Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 30).unwrap())
        .await
        .unwrap();
    assert_eq!(report.not_due, vec![every_three.id.clone()]);

    let later = scheduler(&store)
        .tick(Utc.with_ymd_and_hms(2026, 7, 2, 0, 0, 30).unwrap())
        .await
        .unwrap();
    assert_eq!(later.started.len(), 1);
}

#[tokio::test]
async fn rejected_start_does_not_consume_the_day() {
    let store = test_store();
    let profile = agent(&store, None).await;
    let holder = store
        .create_run(&NewRun {
            agent_id: profile.id.clone(),
            run_type: RunType::Manual,
            dry_run: false,
            scheduled_for: None,
            max_iterations: 1,
            batch_size: 10,
            max_messages: 10,
            metadata: json!({}),
        })
        .await
        .unwrap();
    store.acquire_lock(&profile.id, &holder.id, "other").await.unwrap();

    let report = scheduler(&store)
        .tick(Utc.with_ymd_and_hms(2026, 7, 1, 0, 1, 0).unwrap())
        .await
        .unwrap();
    assert_eq!(report.rejected, vec![profile.id.clone()]);
    let stored = store.get_agent(&profile.id).await.unwrap().unwrap();
    assert!(stored.last_scheduled_run_date.is_none());

    let runs = store.list_runs(&profile.id, 10).await.unwrap();
    assert!(runs.iter().any(|r| r.status == RunStatus::RejectedConcurrent));
}

#[tokio::test]
async fn stale_lock_from_a_crashed_run_is_reclaimed_by_the_next_tick() {
    let store = test_store().with_lock_ttl(Duration::from_millis(1));
    let profile = agent(&store, None).await;
    let crashed = store
        .create_run(&NewRun {
            agent_id: profile.id.clone(),
            run_type: RunType::Scheduled,
            dry_run: false,
            scheduled_for: Some("2026-06-30".into()),
            max_iterations: 1,
            batch_size: 10,
            max_messages: 10,
            metadata: json!({}),
        })
        .await
        .unwrap();
    store.acquire_lock(&profile.id, &crashed.id, "runner").await.unwrap();
    // The process died here: no release, agent left `running`.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stuck = store.get_agent(&profile.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, AgentStatus::Running);

    let report = scheduler(&store)
        .tick(Utc.with_ymd_and_hms(2026, 7, 1, 0, 5, 0).unwrap())
        .await
        .unwrap();
    assert_eq!(report.started.len(), 1);
    assert!(report.rejected.is_empty());
    let stored = store.get_agent(&profile.id).await.unwrap().unwrap();
    assert_eq!(stored.last_scheduled_run_date.as_deref(), Some("2026-07-01"));
}

#[tokio::test]
async fn failed_date_write_still_guards_the_rest_of_the_day() {
    let store = test_store();
    let profile = agent(&store, None).await;
    store
        .execute_batch_for_test(
            "CREATE TRIGGER block_schedule_date
             BEFORE UPDATE OF last_scheduled_run_date ON agent_profiles
             BEGIN SELECT RAISE(ABORT, 'date write refused'); END;",
        )
        .await;
    let sched = scheduler(&store);
    let now = Utc.with_ymd_and_hms(2026, 7, 1, 0, 5, 0).unwrap();

    let first = sched.tick(now).await.unwrap();
    assert_eq!(first.started.len(), 1);
    assert_eq!(first.errors.len(), 1);
    assert!(first.errors[0].starts_with(&profile.id));

    let second = sched.tick(now + chrono::Duration::minutes(1)).await.unwrap();
    assert!(second.already_ticked);
    assert!(second.started.is_empty());
}

#[tokio::test]
async fn inactive_agents_are_skipped() {
    let store = test_store();
    store
        .create_agent(&AgentProfileInput {
            name: Some("Paused".into()),
            status: Some(AgentStatus::Inactive),
            ..Default::default()
        })
        .await
        .unwrap();
    let report = scheduler(&store)
        .tick(Utc.with_ymd_and_hms(2026, 7, 1, 0, 1, 0).unwrap())
        .await
        .unwrap();
    assert!(report.started.is_empty());
    assert!(report.not_due.is_empty());
}

#[tokio::test]
async fn local_midnight_follows_configured_timezone() {
    let store = test_store();
    agent(&store, None).await;
    let sched = ForgeScheduler::new(
        runner(&store, None),
        SchedulerSettings {
            timezone: chrono_tz::Asia::Bangkok,
            ..Default::default()
        },
    );
    // 17:05 UTC is 00:05 the next day in Bangkok
    let report = sched
        .tick(Utc.with_ymd_and_hms(2026, 7, 1, 17, 5, 0).unwrap())
        .await
        .unwrap();
    assert!(report.in_window);
    assert_eq!(report.date, "2026-07-02");
    assert_eq!(report.started.len(), 1);
}

#[tokio::test]
async fn process_now_ignores_cadence() {
    let store = test_store();
    let profile = agent(&store, None).await;
    let today = Utc::now().format("%Y-%m-%d").to_string();
    store.mark_scheduled(&profile.id, &today).await.unwrap();

    let report = scheduler(&store)
        .process_now(Some(&profile.id), "operator")
        .await
        .unwrap();
    assert_eq!(report.started.len(), 1);

    let err = scheduler(&store).process_now(Some("missing"), "operator").await;
    assert!(err.is_err());
}
