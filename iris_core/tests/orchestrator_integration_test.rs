//! End-to-end verb tests against real scripted assistants, with the
//! configuration loaded from a YAML file and both stores backed by a
//! temporary `$IRIS_HOME/data` directory.

mod common;

use common::{fleet, init_test_logging};
use iris_core::OrchestratorError;
use iris_core::notification::{NewNotification, NotificationState};
use iris_core::orchestrator::TellStatus;

#[tokio::test]
async fn cold_wake_spawns_one_live_child() {
    init_test_logging();
    let fleet = fleet(&[("alpha", 0)], 5).await;

    let outcome = fleet.orchestrator.wake("alpha", None, true).await.unwrap();
    assert_eq!(outcome.status, "waking");

    let proc = fleet.orchestrator.pool().get_process("alpha");
    assert!(proc.is_some());
    assert!(proc.unwrap().status().is_live());

    let status = fleet.orchestrator.teams_get_status(None, false).await.unwrap();
    assert_eq!(status.pool.total_processes, 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn tell_round_trip_within_timeout() {
    init_test_logging();
    let fleet = fleet(&[("alpha", 0)], 5).await;

    let outcome = fleet
        .orchestrator
        .tell(None, "alpha", "ping", true, Some(10_000))
        .await
        .unwrap();
    assert_eq!(outcome.status, TellStatus::Replied);
    assert_eq!(outcome.reply.unwrap()["content"], "pong");

    // Exactly one framed line reached the child.
    let metrics = fleet
        .orchestrator
        .pool()
        .get_process("alpha")
        .unwrap()
        .metrics()
        .await;
    assert_eq!(metrics.message_count, 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn force_sleep_reports_lost_queue() {
    init_test_logging();
    let fleet = fleet(&[("slow", 30)], 5).await;

    fleet.orchestrator.wake("slow", None, true).await.unwrap();
    for _ in 0..3 {
        let outcome = fleet
            .orchestrator
            .quick_tell(None, "slow", "work")
            .await
            .unwrap();
        assert_eq!(outcome.status, TellStatus::Queued);
    }

    let outcome = fleet.orchestrator.sleep("slow", true, true).await.unwrap();
    assert_eq!(outcome.status, "sleeping");
    assert_eq!(outcome.lost_messages, Some(3));

    fleet.shutdown().await;
}

#[tokio::test]
async fn pool_cap_fails_then_recovers_after_sleep() {
    init_test_logging();
    let fleet = fleet(&[("a", 0), ("b", 0), ("c", 0)], 2).await;

    fleet.orchestrator.wake("a", None, true).await.unwrap();
    fleet.orchestrator.wake("b", None, true).await.unwrap();

    let err = fleet
        .orchestrator
        .tell(None, "c", "hello", true, Some(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PoolFull { limit: 2 }));

    fleet.orchestrator.sleep("a", false, true).await.unwrap();
    let outcome = fleet
        .orchestrator
        .tell(None, "c", "hello again", true, Some(10_000))
        .await
        .unwrap();
    assert_eq!(outcome.status, TellStatus::Replied);

    fleet.shutdown().await;
}

#[tokio::test]
async fn sessions_are_reused_per_edge_and_survive_sleep() {
    init_test_logging();
    let fleet = fleet(&[("a", 0), ("b", 0), ("c", 0)], 5).await;

    let first = fleet
        .orchestrator
        .tell(Some("a"), "b", "one", true, Some(10_000))
        .await
        .unwrap();
    let second = fleet
        .orchestrator
        .tell(Some("a"), "b", "two", true, Some(10_000))
        .await
        .unwrap();
    assert_eq!(first.session_id, second.session_id);

    let other_caller = fleet
        .orchestrator
        .tell(Some("c"), "b", "three", true, Some(10_000))
        .await
        .unwrap();
    assert_ne!(other_caller.session_id, first.session_id);

    // Sleep and re-tell: same edge, same session id on the new child.
    fleet.orchestrator.sleep("b", false, true).await.unwrap();
    let after_sleep = fleet
        .orchestrator
        .tell(Some("a"), "b", "four", true, Some(10_000))
        .await
        .unwrap();
    assert_eq!(after_sleep.session_id, first.session_id);

    fleet.shutdown().await;
}

#[tokio::test]
async fn notification_ttl_expires_pending() {
    init_test_logging();
    let fleet = fleet(&[("alpha", 0)], 5).await;
    let store = fleet.orchestrator.notifications();

    store
        .enqueue(NewNotification {
            from_team: None,
            to_team: "alpha".to_string(),
            content: "short-lived".to_string(),
            ttl_ms: Some(50),
        })
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    store.expire_sweep().await.unwrap();

    assert!(store.get_pending("alpha").await.unwrap().is_empty());
    let history = store.get_history("alpha", None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, NotificationState::Expired);

    fleet.shutdown().await;
}

#[tokio::test]
async fn report_survives_crashed_child() {
    init_test_logging();
    let fleet = fleet(&[("alpha", 0)], 5).await;

    // Replace the assistant with one that prints junk and dies.
    let team_dir = fleet.home.path().join("teams").join("alpha");
    std::fs::write(
        team_dir.join("assistant.sh"),
        "echo 'boot noise'\necho 'fatal: cannot continue' >&2\nexit 3\n",
    )
    .unwrap();

    fleet.orchestrator.wake("alpha", None, true).await.unwrap();
    // Wait for the crash to land.
    for _ in 0..50 {
        let live = fleet
            .orchestrator
            .pool()
            .get_process("alpha")
            .map(|p| p.status().is_live())
            .unwrap_or(false);
        if !live {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let report = fleet.orchestrator.report("alpha").await.unwrap();
    assert!(!report.live);
    assert!(report.output.stdout.contains("boot noise"));
    assert!(report.output.stderr.contains("fatal: cannot continue"));

    fleet.shutdown().await;
}

#[tokio::test]
async fn reboot_restarts_on_same_session() {
    init_test_logging();
    let fleet = fleet(&[("alpha", 0)], 5).await;

    let woken = fleet.orchestrator.wake("alpha", None, true).await.unwrap();
    let first = fleet.orchestrator.pool().get_process("alpha").unwrap();

    let rebooted = fleet.orchestrator.reboot("alpha").await.unwrap();
    assert_eq!(rebooted.status, "rebooted");
    assert_eq!(rebooted.session_id, woken.session_id);

    let second = fleet.orchestrator.pool().get_process("alpha").unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    assert!(second.status().is_live());

    fleet.shutdown().await;
}
