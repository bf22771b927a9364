//! # Verb Composition
//!
//! The orchestrator glues the subsystems together for the transport
//! layer: it validates team names against the config snapshot, resolves
//! the session for the caller→callee edge, routes through the process
//! pool and falls back to the notification queue when delivery is not
//! possible. It owns nothing but `Arc` handles; the ownership tree stays
//! App → Pool → ChildProcess and App → stores.

use serde::Serialize;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    child_process::{ProcessMetrics, ProcessStatus},
    config::ConfigHandle,
    constants::DEFAULT_TELL_TIMEOUT_MS,
    error::{OrchestratorError, Result},
    notification::{NewNotification, Notification, NotificationStats, NotificationStore},
    output_cache::OutputSnapshot,
    pool::{PoolStatus, ProcessPool},
    session::SessionStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TellStatus {
    /// The child replied within the deadline.
    Replied,
    /// Submitted without waiting; the request sits in the child's queue.
    Queued,
    /// Delivery was not possible; a notification was enqueued instead.
    Notified,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TellOutcome {
    pub team: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_team: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub status: TellStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeOutcome {
    pub team: String,
    /// `awake` when the child was already live, `waking` when spawned.
    pub status: &'static str,
    pub session_id: Uuid,
    pub cache_cleared: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepOutcome {
    pub team: String,
    /// `sleeping` or `already_asleep`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_messages: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub team: String,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebootOutcome {
    pub team: String,
    pub status: &'static str,
    pub lost_messages: usize,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub team: String,
    pub status: &'static str,
    pub sessions_invalidated: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcome {
    pub team: String,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessStatus>,
    pub output: OutputSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamStatusEntry {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_notifications: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_notification: Option<Notification>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    pub teams: Vec<TeamStatusEntry>,
    pub pool: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationStats>,
}

pub struct Orchestrator {
    config: Arc<ConfigHandle>,
    pool: Arc<ProcessPool>,
    sessions: Arc<SessionStore>,
    notifications: Arc<NotificationStore>,
    background_shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ConfigHandle>,
        pool: Arc<ProcessPool>,
        sessions: Arc<SessionStore>,
        notifications: Arc<NotificationStore>,
    ) -> Self {
        Self {
            config,
            pool,
            sessions,
            notifications,
            background_shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ProcessPool> {
        &self.pool
    }

    pub fn notifications(&self) -> &Arc<NotificationStore> {
        &self.notifications
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Start the pool reaper and the notification expiry tick.
    pub fn start_background_tasks(&self) {
        Arc::clone(&self.pool).start_background_tasks();

        let config = Arc::clone(&self.config);
        let notifications = Arc::clone(&self.notifications);
        let shutdown = self.background_shutdown.clone();
        tokio::spawn(async move {
            loop {
                let interval =
                    Duration::from_millis(config.snapshot().settings.health_check_interval);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                if let Err(e) = notifications.expire_sweep().await {
                    tracing::warn!("Notification expiry sweep failed: {}", e);
                }
            }
        });
    }

    /// Graceful teardown: stop the tickers, then terminate the fleet
    /// under the global deadline.
    pub async fn shutdown(&self) {
        self.background_shutdown.cancel();
        self.pool.stop_background_tasks();
        self.pool.terminate_all().await;
    }

    fn validate_team(&self, name: &str) -> Result<()> {
        self.config.snapshot().team(name).map(|_| ())
    }

    fn validate_from(&self, from_team: Option<&str>) -> Result<()> {
        match from_team {
            Some(name) => self.validate_team(name),
            None => Ok(()),
        }
    }

    /// Deliver a message to a team and (optionally) await the reply.
    ///
    /// With `await_reply = false` the verb returns right after the
    /// request is queued on the child; if delivery is impossible
    /// (`PoolFull`, spawn failure, a terminating child) it degrades to a
    /// notification instead of failing.
    pub async fn tell(
        &self,
        from_team: Option<&str>,
        team: &str,
        content: &str,
        await_reply: bool,
        timeout_ms: Option<u64>,
    ) -> Result<TellOutcome> {
        self.validate_team(team)?;
        self.validate_from(from_team)?;

        let session = self.sessions.get_or_create(from_team, team).await?;
        let session_id = session.session_id;
        let sid = session_id.to_string();

        if await_reply {
            let proc = self.pool.get_or_create(team, &sid, from_team).await?;
            let deadline =
                Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TELL_TIMEOUT_MS));
            let handle = proc.submit(json!(content), Some(deadline)).await?;
            let request_id = handle.id();
            let reply = handle.await_reply().await?;
            return Ok(TellOutcome {
                team: team.to_string(),
                from_team: from_team.map(str::to_string),
                session_id: Some(session_id),
                status: TellStatus::Replied,
                request_id: Some(request_id),
                reply: Some(reply),
                notification_id: None,
            });
        }

        let submitted = async {
            let proc = self.pool.get_or_create(team, &sid, from_team).await?;
            proc.submit(json!(content), None).await
        }
        .await;

        match submitted {
            Ok(handle) => Ok(TellOutcome {
                team: team.to_string(),
                from_team: from_team.map(str::to_string),
                session_id: Some(session_id),
                status: TellStatus::Queued,
                request_id: Some(handle.id()),
                reply: None,
                notification_id: None,
            }),
            Err(
                e @ (OrchestratorError::PoolFull { .. }
                | OrchestratorError::Spawn { .. }
                | OrchestratorError::ProcessTerminated { .. }),
            ) => {
                tracing::info!(
                    "Submission to '{}' failed ({}); falling back to notification",
                    team,
                    e.kind()
                );
                self.notify(from_team, team, content, None).await
            }
            Err(e) => Err(e),
        }
    }

    /// Fire-and-forget: queue on the live child if there is one,
    /// otherwise leave a notification. Never wakes a sleeping team.
    pub async fn quick_tell(
        &self,
        from_team: Option<&str>,
        team: &str,
        content: &str,
    ) -> Result<TellOutcome> {
        self.validate_team(team)?;
        self.validate_from(from_team)?;

        if let Some(proc) = self.pool.get_process(team)
            && proc.status().is_live()
        {
            let session = self.sessions.get_or_create(from_team, team).await?;
            if let Ok(handle) = proc.submit(json!(content), None).await {
                return Ok(TellOutcome {
                    team: team.to_string(),
                    from_team: from_team.map(str::to_string),
                    session_id: Some(session.session_id),
                    status: TellStatus::Queued,
                    request_id: Some(handle.id()),
                    reply: None,
                    notification_id: None,
                });
            }
        }
        self.notify(from_team, team, content, None).await
    }

    async fn notify(
        &self,
        from_team: Option<&str>,
        team: &str,
        content: &str,
        ttl_ms: Option<u64>,
    ) -> Result<TellOutcome> {
        let notification = self
            .notifications
            .enqueue(NewNotification {
                from_team: from_team.map(str::to_string),
                to_team: team.to_string(),
                content: content.to_string(),
                ttl_ms,
            })
            .await?;
        Ok(TellOutcome {
            team: team.to_string(),
            from_team: from_team.map(str::to_string),
            session_id: None,
            status: TellStatus::Notified,
            request_id: None,
            reply: None,
            notification_id: Some(notification.id),
        })
    }

    /// Ensure a team is awake. Spawns without a payload when asleep.
    pub async fn wake(
        &self,
        team: &str,
        from_team: Option<&str>,
        clear_cache: bool,
    ) -> Result<WakeOutcome> {
        self.validate_team(team)?;
        self.validate_from(from_team)?;

        if let Some(proc) = self.pool.get_process(team)
            && proc.status().is_live()
        {
            // Already awake; clearing is a no-op when no cache exists.
            let cache_cleared = if clear_cache {
                self.pool.clear_output_cache(team).await
            } else {
                false
            };
            let session_id = proc
                .session_id()
                .parse()
                .unwrap_or_else(|_| Uuid::nil());
            return Ok(WakeOutcome {
                team: team.to_string(),
                status: "awake",
                session_id,
                cache_cleared,
            });
        }

        let session = self.sessions.get_or_create(from_team, team).await?;
        let sid = session.session_id.to_string();
        self.pool.get_or_create(team, &sid, from_team).await?;
        if clear_cache {
            self.pool.clear_output_cache(team).await;
        }
        Ok(WakeOutcome {
            team: team.to_string(),
            status: "waking",
            session_id: session.session_id,
            cache_cleared: clear_cache,
        })
    }

    /// Put a team to sleep. Force mode loses queued work and reports it.
    pub async fn sleep(&self, team: &str, force: bool, clear_cache: bool) -> Result<SleepOutcome> {
        self.validate_team(team)?;

        let live = self
            .pool
            .get_process(team)
            .map(|proc| proc.status().is_live())
            .unwrap_or(false);
        if !live {
            return Ok(SleepOutcome {
                team: team.to_string(),
                status: "already_asleep",
                lost_messages: None,
            });
        }

        if clear_cache {
            self.pool.clear_output_cache(team).await;
        }
        let report = self
            .pool
            .terminate_process(team, force)
            .await
            .unwrap_or_else(|| crate::child_process::TerminationReport {
                team: team.to_string(),
                lost_messages: 0,
                forced: force,
            });
        Ok(SleepOutcome {
            team: team.to_string(),
            status: "sleeping",
            lost_messages: force.then_some(report.lost_messages),
        })
    }

    /// Cancel a request; with no id, only the current inflight one.
    pub async fn cancel(&self, team: &str, request_id: Option<Uuid>) -> Result<CancelOutcome> {
        self.validate_team(team)?;
        let cancelled = match self.pool.get_process(team) {
            Some(proc) if proc.status().is_live() => proc.cancel(request_id).await,
            _ => false,
        };
        Ok(CancelOutcome {
            team: team.to_string(),
            cancelled,
            request_id,
        })
    }

    /// Force-sleep then wake with a fresh child on the same session.
    pub async fn reboot(&self, team: &str) -> Result<RebootOutcome> {
        self.validate_team(team)?;
        let slept = self.sleep(team, true, true).await?;
        let woken = self.wake(team, None, true).await?;
        Ok(RebootOutcome {
            team: team.to_string(),
            status: "rebooted",
            lost_messages: slept.lost_messages.unwrap_or(0),
            session_id: woken.session_id,
        })
    }

    /// Sleep the team and forget every session edge into it.
    /// Notification history is deliberately preserved.
    pub async fn delete(&self, team: &str) -> Result<DeleteOutcome> {
        self.validate_team(team)?;
        self.sleep(team, true, true).await?;
        let invalidated = self.sessions.invalidate_team(team).await?;
        Ok(DeleteOutcome {
            team: team.to_string(),
            status: "deleted",
            sessions_invalidated: invalidated,
        })
    }

    /// Snapshot of the team's recent output without mutating it.
    pub async fn report(&self, team: &str) -> Result<ReportOutcome> {
        self.validate_team(team)?;
        match self.pool.get_process(team) {
            Some(proc) => Ok(ReportOutcome {
                team: team.to_string(),
                live: proc.status().is_live(),
                status: Some(proc.status()),
                output: proc.cache().snapshot().await,
            }),
            None => Ok(ReportOutcome {
                team: team.to_string(),
                live: false,
                status: None,
                output: OutputSnapshot {
                    team: team.to_string(),
                    stdout: String::new(),
                    stderr: String::new(),
                    total_bytes: 0,
                },
            }),
        }
    }

    /// Per-team status document, optionally with notification summaries.
    pub async fn teams_get_status(
        &self,
        team: Option<&str>,
        include_notifications: bool,
    ) -> Result<StatusDocument> {
        let config = self.config.snapshot();
        if let Some(team) = team {
            config.team(team)?;
        }

        let pool_status = self.pool.get_status().await;
        let mut teams = Vec::new();
        for (name, team_config) in config
            .teams
            .iter()
            .filter(|(name, _)| team.is_none_or(|t| t == name.as_str()))
        {
            let process = pool_status.processes.get(name).cloned();
            let live = process
                .as_ref()
                .map(|m| m.status.is_live())
                .unwrap_or(false);
            let (pending, latest) = if include_notifications {
                let pending = self.notifications.get_pending(name).await?;
                let latest = pending.first().cloned();
                (Some(pending.len()), latest)
            } else {
                (None, None)
            };
            teams.push(TeamStatusEntry {
                name: name.to_string(),
                description: team_config.description.clone(),
                color: team_config.color.clone(),
                live,
                process,
                pending_notifications: pending,
                latest_notification: latest,
            });
        }

        let notifications = if include_notifications {
            Some(self.notifications.get_stats().await)
        } else {
            None
        };

        Ok(StatusDocument {
            teams,
            pool: pool_status,
            notifications,
        })
    }

    /// Acknowledge one notification by id, or every pending one for the
    /// team. Returns the number of notifications marked.
    pub async fn notifications_mark_read(
        &self,
        team: &str,
        id: Option<Uuid>,
    ) -> Result<usize> {
        self.validate_team(team)?;
        match id {
            Some(id) => Ok(usize::from(self.notifications.mark_read(id).await?)),
            None => self.notifications.mark_read_all(team).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IrisConfig, Settings, TeamConfig};
    use crate::utils::logging::init_test_logging;
    use tempfile::tempdir;

    const PONG_SCRIPT: &str = r#"echo '{"type":"ready"}'
while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
    *'"interrupt"'*) : ;;
    *) printf '{"type":"reply","content":"pong"}\n' ;;
  esac
done"#;

    fn harness(teams: &[&str], max_processes: usize) -> (Arc<Orchestrator>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let settings = Settings {
            idle_timeout: 60_000,
            max_processes,
            health_check_interval: 1_000,
            session_init_timeout: 5_000,
            http_port: None,
            default_transport: None,
            default_command: vec![
                "bash".to_string(),
                "-c".to_string(),
                PONG_SCRIPT.to_string(),
            ],
        };
        let teams = teams
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    TeamConfig {
                        path: std::env::temp_dir(),
                        description: format!("{} team", name),
                        idle_timeout: None,
                        session_init_timeout: None,
                        skip_permissions: None,
                        color: None,
                        command: None,
                    },
                )
            })
            .collect();
        let config = Arc::new(ConfigHandle::new(IrisConfig {
            settings,
            dashboard: None,
            teams,
        }));
        let pool = Arc::new(ProcessPool::new(Arc::clone(&config)));
        let sessions = Arc::new(SessionStore::open(dir.path()).unwrap());
        let notifications = Arc::new(NotificationStore::open(dir.path()).unwrap());
        (
            Arc::new(Orchestrator::new(config, pool, sessions, notifications)),
            dir,
        )
    }

    #[tokio::test]
    async fn tell_round_trip_replies() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["alpha"], 5);
        let outcome = orchestrator
            .tell(None, "alpha", "ping", true, Some(10_000))
            .await
            .unwrap();
        assert_eq!(outcome.status, TellStatus::Replied);
        assert_eq!(outcome.reply.unwrap()["content"], "pong");
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_team_is_rejected_before_any_work() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["alpha"], 5);
        let err = orchestrator
            .tell(None, "ghost", "ping", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTeam(_)));
        assert!(orchestrator.sessions.list().await.is_empty());
    }

    #[tokio::test]
    async fn session_reuse_per_directed_edge() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["a", "b", "c"], 5);
        let first = orchestrator
            .tell(Some("a"), "b", "one", true, Some(10_000))
            .await
            .unwrap();
        let second = orchestrator
            .tell(Some("a"), "b", "two", true, Some(10_000))
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);

        let other = orchestrator
            .tell(Some("c"), "b", "three", true, Some(10_000))
            .await
            .unwrap();
        assert_ne!(other.session_id, first.session_id);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn no_await_tell_falls_back_to_notification_on_pool_full() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["a", "b"], 1);
        orchestrator.wake("a", None, true).await.unwrap();

        let outcome = orchestrator
            .tell(None, "b", "later please", false, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, TellStatus::Notified);
        let pending = orchestrator.notifications.get_pending("b").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "later please");

        // Awaited tell surfaces the same condition as an error.
        let err = orchestrator
            .tell(None, "b", "now", true, Some(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PoolFull { .. }));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn quick_tell_to_sleeping_team_notifies_without_waking() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["alpha"], 5);
        let outcome = orchestrator
            .quick_tell(None, "alpha", "psst")
            .await
            .unwrap();
        assert_eq!(outcome.status, TellStatus::Notified);
        assert!(orchestrator.pool.get_process("alpha").is_none());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn wake_sleep_lifecycle() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["alpha"], 5);

        let woken = orchestrator.wake("alpha", None, true).await.unwrap();
        assert_eq!(woken.status, "waking");
        assert!(orchestrator.pool.get_process("alpha").is_some());

        let again = orchestrator.wake("alpha", None, false).await.unwrap();
        assert_eq!(again.status, "awake");
        assert_eq!(again.session_id, woken.session_id);

        let slept = orchestrator.sleep("alpha", false, true).await.unwrap();
        assert_eq!(slept.status, "sleeping");
        assert!(slept.lost_messages.is_none());

        let repeat = orchestrator.sleep("alpha", false, true).await.unwrap();
        assert_eq!(repeat.status, "already_asleep");
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn delete_invalidates_sessions_but_keeps_history() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["a", "b"], 5);
        orchestrator
            .tell(Some("a"), "b", "hi", true, Some(10_000))
            .await
            .unwrap();
        orchestrator.quick_tell(None, "b", "note").await.ok();
        orchestrator.sleep("b", true, true).await.unwrap();
        orchestrator.quick_tell(None, "b", "note").await.unwrap();

        // Two edges existed into 'b': (a, b) from the tell and (None, b)
        // from the live quick_tell.
        let deleted = orchestrator.delete("b").await.unwrap();
        assert_eq!(deleted.sessions_invalidated, 2);
        assert!(!orchestrator
            .notifications
            .get_history("b", None)
            .await
            .unwrap()
            .is_empty());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn status_document_lists_all_teams() {
        init_test_logging();
        let (orchestrator, _dir) = harness(&["a", "b"], 5);
        orchestrator.wake("a", None, true).await.unwrap();

        let status = orchestrator.teams_get_status(None, true).await.unwrap();
        assert_eq!(status.teams.len(), 2);
        let a = status.teams.iter().find(|t| t.name == "a").unwrap();
        assert!(a.live);
        let b = status.teams.iter().find(|t| t.name == "b").unwrap();
        assert!(!b.live);
        assert_eq!(status.pool.total_processes, 1);
        assert!(status.notifications.is_some());
        orchestrator.shutdown().await;
    }
}
