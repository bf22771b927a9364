//! # Notification Store
//!
//! Durable per-team inbox for asynchronous cross-team messages, used when
//! the target team is asleep, busy, or the caller opted out of waiting.
//! State is monotonic: `pending → read` on acknowledgement, `pending →
//! expired` once the TTL elapses; both are terminal. The expiry sweep
//! runs on every read path and from the orchestrator's background tick,
//! so observers never see an overdue notification as pending.
//!
//! Persistence mirrors the session store: one JSON document, temp file +
//! rename on every mutation, read-only when the on-disk schema is newer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::constants::DEFAULT_NOTIFICATION_TTL_MS;
use crate::error::{OrchestratorError, Result};

const SCHEMA_VERSION: u32 = 1;
const FILE_NAME: &str = "notifications.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    Pending,
    Read,
    Expired,
}

impl NotificationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationState::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub from_team: Option<String>,
    pub to_team: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: NotificationState,
}

/// Arguments for `enqueue`.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub from_team: Option<String>,
    pub to_team: String,
    pub content: String,
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    pub total: usize,
    pub pending: usize,
    pub read: usize,
    pub expired: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotificationDocument {
    /// Absent in pre-release documents; those migrate forward on the
    /// next persist.
    #[serde(default)]
    version: u32,
    notifications: Vec<Notification>,
}

#[derive(Debug)]
pub struct NotificationStore {
    path: PathBuf,
    read_only: bool,
    state: Mutex<Vec<Notification>>,
}

impl NotificationStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| OrchestratorError::Store(format!("cannot create data dir: {}", e)))?;
        let path = data_dir.join(FILE_NAME);

        let mut read_only = false;
        let notifications = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                OrchestratorError::Store(format!("cannot read {}: {}", path.display(), e))
            })?;
            let document: NotificationDocument = serde_json::from_str(&text).map_err(|e| {
                OrchestratorError::Store(format!("corrupt notification store: {}", e))
            })?;
            if document.version > SCHEMA_VERSION {
                tracing::warn!(
                    "Notification store at {} has schema v{} (newer than v{}); opening read-only",
                    path.display(),
                    document.version,
                    SCHEMA_VERSION
                );
                read_only = true;
            }
            document.notifications
        } else {
            tracing::info!("Cold-starting notification store at {}", path.display());
            Vec::new()
        };

        Ok(Self {
            path,
            read_only,
            state: Mutex::new(notifications),
        })
    }

    fn persist(&self, notifications: &[Notification]) -> Result<()> {
        if self.read_only {
            return Err(OrchestratorError::Store(
                "notification store is read-only (newer schema on disk)".to_string(),
            ));
        }
        let document = NotificationDocument {
            version: SCHEMA_VERSION,
            notifications: notifications.to_vec(),
        };
        let text = serde_json::to_string_pretty(&document)
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)
            .map_err(|e| OrchestratorError::Store(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            OrchestratorError::Store(format!("commit {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    /// Flip overdue pending rows to expired. Returns how many flipped.
    fn sweep_locked(notifications: &mut [Notification], now: DateTime<Utc>) -> usize {
        let mut flipped = 0;
        for notification in notifications.iter_mut() {
            if notification.state == NotificationState::Pending && notification.expires_at <= now {
                notification.state = NotificationState::Expired;
                flipped += 1;
            }
        }
        flipped
    }

    pub async fn enqueue(&self, new: NewNotification) -> Result<Notification> {
        let now = Utc::now();
        let ttl = new.ttl_ms.unwrap_or(DEFAULT_NOTIFICATION_TTL_MS);
        let notification = Notification {
            id: Uuid::new_v4(),
            from_team: new.from_team,
            to_team: new.to_team,
            content: new.content,
            created_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl as i64),
            state: NotificationState::Pending,
        };

        let mut state = self.state.lock().await;
        state.push(notification.clone());
        self.persist(&state)?;
        tracing::info!(
            "Queued notification {} for team '{}' (ttl {}ms)",
            notification.id,
            notification.to_team,
            ttl
        );
        Ok(notification)
    }

    /// Pending, unexpired notifications for one team, newest first.
    pub async fn get_pending(&self, team: &str) -> Result<Vec<Notification>> {
        let mut state = self.state.lock().await;
        if Self::sweep_locked(&mut state, Utc::now()) > 0 {
            self.persist(&state)?;
        }
        let mut pending: Vec<Notification> = state
            .iter()
            .filter(|n| n.to_team == team && n.state == NotificationState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pending)
    }

    /// All notifications for a team in every state, newest first.
    pub async fn get_history(&self, team: &str, limit: Option<usize>) -> Result<Vec<Notification>> {
        let mut state = self.state.lock().await;
        if Self::sweep_locked(&mut state, Utc::now()) > 0 {
            self.persist(&state)?;
        }
        let mut history: Vec<Notification> = state
            .iter()
            .filter(|n| n.to_team == team)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            history.truncate(limit);
        }
        Ok(history)
    }

    /// Acknowledge one notification. Terminal states are left untouched.
    pub async fn mark_read(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        Self::sweep_locked(&mut state, Utc::now());
        let changed = match state.iter_mut().find(|n| n.id == id) {
            Some(notification) if !notification.state.is_terminal() => {
                notification.state = NotificationState::Read;
                true
            }
            _ => false,
        };
        if changed {
            self.persist(&state)?;
        }
        Ok(changed)
    }

    /// Acknowledge every pending notification for a team. Returns the count.
    pub async fn mark_read_all(&self, team: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        Self::sweep_locked(&mut state, Utc::now());
        let mut changed = 0;
        for notification in state.iter_mut() {
            if notification.to_team == team && notification.state == NotificationState::Pending {
                notification.state = NotificationState::Read;
                changed += 1;
            }
        }
        if changed > 0 {
            self.persist(&state)?;
        }
        Ok(changed)
    }

    /// Bulk `pending → expired` for overdue rows across all teams.
    pub async fn expire_sweep(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let flipped = Self::sweep_locked(&mut state, Utc::now());
        if flipped > 0 {
            self.persist(&state)?;
            tracing::debug!("Expired {} overdue notification(s)", flipped);
        }
        Ok(flipped)
    }

    pub async fn get_stats(&self) -> NotificationStats {
        let state = self.state.lock().await;
        let mut stats = NotificationStats {
            total: state.len(),
            pending: 0,
            read: 0,
            expired: 0,
        };
        for notification in state.iter() {
            match notification.state {
                NotificationState::Pending => stats.pending += 1,
                NotificationState::Read => stats.read += 1,
                NotificationState::Expired => stats.expired += 1,
            }
        }
        stats
    }
}
