//! # Session Store
//!
//! Durable mapping of directed call edges `(fromTeam | external, toTeam)`
//! to opaque session ids. The id is minted once per edge and handed to
//! the child so the assistant can resume its conversational context
//! across wakes; independent caller/callee pairs never share a session.
//!
//! Persistence is a single JSON document under `$IRIS_HOME/data/`.
//! Every mutation rewrites the document through a temp file + rename so a
//! crash can never fork a session. A document with a newer schema version
//! than this build understands opens read-only rather than risking
//! corruption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

const SCHEMA_VERSION: u32 = 1;
const FILE_NAME: &str = "sessions.json";

/// One directed caller→callee session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// `None` models calls arriving from outside the fleet.
    pub from_team: Option<String>,
    pub to_team: String,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument {
    /// Absent in pre-release documents; those migrate forward on the
    /// next persist.
    #[serde(default)]
    version: u32,
    sessions: Vec<Session>,
}

type EdgeKey = (Option<String>, String);

#[derive(Debug)]
struct StoreState {
    sessions: HashMap<EdgeKey, Session>,
}

#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    read_only: bool,
    state: Mutex<StoreState>,
}

impl SessionStore {
    /// Open (or cold-start) the store inside a data directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| OrchestratorError::Store(format!("cannot create data dir: {}", e)))?;
        let path = data_dir.join(FILE_NAME);

        let mut read_only = false;
        let sessions = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| OrchestratorError::Store(format!("cannot read {}: {}", path.display(), e)))?;
            let document: SessionDocument = serde_json::from_str(&text)
                .map_err(|e| OrchestratorError::Store(format!("corrupt session store: {}", e)))?;
            if document.version > SCHEMA_VERSION {
                tracing::warn!(
                    "Session store at {} has schema v{} (newer than v{}); opening read-only",
                    path.display(),
                    document.version,
                    SCHEMA_VERSION
                );
                read_only = true;
            }
            document
                .sessions
                .into_iter()
                .map(|s| ((s.from_team.clone(), s.to_team.clone()), s))
                .collect()
        } else {
            tracing::info!("Cold-starting session store at {}", path.display());
            HashMap::new()
        };

        Ok(Self {
            path,
            read_only,
            state: Mutex::new(StoreState { sessions }),
        })
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        if self.read_only {
            return Err(OrchestratorError::Store(
                "session store is read-only (newer schema on disk)".to_string(),
            ));
        }
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let document = SessionDocument {
            version: SCHEMA_VERSION,
            sessions,
        };
        let text = serde_json::to_string_pretty(&document)
            .map_err(|e| OrchestratorError::Store(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)
            .map_err(|e| OrchestratorError::Store(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| OrchestratorError::Store(format!("commit {}: {}", self.path.display(), e)))?;
        Ok(())
    }

    /// Atomic upsert: a miss mints a fresh id, a hit refreshes
    /// `last_used_at`. Concurrent callers for the same edge observe the
    /// same id.
    pub async fn get_or_create(
        &self,
        from_team: Option<&str>,
        to_team: &str,
    ) -> Result<Session> {
        let mut state = self.state.lock().await;
        let key: EdgeKey = (from_team.map(str::to_string), to_team.to_string());
        let now = Utc::now();

        let session = match state.sessions.get_mut(&key) {
            Some(existing) => {
                existing.last_used_at = now;
                existing.clone()
            }
            None => {
                let session = Session {
                    from_team: key.0.clone(),
                    to_team: key.1.clone(),
                    session_id: Uuid::new_v4(),
                    created_at: now,
                    last_used_at: now,
                };
                tracing::info!(
                    "Minted session {} for edge {:?} -> {}",
                    session.session_id,
                    session.from_team,
                    session.to_team
                );
                state.sessions.insert(key, session.clone());
                session
            }
        };
        self.persist(&state)?;
        Ok(session)
    }

    /// Drop one edge; the next `get_or_create` mints a new id. Used when a
    /// child fails unrecoverably.
    pub async fn invalidate(&self, from_team: Option<&str>, to_team: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key: EdgeKey = (from_team.map(str::to_string), to_team.to_string());
        let removed = state.sessions.remove(&key).is_some();
        if removed {
            self.persist(&state)?;
            tracing::info!("Invalidated session {:?} -> {}", from_team, to_team);
        }
        Ok(removed)
    }

    /// Drop every edge into a team (the `delete` verb). Returns how many
    /// sessions were removed.
    pub async fn invalidate_team(&self, to_team: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|(_, to), _| to != to_team);
        let removed = before - state.sessions.len();
        if removed > 0 {
            self.persist(&state)?;
            tracing::info!("Invalidated {} session(s) into team '{}'", removed, to_team);
        }
        Ok(removed)
    }

    /// All known sessions, newest first. Diagnostics only.
    pub async fn list(&self) -> Vec<Session> {
        let state = self.state.lock().await;
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_edge() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let first = store.get_or_create(Some("a"), "b").await.unwrap();
        let second = store.get_or_create(Some("a"), "b").await.unwrap();
        assert_eq!(first.session_id, second.session_id);

        let other_edge = store.get_or_create(Some("c"), "b").await.unwrap();
        assert_ne!(first.session_id, other_edge.session_id);

        let external = store.get_or_create(None, "b").await.unwrap();
        assert_ne!(external.session_id, first.session_id);
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let dir = tempdir().unwrap();
        let minted = {
            let store = SessionStore::open(dir.path()).unwrap();
            store.get_or_create(Some("a"), "b").await.unwrap()
        };
        let store = SessionStore::open(dir.path()).unwrap();
        let reloaded = store.get_or_create(Some("a"), "b").await.unwrap();
        assert_eq!(minted.session_id, reloaded.session_id);
    }

    #[tokio::test]
    async fn invalidate_mints_fresh_id() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let first = store.get_or_create(Some("a"), "b").await.unwrap();
        assert!(store.invalidate(Some("a"), "b").await.unwrap());
        let second = store.get_or_create(Some("a"), "b").await.unwrap();
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn invalidate_team_removes_all_inbound_edges() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        store.get_or_create(Some("a"), "b").await.unwrap();
        store.get_or_create(Some("c"), "b").await.unwrap();
        let kept = store.get_or_create(Some("b"), "a").await.unwrap();

        assert_eq!(store.invalidate_team("b").await.unwrap(), 2);
        let remaining = store.list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, kept.session_id);
    }

    #[tokio::test]
    async fn newer_schema_opens_read_only() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("sessions.json"),
            r#"{"version": 99, "sessions": []}"#,
        )
        .unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let err = store.get_or_create(Some("a"), "b").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(_)));
    }
}
