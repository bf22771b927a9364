//! # Process Pool
//!
//! Keyed supervisor over [`ChildProcess`]: one live child per team, hard
//! admission at `maxProcesses`, and a periodic idle reaper. The registry
//! lock is held only across map operations — spawning and termination
//! always happen outside it. When the cap is reached the pool fails with
//! `PoolFull` instead of evicting; retry is a caller concern.
//!
//! A stopped child (crash, protocol failure) stays registered so its
//! output cache remains available to `report`; it is replaced in place on
//! the next `get_or_create` and swept out by the reaper.

use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    child_process::{ChildProcess, ProcessMetrics, ProcessStatus, SpawnSpec, TerminationReport},
    config::ConfigHandle,
    constants::SHUTDOWN_DEADLINE,
    error::{OrchestratorError, Result},
    output_cache::OutputCache,
};

/// Aggregate pool view for status verbs and the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub total_processes: usize,
    pub max_processes: usize,
    pub processes: BTreeMap<String, ProcessMetrics>,
}

#[derive(Debug)]
pub struct ProcessPool {
    config: Arc<ConfigHandle>,
    registry: StdMutex<HashMap<String, Arc<ChildProcess>>>,
    /// Serialises spawns so two callers cannot race past the admission
    /// check; never held across registry reads by other paths.
    spawn_lock: tokio::sync::Mutex<()>,
    reaper_shutdown: CancellationToken,
}

impl ProcessPool {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self {
            config,
            registry: StdMutex::new(HashMap::new()),
            spawn_lock: tokio::sync::Mutex::new(()),
            reaper_shutdown: CancellationToken::new(),
        }
    }

    /// Start the periodic idle/health sweeper.
    pub fn start_background_tasks(self: Arc<Self>) {
        let pool = self;
        tokio::spawn(async move {
            loop {
                let interval = Duration::from_millis(
                    pool.config.snapshot().settings.health_check_interval,
                );
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = pool.reaper_shutdown.cancelled() => break,
                }
                pool.reap_idle().await;
            }
            tracing::debug!("Pool reaper stopped");
        });
    }

    fn live_entry(&self, team: &str) -> Option<Arc<ChildProcess>> {
        let registry = self.registry.lock().expect("pool registry poisoned");
        registry
            .get(team)
            .filter(|proc| proc.status().is_live())
            .cloned()
    }

    fn live_count(&self) -> usize {
        let registry = self.registry.lock().expect("pool registry poisoned");
        registry
            .values()
            .filter(|proc| proc.status().is_live())
            .count()
    }

    /// Return the live child for a team, spawning one if needed.
    ///
    /// The pool key is the team name alone: an existing live child is
    /// reused regardless of the requested session id — the session layer
    /// guarantees the ids line up when reuse is intended.
    pub async fn get_or_create(
        &self,
        team: &str,
        session_id: &str,
        from_team: Option<&str>,
    ) -> Result<Arc<ChildProcess>> {
        if let Some(proc) = self.live_entry(team) {
            return Ok(proc);
        }

        let _spawning = self.spawn_lock.lock().await;
        // Double-check: another caller may have spawned while we waited.
        if let Some(proc) = self.live_entry(team) {
            return Ok(proc);
        }

        let config = self.config.snapshot();
        let team_config = config.team(team)?;
        let max = config.settings.max_processes;
        if self.live_count() >= max {
            tracing::warn!(
                "Pool at capacity ({} live / {} max); refusing spawn for team '{}'",
                self.live_count(),
                max,
                team
            );
            return Err(OrchestratorError::PoolFull { limit: max });
        }

        let spec = SpawnSpec {
            team: team.to_string(),
            cwd: team_config.path.clone(),
            command: config.assistant_command(team).to_vec(),
            session_id: session_id.to_string(),
            from_team: from_team.map(str::to_string),
            skip_permissions: team_config.skip_permissions.unwrap_or(false),
            session_init_timeout: config.effective_session_init_timeout(team),
        };
        let proc = Arc::new(ChildProcess::start(spec).await?);

        let mut registry = self.registry.lock().expect("pool registry poisoned");
        registry.insert(team.to_string(), Arc::clone(&proc));
        tracing::info!(
            "Registered child for team '{}' ({} live)",
            team,
            registry.values().filter(|p| p.status().is_live()).count()
        );
        Ok(proc)
    }

    /// Non-creating observer; includes stopped post-mortem entries.
    pub fn get_process(&self, team: &str) -> Option<Arc<ChildProcess>> {
        let registry = self.registry.lock().expect("pool registry poisoned");
        registry.get(team).cloned()
    }

    pub fn get_output_cache(&self, team: &str) -> Option<Arc<OutputCache>> {
        self.get_process(team).map(|proc| proc.cache())
    }

    pub async fn clear_output_cache(&self, team: &str) -> bool {
        match self.get_output_cache(team) {
            Some(cache) => {
                cache.clear().await;
                true
            }
            None => false,
        }
    }

    /// Terminate a team's child and deregister it. Returns `None` if the
    /// team has no registered child.
    pub async fn terminate_process(
        &self,
        team: &str,
        force: bool,
    ) -> Option<TerminationReport> {
        let proc = self.get_process(team)?;
        let report = proc.terminate(force).await;
        self.remove_entry(team, &proc);
        Some(report)
    }

    /// Remove a registry entry, but only the exact child we acted on — a
    /// replacement spawned meanwhile must survive.
    fn remove_entry(&self, team: &str, proc: &Arc<ChildProcess>) {
        let mut registry = self.registry.lock().expect("pool registry poisoned");
        if let Some(current) = registry.get(team)
            && Arc::ptr_eq(current, proc)
        {
            registry.remove(team);
        }
    }

    /// Terminate every child, gracefully first, hard-killing stragglers
    /// once the global deadline expires.
    pub async fn terminate_all(&self) {
        let entries: Vec<(String, Arc<ChildProcess>)> = {
            let registry = self.registry.lock().expect("pool registry poisoned");
            registry
                .iter()
                .map(|(team, proc)| (team.clone(), Arc::clone(proc)))
                .collect()
        };
        if entries.is_empty() {
            return;
        }

        tracing::info!("Terminating {} child process(es)", entries.len());
        let graceful = futures::future::join_all(
            entries
                .iter()
                .map(|(_, proc)| proc.terminate(false)),
        );
        if tokio::time::timeout(SHUTDOWN_DEADLINE, graceful).await.is_err() {
            tracing::warn!(
                "Shutdown deadline {:?} elapsed; hard-killing stragglers",
                SHUTDOWN_DEADLINE
            );
            for (_, proc) in &entries {
                if proc.status().is_live() {
                    proc.terminate(true).await;
                }
            }
        }

        let mut registry = self.registry.lock().expect("pool registry poisoned");
        registry.clear();
    }

    pub async fn get_status(&self) -> PoolStatus {
        let entries: Vec<(String, Arc<ChildProcess>)> = {
            let registry = self.registry.lock().expect("pool registry poisoned");
            registry
                .iter()
                .map(|(team, proc)| (team.clone(), Arc::clone(proc)))
                .collect()
        };
        let mut processes = BTreeMap::new();
        for (team, proc) in entries {
            processes.insert(team, proc.metrics().await);
        }
        PoolStatus {
            total_processes: processes
                .values()
                .filter(|m| m.status.is_live())
                .count(),
            max_processes: self.config.snapshot().settings.max_processes,
            processes,
        }
    }

    /// One sweeper pass: drop stopped entries, gracefully terminate
    /// children idle past their effective timeout.
    pub async fn reap_idle(&self) {
        let config = self.config.snapshot();
        let entries: Vec<(String, Arc<ChildProcess>)> = {
            let registry = self.registry.lock().expect("pool registry poisoned");
            registry
                .iter()
                .map(|(team, proc)| (team.clone(), Arc::clone(proc)))
                .collect()
        };

        for (team, proc) in entries {
            if !proc.status().is_live() {
                tracing::debug!("Sweeping stopped entry for team '{}'", team);
                self.remove_entry(&team, &proc);
                continue;
            }
            // Only a genuinely idle child is reaped: a Busy child is mid
            // request, a Starting one has not finished its handshake.
            if proc.status() != ProcessStatus::Idle {
                continue;
            }
            let limit = config.effective_idle_timeout(&team);
            let idle = proc.idle_for();
            if idle > limit {
                tracing::info!(
                    "Team '{}' idle for {:?} (limit {:?}); terminating",
                    team,
                    idle,
                    limit
                );
                proc.terminate(false).await;
                self.remove_entry(&team, &proc);
            }
        }
    }

    /// Stop the reaper task; children are left to `terminate_all`.
    pub fn stop_background_tasks(&self) {
        self.reaper_shutdown.cancel();
    }
}
