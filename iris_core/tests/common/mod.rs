#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;

use iris_core::config::{self, ConfigHandle, IrisConfig};
use iris_core::notification::NotificationStore;
use iris_core::orchestrator::Orchestrator;
use iris_core::pool::ProcessPool;
use iris_core::session::SessionStore;

pub fn init_test_logging() {
    let _ = iris_core::utils::logging::init_logging("trace", false);
}

/// A complete temporary fleet: `$IRIS_HOME` with a YAML config, one
/// working directory per team, and a scripted line-protocol assistant.
pub struct TestFleet {
    pub home: TempDir,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestFleet {
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

/// The scripted assistant: announces readiness, replies `pong` to every
/// request after `delay` seconds, exits on the shutdown frame.
fn assistant_script(delay_secs: u64) -> String {
    let sleep_line = if delay_secs > 0 {
        format!("sleep {}; ", delay_secs)
    } else {
        String::new()
    };
    format!(
        r#"echo '{{"type":"ready"}}'
while IFS= read -r line; do
  case "$line" in
    *'"shutdown"'*) exit 0 ;;
    *'"interrupt"'*) : ;;
    *) {sleep_line}printf '{{"type":"reply","content":"pong"}}\n' ;;
  esac
done"#
    )
}

/// Build a fleet whose config is loaded from a real `config.yaml`.
/// `teams` pairs a team name with its assistant's reply delay in seconds.
pub async fn fleet(teams: &[(&str, u64)], max_processes: usize) -> TestFleet {
    let home = tempfile::tempdir().expect("create temp home");

    let mut yaml = format!(
        "settings:\n  idleTimeout: 60000\n  maxProcesses: {}\n  healthCheckInterval: 30000\n  sessionInitTimeout: 5000\nteams:\n",
        max_processes
    );
    for (name, delay) in teams {
        let team_dir = home.path().join("teams").join(name);
        std::fs::create_dir_all(&team_dir).expect("create team dir");
        std::fs::write(team_dir.join("assistant.sh"), assistant_script(*delay))
            .expect("write assistant script");
        yaml.push_str(&format!(
            "  {name}:\n    path: {}\n    description: \"{name} test team\"\n    command: [\"bash\", \"assistant.sh\"]\n",
            team_dir.display()
        ));
    }
    std::fs::write(home.path().join("config.yaml"), yaml).expect("write config");

    let config = IrisConfig::load(home.path()).expect("load config");
    let config = Arc::new(ConfigHandle::new(config));
    let data_dir = config::data_dir(home.path());
    let sessions = Arc::new(SessionStore::open(&data_dir).expect("open session store"));
    let notifications =
        Arc::new(NotificationStore::open(&data_dir).expect("open notification store"));
    let pool = Arc::new(ProcessPool::new(Arc::clone(&config)));
    let orchestrator = Arc::new(Orchestrator::new(config, pool, sessions, notifications));

    TestFleet { home, orchestrator }
}
