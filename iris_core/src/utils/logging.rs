//! # Logging Initialization
//!
//! Centralized setup for the `tracing` stack. `init_logging` is safe to
//! call more than once; only the first call installs a subscriber.
//!
//! Two modes:
//!
//! 1. **File (default for the server)**: a daily rolling log file in the
//!    platform cache directory. The MCP server owns stdout for the wire
//!    protocol, so logs must never go there; file logging also preserves
//!    history across sessions. ANSI is disabled for file output.
//! 2. **Stderr (CLI and tests)**: colored output for terminals. Also the
//!    fallback whenever the cache directory cannot be created, e.g. in a
//!    sandboxed environment.
//!
//! Verbosity comes from `RUST_LOG` when set, otherwise from the level
//! passed by the caller with `iris_core=debug` layered on top.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    let _ = init_logging("trace", false);
}

/// Install the global tracing subscriber.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},iris_core=debug")));

        let stderr_init = |env_filter: EnvFilter| {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer().with_writer(stderr).with_ansi(true))
                .init();
        };

        if log_to_file {
            if let Some(proj_dirs) = ProjectDirs::from("dev", "Iris", "iris") {
                let log_dir = proj_dirs.cache_dir();
                if std::fs::create_dir_all(log_dir).is_ok() {
                    let file_appender = tracing_appender::rolling::daily(log_dir, "iris.log");
                    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                    // Leak the guard so buffered lines are flushed at exit.
                    Box::leak(Box::new(guard));
                } else {
                    stderr_init(env_filter);
                }
            } else {
                stderr_init(env_filter);
            }
        } else {
            stderr_init(env_filter);
        }
    });

    Ok(())
}
