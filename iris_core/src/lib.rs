//! # Iris Core
//!
//! Iris orchestrates a fleet of long-lived assistant subprocesses, one
//! logical instance per named *team*, on behalf of remote callers driving
//! it through the Model Context Protocol. Callers issue high-level verbs
//! — tell a team something and await the reply, wake or sleep a team,
//! cancel an inflight request, report on recent output, queue cross-team
//! notifications — and iris owns the lifecycle, scheduling, I/O framing,
//! session continuity and cross-team routing underneath.
//!
//! ## Architecture
//!
//! Three subsystems carry the weight:
//!
//! - **Process pool** (`pool` + `child_process`): a keyed supervisor that
//!   lazily spawns, idles out and terminates children, streams framed
//!   JSON on their stdio and enforces single-inflight FIFO semantics per
//!   child. Admission is hard: at `maxProcesses` the pool fails with
//!   `PoolFull` rather than evicting.
//! - **Session store** (`session`): a durable directed mapping
//!   `(fromTeam, toTeam) → sessionId` so an assistant resumes its
//!   conversational context across wakes while independent caller pairs
//!   stay isolated.
//! - **Notification store** (`notification`): a durable per-team inbox
//!   with pending/read/expired states for messages that could not be —
//!   or deliberately were not — delivered synchronously.
//!
//! The `orchestrator` module composes these into the verb surface, the
//! `mcp_service` module exposes the verbs as MCP tools, and `dashboard`
//! adds a read-only HTTP view. Configuration is one YAML document under
//! `$IRIS_HOME` (`config`), edited in place without disturbing comments
//! (`config_edit`).
//!
//! ## Concurrency model
//!
//! One process, many cooperative flows. Each child has its own I/O tasks
//! and a per-instance lock serialising queue and status mutation; the
//! pool registry lock covers fast map operations only. Cancellation is a
//! first-class signal carried by tokens, and deadlines surface as
//! `Timeout`.

pub mod child_process;
pub mod cli;
pub mod config;
pub mod config_edit;
pub mod constants;
pub mod dashboard;
pub mod error;
pub mod mcp_service;
pub mod notification;
pub mod orchestrator;
pub mod output_cache;
pub mod pool;
pub mod session;
pub mod utils;

pub use error::OrchestratorError;
pub use mcp_service::IrisMcpService;
pub use orchestrator::Orchestrator;
