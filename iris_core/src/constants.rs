//! Shared tunables for the orchestrator core.
//!
//! Values that are deliberately not configuration: protocol grace windows,
//! cache bounds and store defaults. Anything an operator should tune lives
//! in `config::Settings` instead.

use std::time::Duration;

/// Grace window between the shutdown frame and a hard kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Grace window between an interrupt frame and forced termination of the
/// child when the inflight request was cancelled.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// Global deadline for terminating the whole fleet at shutdown.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Upper bound per output stream (stdout, stderr) of the per-team ring.
pub const OUTPUT_CACHE_CAP: usize = 1024 * 1024;

/// Default time-to-live for a queued notification.
pub const DEFAULT_NOTIFICATION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Default await deadline for `tell` when the caller does not provide one.
pub const DEFAULT_TELL_TIMEOUT_MS: u64 = 120_000;
