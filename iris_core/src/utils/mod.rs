//! Cross-cutting utility modules.
//!
//! - **`logging`**: tracing initialization (rolling file or stderr).

pub mod logging;
