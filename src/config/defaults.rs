//! Default configuration values for swankbridge.

/// Evaluator binary launched when none is configured
pub const PROGRAM: &str = "irteusgl";

/// Editor-facing listen address
pub const HOST: &str = "127.0.0.1";

/// Editor-facing port (SLIME's default)
pub const PORT: u16 = 4005;

pub const READ_BUFFER_SIZE: usize = 7000;

pub const POLL_INTERVAL_MS: u64 = 5;

pub const CALL_STACK_DEPTH: usize = 10;

pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Grace period between SIGTERM and SIGKILL
pub const TERMINATE_TIMEOUT_MS: u64 = 2_000;

/// Package name and prompt reported to the editor
pub const IMPLEMENTATION: &str = "irteusgl";

/// Variables set on every evaluator process regardless of configuration.
///
/// ROS loggers only line-buffer stdout when asked to, which would otherwise
/// hold back REPL output until the buffer fills.
pub const FORCED_ENVIRONMENT: &[(&str, &str)] = &[("ROSCONSOLE_STDOUT_LINE_BUFFERED", "1")];
