/// Environment variable names used by [`SinkOptions::from_env`].
///
/// These are purely helpers; the core pipeline types remain decoupled from
/// environment access.
///
/// [`SinkOptions::from_env`]: crate::options::SinkOptions::from_env

/// `true`/`false`: capture nested scopes into each record.
pub const LOG_SINK_INCLUDE_SCOPES_ENV: &str = "LOG_SINK_INCLUDE_SCOPES";

/// Flush period in whole seconds, must be greater than 1.
pub const LOG_SINK_SYNC_INTERVAL_ENV: &str = "LOG_SINK_SYNC_INTERVAL";

/// Storage target, e.g. `memory` or `clickhouse://127.0.0.1:8123/default/logs`.
pub const LOG_SINK_STORAGE_TARGET_ENV: &str = "LOG_SINK_STORAGE_TARGET";

/// Deadline for a single storage commit, in seconds.
pub const LOG_SINK_COMMIT_TIMEOUT_ENV: &str = "LOG_SINK_COMMIT_TIMEOUT_SECS";

/// Deadline for the flush worker to wind down at shutdown, in seconds.
pub const LOG_SINK_SHUTDOWN_TIMEOUT_ENV: &str = "LOG_SINK_SHUTDOWN_TIMEOUT_SECS";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
