use buffered_log_sink::backend::StorageRegistry;
use buffered_log_sink::init::{init_tracing_with_config, LayerConfig};
use buffered_log_sink::options::{SinkOptions, SyncInterval};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// Expects a table like:
///
/// ```sql
/// CREATE TABLE default.logs (
///   id        UInt64,
///   timestamp DateTime64(6, 'UTC'),
///   source    String,
///   level     LowCardinality(String),
///   event_id  Int32,
///   message   String,
///   scope     Nullable(String),
///   exception Nullable(String)
/// ) ENGINE = MergeTree ORDER BY (timestamp, id);
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dsn = std::env::var("CLICKHOUSE_DSN")
        .unwrap_or_else(|_| "clickhouse://default@127.0.0.1:8123/default/logs".to_string());

    let config = LayerConfig {
        options: SinkOptions {
            storage_target: dsn,
            sync_interval: SyncInterval::new(2)?,
            ..SinkOptions::default()
        },
        ..LayerConfig::default()
    };
    let handle = init_tracing_with_config(&StorageRegistry::with_builtin(), config)?;

    info!("starting service");
    error!(user_id = 42, reason = "invalid password", "authentication failed");

    // Let one periodic flush happen, then shut down with a final flush.
    sleep(Duration::from_secs(3)).await;
    handle.shutdown().await?;
    Ok(())
}
