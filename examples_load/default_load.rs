use std::sync::Arc;
use std::time::Instant;

use buffered_log_sink::backend::StorageRegistry;
use buffered_log_sink::init::{init_tracing_with_config, LayerConfig};
use buffered_log_sink::memory_storage::MemoryStorage;
use buffered_log_sink::storage::LogStorage;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let storage = MemoryStorage::new();
    let mut registry = StorageRegistry::new();
    registry.register_instance("memory", Arc::new(storage.clone()) as Arc<dyn LogStorage>);

    let handle = init_tracing_with_config(
        &registry,
        LayerConfig {
            enable_stdout: false,
            ..LayerConfig::default()
        },
    )?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    let flushed = handle.shutdown().await?;
    println!("final flush committed {} records, {} stored in total", flushed, storage.len());
    Ok(())
}
