use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use buffered_log_sink::{
    backend::StorageRegistry,
    init::{init_tracing_with_config, LayerConfig},
    options::SinkOptions,
    record::{Record, RecordId},
    storage::{LogStorage, StorageError, StorageSession},
};
use tracing::{error, info, info_span};

/// Example of integrating a completely custom backend by implementing the
/// storage traits directly. Imagine this talks to some proprietary DB for
/// which this crate does not provide a built-in storage.
#[derive(Default)]
struct MyCustomDbStorage {
    next_id: Arc<AtomicU64>,
}

struct MyCustomDbSession {
    next_id: Arc<AtomicU64>,
    staged: Vec<Record>,
}

#[async_trait]
impl LogStorage for MyCustomDbStorage {
    async fn open_session(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        Ok(Box::new(MyCustomDbSession {
            next_id: Arc::clone(&self.next_id),
            staged: Vec::new(),
        }))
    }
}

#[async_trait]
impl StorageSession for MyCustomDbSession {
    fn add_batch(&mut self, records: Vec<Record>) {
        self.staged.extend(records);
    }

    async fn commit(&mut self) -> Result<usize, StorageError> {
        // Here you would call your own client library for the target DB.
        // For the sake of example we just print the records.
        for record in &mut self.staged {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            record.assign_identity(RecordId(id));
            println!("[my-custom-db] {}", record);
        }
        Ok(self.staged.len())
    }

    fn take_staged(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.staged)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = StorageRegistry::with_builtin();
    registry.register("my-custom-db", |_| Ok(Arc::new(MyCustomDbStorage::default()) as Arc<dyn LogStorage>));

    let config = LayerConfig {
        options: SinkOptions {
            include_scopes: true,
            storage_target: "my-custom-db".to_string(),
            ..SinkOptions::default()
        },
        ..LayerConfig::default()
    };
    let handle = init_tracing_with_config(&registry, config)?;

    info!("custom backend example started");
    {
        let span = info_span!("checkout");
        let _entered = span.enter();
        error!(db = "my-custom-db", event_id = 500, "simulated error sent via custom backend");
    }

    handle.shutdown().await?;
    Ok(())
}
