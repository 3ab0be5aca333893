use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buffered_log_sink::backend::StorageRegistry;
use buffered_log_sink::collector::Collector;
use buffered_log_sink::flush::FlushHandler;
use buffered_log_sink::init::{build_pipeline, LayerConfig};
use buffered_log_sink::memory_storage::MemoryStorage;
use buffered_log_sink::options::{OptionsMonitor, SinkOptions, SyncInterval};
use buffered_log_sink::provider::SinkProvider;
use buffered_log_sink::record::{Level, Record, RecordId};
use buffered_log_sink::scheduler::{FlushScheduler, SchedulerError};
use buffered_log_sink::storage::{LogStorage, StorageError, StorageSession};
use tracing_subscriber::layer::SubscriberExt;

/// Storage that tracks how many commits run at once and can be switched
/// between failing and healthy.
#[derive(Clone, Default)]
struct GuardedStorage {
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    inner: MemoryStorage,
    commit_delay: Duration,
}

struct GuardedSession {
    storage: GuardedStorage,
    inner: Box<dyn StorageSession>,
}

#[async_trait]
impl LogStorage for GuardedStorage {
    async fn open_session(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        Ok(Box::new(GuardedSession {
            storage: self.clone(),
            inner: self.inner.open_session().await?,
        }))
    }
}

#[async_trait]
impl StorageSession for GuardedSession {
    fn add_batch(&mut self, records: Vec<Record>) {
        self.inner.add_batch(records);
    }

    async fn commit(&mut self) -> Result<usize, StorageError> {
        let now = self.storage.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.storage.max_active.fetch_max(now, Ordering::SeqCst);
        self.storage.commits.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.storage.commit_delay).await;
        let result = if self.storage.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("database offline".into()))
        } else {
            self.inner.commit().await
        };

        self.storage.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn take_staged(&mut self) -> Vec<Record> {
        self.inner.take_staged()
    }
}

fn monitor(interval_secs: u64) -> Arc<OptionsMonitor> {
    let options = SinkOptions {
        sync_interval: SyncInterval::new(interval_secs).unwrap(),
        ..Default::default()
    };
    Arc::new(OptionsMonitor::new(options).unwrap())
}

#[tokio::test(start_paused = true)]
async fn reconfiguring_never_overlaps_flush_cycles() {
    let storage = GuardedStorage {
        commit_delay: Duration::from_millis(1500),
        ..Default::default()
    };
    let monitor = monitor(2);
    let collector = Arc::new(Collector::new());
    let handler = Arc::new(FlushHandler::new(
        Arc::clone(&collector),
        Arc::new(storage.clone()),
        Duration::from_secs(30),
    ));
    let scheduler = Arc::new(FlushScheduler::new(handler, Arc::clone(&monitor)));
    scheduler.start().unwrap();

    for round in 0..20u64 {
        collector.enqueue(Record::new("svc", Level::Information, round as i32, "tick"));
        scheduler.reconfigure(SyncInterval::new(2 + round % 3).unwrap());
        // Manual triggers racing the timer are coalesced, never stacked.
        let _ = scheduler.trigger().await;
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    scheduler.stop().await.unwrap();
    assert_eq!(storage.max_active.load(Ordering::SeqCst), 1);
    assert!(storage.commits.load(Ordering::SeqCst) > 1);
    assert_eq!(storage.inner.len(), 20);
    assert!(collector.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emitters_lose_nothing() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 500;

    let storage = MemoryStorage::new();
    let monitor = monitor(2);
    let collector = Arc::new(Collector::new());
    let provider = Arc::new(SinkProvider::new(Arc::clone(&collector), Arc::clone(&monitor), None));
    let handler = Arc::new(FlushHandler::new(
        Arc::clone(&collector),
        Arc::new(storage.clone()),
        Duration::from_secs(5),
    ));
    let scheduler = FlushScheduler::new(handler, monitor);
    scheduler.start().unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let provider = Arc::clone(&provider);
            std::thread::spawn(move || {
                let emitter = provider.emitter(&format!("producer-{p}"));
                for i in 0..PER_PRODUCER {
                    emitter.log_message(Level::Information, format!("{p}:{i}")).unwrap();
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    scheduler.stop().await.unwrap();
    let records = storage.records();
    assert_eq!(records.len(), PRODUCERS * PER_PRODUCER);

    let mut ids: Vec<RecordId> = records.iter().filter_map(Record::identity).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), PRODUCERS * PER_PRODUCER);
    assert!(collector.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_cycles_keep_records_until_storage_recovers() {
    let storage = GuardedStorage::default();
    storage.failing.store(true, Ordering::SeqCst);

    let monitor = monitor(2);
    let collector = Arc::new(Collector::new());
    let handler = Arc::new(FlushHandler::new(
        Arc::clone(&collector),
        Arc::new(storage.clone()),
        Duration::from_secs(5),
    ));
    let scheduler = FlushScheduler::new(handler, monitor);
    for i in 0..3 {
        collector.enqueue(Record::new("svc", Level::Error, i, "pending"));
    }
    scheduler.start().unwrap();

    // A few failing ticks: the scheduler keeps going and nothing is lost.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(scheduler.stats().failures >= 2);
    assert_eq!(collector.len(), 3);
    assert!(storage.inner.is_empty());

    storage.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(storage.inner.len(), 3);
    assert!(collector.is_empty());

    assert_eq!(scheduler.stop().await.unwrap(), 0);
    assert_eq!(scheduler.stats().processed, 3);
}

#[tokio::test]
async fn filtered_source_only_queues_enabled_levels() {
    let monitor = monitor(5);
    let collector = Arc::new(Collector::new());
    let provider = SinkProvider::new(
        Arc::clone(&collector),
        monitor,
        Some(buffered_log_sink::emitter::Filter::new(|_, level| level != Level::Trace)),
    );

    let emitter = provider.emitter("orders");
    emitter.log_message(Level::Information, "A").unwrap();
    emitter.log_message(Level::Trace, "B").unwrap();

    let storage = MemoryStorage::new();
    let handler = FlushHandler::new(Arc::clone(&collector), Arc::new(storage.clone()), Duration::from_secs(5));
    assert_eq!(handler.process().await.unwrap(), 1);
    assert_eq!(storage.records()[0].message(), "A");
}

fn layer_config(target: &str, interval_secs: u64) -> LayerConfig {
    LayerConfig {
        options: SinkOptions {
            storage_target: target.to_string(),
            sync_interval: SyncInterval::new(interval_secs).unwrap(),
            ..Default::default()
        },
        filter: None,
        enable_stdout: false,
    }
}

#[tokio::test(start_paused = true)]
async fn pipeline_diagnostics_never_reach_storage() {
    let storage = MemoryStorage::new();
    let mut registry = StorageRegistry::new();
    registry.register_instance("mem", Arc::new(storage.clone()));

    let (layer, handle) = build_pipeline(&registry, layer_config("mem", 5)).unwrap();
    let collector = Arc::clone(handle.collector());
    let _default = tracing::subscriber::set_default(tracing_subscriber::Registry::default().with(layer));

    tracing::error!(target: "app", "payment failed");
    tokio::time::sleep(Duration::from_secs(21)).await;

    let stored = storage.records();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source(), "app");
    assert!(collector.is_empty());

    assert_eq!(handle.shutdown().await.unwrap(), 0);
    assert_eq!(storage.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_stalled_commit_keeps_records() {
    let storage = GuardedStorage {
        commit_delay: Duration::from_secs(3600),
        ..Default::default()
    };
    let mut registry = StorageRegistry::new();
    registry.register_instance("stalled", Arc::new(storage.clone()));

    let (layer, handle) = build_pipeline(&registry, layer_config("stalled", 5)).unwrap();
    let collector = Arc::clone(handle.collector());
    let _default = tracing::subscriber::set_default(tracing_subscriber::Registry::default().with(layer));

    for i in 0..3 {
        tracing::warn!(target: "orders", event_id = i, "retrying");
    }
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(storage.commits.load(Ordering::SeqCst), 1);
    assert!(collector.is_empty());

    assert!(matches!(handle.shutdown().await, Err(SchedulerError::ShutdownTimedOut(_))));
    let pending = collector.snapshot();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|r| r.source() == "orders" && !r.is_persisted()));
    assert!(storage.inner.is_empty());
}
