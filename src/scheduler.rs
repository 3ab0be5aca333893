use crate::flush::{FlushError, FlushHandler};
use crate::options::{OptionsMonitor, SinkOptions, SyncInterval};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Error returned by [`FlushScheduler`] lifecycle calls.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler already stopped")]
    AlreadyStopped,

    #[error("scheduler must be started inside a tokio runtime")]
    NoRuntime,

    #[error("flush worker did not finish within {0:?}")]
    ShutdownTimedOut(Duration),

    #[error(transparent)]
    Flush(#[from] FlushError),
}

/// Counters accumulated over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Flush cycles executed (ticks that were coalesced are not counted).
    pub executions: u64,
    /// Records reported committed across all cycles.
    pub processed: u64,
    /// Cycles that ended in an error.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    processed: AtomicU64,
    failures: AtomicU64,
}

enum State {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Shared between the scheduler handle and its worker task.
struct Cycle {
    handler: Arc<FlushHandler>,
    /// Single slot: at most one flush cycle runs at any time.
    slot: tokio::sync::Mutex<()>,
    counters: Counters,
    /// Period (seconds) of the timer currently in use.
    period_secs: AtomicU64,
    /// Set once shutdown gives up on the in-flight cycle.
    cancel: watch::Sender<bool>,
}

impl Cycle {
    /// Run a cycle unless one is already in flight.
    async fn try_run(&self) -> Option<Result<usize, FlushError>> {
        let Ok(_slot) = self.slot.try_lock() else {
            debug!("flush cycle already in flight, coalescing tick");
            return None;
        };
        Some(self.run_locked().await)
    }

    async fn run_locked(&self) -> Result<usize, FlushError> {
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        match self.handler.process_until(cancelled(self.cancel.subscribe())).await {
            Ok(count) => {
                self.counters.processed.fetch_add(count as u64, Ordering::Relaxed);
                if count > 0 {
                    debug!(count, "flushed log records");
                }
                Ok(count)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "log flush cycle failed");
                Err(e)
            }
        }
    }
}

/// Resolves once the cancel flag is raised (or its sender is gone).
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Drives the [`FlushHandler`] on a repeating timer.
///
/// `start` flushes immediately and then every `sync_interval`;
/// `reconfigure` (or an options reload carrying a new interval) resets the
/// timer so the next tick fires immediately; `stop` cancels the timer, waits
/// for any in-flight cycle and runs one final flush. A stopped scheduler
/// cannot be restarted.
pub struct FlushScheduler {
    cycle: Arc<Cycle>,
    monitor: Arc<OptionsMonitor>,
    interval_tx: watch::Sender<SyncInterval>,
    shutdown_tx: watch::Sender<bool>,
    state: Mutex<State>,
}

impl FlushScheduler {
    pub fn new(handler: Arc<FlushHandler>, monitor: Arc<OptionsMonitor>) -> Self {
        let (interval_tx, _) = watch::channel(monitor.current().sync_interval);
        let (shutdown_tx, _) = watch::channel(false);
        let (cancel, _) = watch::channel(false);
        FlushScheduler {
            cycle: Arc::new(Cycle {
                handler,
                slot: tokio::sync::Mutex::new(()),
                counters: Counters::default(),
                period_secs: AtomicU64::new(monitor.current().sync_interval.secs()),
                cancel,
            }),
            monitor,
            interval_tx,
            shutdown_tx,
            state: Mutex::new(State::Idle),
        }
    }

    /// Spawn the flush worker. The first cycle runs immediately.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        match *state {
            State::Idle => {}
            State::Running(_) => return Err(SchedulerError::AlreadyStarted),
            State::Stopped => return Err(SchedulerError::AlreadyStopped),
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let period = *self.interval_tx.borrow();
        info!(interval_secs = period.secs(), "log flush scheduler starting");

        let worker = Worker {
            cycle: Arc::clone(&self.cycle),
            interval_rx: self.interval_tx.subscribe(),
            options_rx: self.monitor.subscribe(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        *state = State::Running(runtime.spawn(worker.run()));
        Ok(())
    }

    /// Change the flush period. The next tick fires immediately; an
    /// in-flight cycle is never duplicated.
    pub fn reconfigure(&self, interval: SyncInterval) {
        warn!(interval_secs = interval.secs(), "log flush scheduler reconfiguring interval");
        self.interval_tx.send_replace(interval);
    }

    /// Period of the timer in use, after any reconfiguration or reload the
    /// worker has applied.
    pub fn interval(&self) -> SyncInterval {
        SyncInterval::new(self.cycle.period_secs.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running(_))
    }

    /// Run a flush cycle now, unless one is in flight.
    ///
    /// **Returns**
    /// - `Ok(Some(count))` after a cycle ran.
    /// - `Ok(None)` when the call was coalesced with a running cycle.
    pub async fn trigger(&self) -> Result<Option<usize>, FlushError> {
        self.cycle.try_run().await.transpose()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.cycle.counters;
        SchedulerStats {
            executions: c.executions.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Stop ticking and flush whatever is still pending.
    ///
    /// Waits at most `shutdown_timeout` for the worker's in-flight cycle and
    /// for the flush slot. When that deadline passes the in-flight cycle is
    /// cancelled; its batch goes back to the collector and no final flush is
    /// attempted. Otherwise the final cycle runs, bounded by the flush
    /// handler's commit timeout.
    ///
    /// **Returns**
    /// - `Ok(count)`: records committed by the final cycle.
    /// - `Err(SchedulerError::Flush)`: the final cycle failed; uncommitted
    ///   records remain in the collector.
    /// - `Err(SchedulerError::ShutdownTimedOut)`: the in-flight cycle was
    ///   cancelled; its records remain in the collector.
    pub async fn stop(&self) -> Result<usize, SchedulerError> {
        let mut handle = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running(handle) => handle,
                State::Idle => {
                    *state = State::Idle;
                    return Err(SchedulerError::NotRunning);
                }
                State::Stopped => return Err(SchedulerError::AlreadyStopped),
            }
        };

        let deadline = self.monitor.current().shutdown_timeout;
        let started = Instant::now();
        self.shutdown_tx.send_replace(true);

        let slot = match tokio::time::timeout(deadline, &mut handle).await {
            Ok(_) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                tokio::time::timeout(remaining, self.cycle.slot.lock()).await.ok()
            }
            Err(_) => None,
        };

        let Some(slot) = slot else {
            error!(?deadline, "log flush cycle still running at shutdown deadline, cancelling it");
            self.cycle.cancel.send_replace(true);
            // The cancelled cycle restores its batch before releasing the slot.
            drop(self.cycle.slot.lock().await);
            if !handle.is_finished() {
                let _ = handle.await;
            }
            self.log_stopped();
            return Err(SchedulerError::ShutdownTimedOut(deadline));
        };

        let result = self.cycle.run_locked().await;
        drop(slot);
        self.log_stopped();
        Ok(result?)
    }

    fn log_stopped(&self) {
        let stats = self.stats();
        info!(
            processed = stats.processed,
            executions = stats.executions,
            failures = stats.failures,
            pending = self.cycle.handler.collector().len(),
            "log flush scheduler stopped: {} logs were processed in {} executions",
            stats.processed,
            stats.executions
        );
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        if let State::Running(handle) = std::mem::replace(&mut *self.state.lock(), State::Stopped) {
            warn!("log flush scheduler dropped while running; pending records were not flushed");
            handle.abort();
        }
    }
}

struct Worker {
    cycle: Arc<Cycle>,
    interval_rx: watch::Receiver<SyncInterval>,
    options_rx: watch::Receiver<Arc<SinkOptions>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    fn new_ticker(&self, period: SyncInterval) -> Interval {
        self.cycle.period_secs.store(period.secs(), Ordering::Relaxed);
        let mut ticker = interval(period.as_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn run(mut self) {
        let mut period = *self.interval_rx.borrow_and_update();
        let mut configured = self.options_rx.borrow_and_update().sync_interval;
        let mut ticker = self.new_ticker(period);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                changed = self.interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    period = *self.interval_rx.borrow_and_update();
                    ticker = self.new_ticker(period);
                }
                changed = self.options_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reloaded = self.options_rx.borrow_and_update().sync_interval;
                    // Only a changed interval resets the timer; other option
                    // reloads leave a manual `reconfigure` in place.
                    if reloaded != configured {
                        configured = reloaded;
                        warn!(
                            interval_secs = reloaded.secs(),
                            "log flush scheduler reloading configuration, interval changing"
                        );
                        period = reloaded;
                        ticker = self.new_ticker(period);
                    }
                }
                _ = ticker.tick() => {
                    // Errors are reported inside; the timer keeps going.
                    let _ = self.cycle.try_run().await;
                }
            }
        }
        debug!("log flush worker exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::memory_storage::MemoryStorage;
    use crate::record::{Level, Record};
    use crate::storage::{LogStorage, StorageError, StorageSession};
    use async_trait::async_trait;

    /// Storage whose commits never complete.
    struct StalledStorage;

    struct StalledSession(Vec<Record>);

    #[async_trait]
    impl LogStorage for StalledStorage {
        async fn open_session(&self) -> Result<Box<dyn StorageSession>, StorageError> {
            Ok(Box::new(StalledSession(Vec::new())))
        }
    }

    #[async_trait]
    impl StorageSession for StalledSession {
        fn add_batch(&mut self, records: Vec<Record>) {
            self.0.extend(records);
        }

        async fn commit(&mut self) -> Result<usize, StorageError> {
            std::future::pending().await
        }

        fn take_staged(&mut self) -> Vec<Record> {
            std::mem::take(&mut self.0)
        }
    }

    fn setup(interval_secs: u64) -> (FlushScheduler, Arc<Collector>, MemoryStorage, Arc<OptionsMonitor>) {
        let options = SinkOptions {
            sync_interval: SyncInterval::new(interval_secs).unwrap(),
            ..Default::default()
        };
        let monitor = Arc::new(OptionsMonitor::new(options).unwrap());
        let collector = Arc::new(Collector::new());
        let storage = MemoryStorage::new();
        let handler = Arc::new(FlushHandler::new(
            Arc::clone(&collector),
            Arc::new(storage.clone()),
            Duration::from_secs(5),
        ));
        let scheduler = FlushScheduler::new(handler, Arc::clone(&monitor));
        (scheduler, collector, storage, monitor)
    }

    fn record(i: usize) -> Record {
        Record::new("test", Level::Information, i as i32, format!("m{i}"))
    }

    #[tokio::test(start_paused = true)]
    async fn start_flushes_immediately_then_on_period() {
        let (scheduler, collector, storage, _) = setup(10);
        collector.enqueue(record(0));
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(storage.len(), 1);

        collector.enqueue(record(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(storage.len(), 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(storage.len(), 2);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_pending_records() {
        let (scheduler, collector, storage, _) = setup(60);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        for i in 0..5 {
            collector.enqueue(record(i));
        }
        assert_eq!(scheduler.stop().await.unwrap(), 5);
        assert!(collector.is_empty());
        assert_eq!(storage.len(), 5);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_fires_next_tick_immediately() {
        let (scheduler, collector, storage, _) = setup(60);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        collector.enqueue(record(0));
        scheduler.reconfigure(SyncInterval::new(2).unwrap());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(storage.len(), 1);
        assert_eq!(scheduler.interval().secs(), 2);

        collector.enqueue(record(1));
        tokio::time::sleep(Duration::from_millis(2001)).await;
        assert_eq!(storage.len(), 2);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn options_reload_changes_interval() {
        let (scheduler, collector, storage, monitor) = setup(60);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        collector.enqueue(record(0));
        monitor
            .update(SinkOptions { sync_interval: SyncInterval::new(3).unwrap(), ..Default::default() })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(storage.len(), 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_stalled_commit_keeps_records() {
        let options = SinkOptions::default();
        assert!(options.commit_timeout > options.shutdown_timeout);
        let collector = Arc::new(Collector::new());
        let handler = Arc::new(FlushHandler::new(
            Arc::clone(&collector),
            Arc::new(StalledStorage),
            options.commit_timeout,
        ));
        let monitor = Arc::new(OptionsMonitor::new(options).unwrap());
        let scheduler = FlushScheduler::new(handler, monitor);

        for i in 0..5 {
            collector.enqueue(record(i));
        }
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(collector.is_empty());

        let started = Instant::now();
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::ShutdownTimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(11));
        let pending = collector.snapshot();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending[0].message(), "m0");
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn lifecycle_is_terminal() {
        let (scheduler, _, _, _) = setup(5);
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStarted)));
        scheduler.stop().await.unwrap();
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStopped)));
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::AlreadyStopped)));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let (scheduler, _, _, _) = setup(5);
        assert!(matches!(scheduler.start(), Err(SchedulerError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_counts_executions() {
        let (scheduler, collector, _, _) = setup(5);
        collector.enqueue(record(0));
        assert_eq!(scheduler.trigger().await.unwrap(), Some(1));
        assert_eq!(
            scheduler.stats(),
            SchedulerStats { executions: 1, processed: 1, failures: 0 }
        );
    }
}
