use crate::collector::Collector;
use crate::record::Record;
use crate::storage::{LogStorage, StorageError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error returned by [`FlushHandler::process`].
#[derive(thiserror::Error, Debug)]
pub enum FlushError {
    /// No session could be opened; nothing was drained.
    #[error("failed to open storage session: {0}")]
    Session(#[source] StorageError),

    /// The commit failed or timed out. `restored` records went back to the
    /// collector for the next cycle.
    #[error("storage commit failed ({restored} records restored): {source}")]
    Commit {
        #[source]
        source: StorageError,
        restored: usize,
    },
}

/// Moves everything pending in the [`Collector`] into storage in one batch.
///
/// Callers must not run `process` concurrently; the scheduler serializes it.
pub struct FlushHandler {
    collector: Arc<Collector>,
    storage: Arc<dyn LogStorage>,
    commit_timeout: Duration,
}

impl FlushHandler {
    pub fn new(collector: Arc<Collector>, storage: Arc<dyn LogStorage>, commit_timeout: Duration) -> Self {
        FlushHandler {
            collector,
            storage,
            commit_timeout,
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn commit_timeout(&self) -> Duration {
        self.commit_timeout
    }

    /// Run one flush cycle.
    ///
    /// Drains the collector, stages the batch, commits it, then re-enqueues
    /// every record still lacking an identity. This happens whether the
    /// commit succeeded, failed or hit `commit_timeout`, so a failed cycle
    /// loses nothing (a partially applied commit may be persisted twice).
    ///
    /// **Returns**
    /// - `Ok(count)`: records the storage reports as committed; `0` when the
    ///   collector was empty.
    /// - `Err(FlushError)`: the cycle failed; see the variant for what was
    ///   restored.
    pub async fn process(&self) -> Result<usize, FlushError> {
        self.process_until(std::future::pending()).await
    }

    /// Like [`FlushHandler::process`], but gives up as soon as `cancel`
    /// completes. A cancelled commit is treated like a timed-out one: the
    /// staged batch goes back to the collector.
    pub async fn process_until<C>(&self, cancel: C) -> Result<usize, FlushError>
    where
        C: Future<Output = ()>,
    {
        if self.collector.is_empty() {
            return Ok(0);
        }
        tokio::pin!(cancel);

        let mut session = tokio::select! {
            opened = self.storage.open_session() => opened.map_err(FlushError::Session)?,
            _ = &mut cancel => return Err(FlushError::Session(StorageError::Cancelled)),
        };

        let batch = self.collector.drain();
        let drained = batch.len();
        if drained == 0 {
            return Ok(0);
        }
        session.add_batch(batch);

        let outcome = tokio::select! {
            committed = tokio::time::timeout(self.commit_timeout, session.commit()) => match committed {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout(self.commit_timeout)),
            },
            _ = &mut cancel => Err(StorageError::Cancelled),
        };

        let restored = self.restore_uncommitted(session.take_staged());
        debug!(drained, restored, "flush cycle finished");

        match outcome {
            Ok(count) => Ok(count),
            Err(source) => Err(FlushError::Commit { source, restored }),
        }
    }

    fn restore_uncommitted(&self, staged: Vec<Record>) -> usize {
        let mut restored = 0;
        for record in staged.into_iter().filter(|r| !r.is_persisted()) {
            self.collector.enqueue(record);
            restored += 1;
        }
        restored
    }
}
