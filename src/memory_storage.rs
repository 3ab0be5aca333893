use crate::record::{Record, RecordId};
use crate::storage::{LogStorage, StorageError, StorageSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Storage that keeps committed records in process memory.
///
/// Useful for tests, demos and measuring the overhead of the pipeline
/// itself without any external I/O. Identities are assigned sequentially
/// starting at 1.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    committed: Mutex<Vec<Record>>,
    next_id: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every committed record, in commit order.
    pub fn records(&self) -> Vec<Record> {
        self.inner.committed.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.committed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogStorage for MemoryStorage {
    async fn open_session(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    staged: Vec<Record>,
}

#[async_trait]
impl StorageSession for MemorySession {
    fn add_batch(&mut self, records: Vec<Record>) {
        self.staged.extend(records);
    }

    async fn commit(&mut self) -> Result<usize, StorageError> {
        let mut committed = self.inner.committed.lock();
        let mut count = 0;
        for record in self.staged.iter_mut().filter(|r| !r.is_persisted()) {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            record.assign_identity(RecordId(id));
            committed.push(record.clone());
            count += 1;
        }
        Ok(count)
    }

    fn take_staged(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.staged)
    }
}
