use crate::record::Record;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const DEFAULT_SHARDS: usize = 16;

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| match hint.get() {
        Some(h) => h,
        None => {
            let h = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        }
    })
}

type Shard = CachePadded<Mutex<VecDeque<(u64, Record)>>>;

/// Unbounded, concurrency-safe buffer of pending [`Record`]s.
///
/// Producers are spread over independently locked shards (one shard per
/// thread), so unrelated log calls never contend on a single lock. Every
/// insert takes a sequence number under its shard lock and
/// [`Collector::try_dequeue`] always pops the lowest head, which keeps each
/// producer's records in FIFO order.
pub struct Collector {
    shards: Box<[Shard]>,
    sequence: AtomicU64,
    len: AtomicUsize,
}

impl Collector {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| CachePadded::new(Mutex::new(VecDeque::new())))
            .collect();
        Collector {
            shards,
            sequence: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Append a record to the tail of the calling thread's shard.
    pub fn enqueue(&self, record: Record) {
        let shard = &self.shards[shard_hint() % self.shards.len()];
        let mut queue = shard.lock();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        queue.push_back((seq, record));
        // Counted under the shard lock so a consumer never subtracts first.
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Remove the oldest pending record, if any. Never blocks on producers
    /// for longer than one shard's critical section.
    pub fn try_dequeue(&self) -> Option<Record> {
        loop {
            let mut best: Option<(usize, u64)> = None;
            for (idx, shard) in self.shards.iter().enumerate() {
                if let Some((seq, _)) = shard.lock().front() {
                    if best.map_or(true, |(_, b)| *seq < b) {
                        best = Some((idx, *seq));
                    }
                }
            }

            let (idx, seq) = best?;
            let mut queue = self.shards[idx].lock();
            // The head can only change under a competing consumer; rescan then.
            if queue.front().map(|(s, _)| *s) == Some(seq) {
                let (_, record) = queue.pop_front()?;
                drop(queue);
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Some(record);
            }
        }
    }

    /// Point-in-time emptiness check; may race with concurrent enqueues.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Take everything pending, in dequeue order. Each shard is locked once.
    pub fn drain(&self) -> Vec<Record> {
        let mut pending: Vec<(u64, Record)> = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let mut queue = shard.lock();
            self.len.fetch_sub(queue.len(), Ordering::AcqRel);
            pending.extend(queue.drain(..));
        }
        pending.sort_unstable_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, record)| record).collect()
    }

    /// Read-only copy of the pending records in dequeue order.
    pub fn snapshot(&self) -> Vec<Record> {
        let mut pending: Vec<(u64, Record)> = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            pending.extend(shard.lock().iter().cloned());
        }
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, record)| record).collect()
    }

    /// Human-readable lines for each pending record.
    pub fn describe(&self) -> Vec<String> {
        self.snapshot().iter().map(|r| r.to_string()).collect()
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}
