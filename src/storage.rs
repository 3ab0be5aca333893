use crate::record::Record;
use async_trait::async_trait;
use std::error::Error;
use std::time::Duration;

/// Error returned by storage backends.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage commit timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage operation cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] Box<dyn Error + Send + Sync>),
}

/// Durable destination for [`Record`]s drained by the flush handler.
///
/// Implementations hand out one [`StorageSession`] per flush cycle, the way a
/// unit of work is opened per request against a database.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Open a session for one flush cycle.
    ///
    /// **Returns**
    /// - `Ok(session)` ready to stage records.
    /// - `Err(..)` when the backend cannot be reached at all; no records
    ///   have been handed over yet.
    async fn open_session(&self) -> Result<Box<dyn StorageSession>, StorageError>;
}

/// Unit of work against a [`LogStorage`].
#[async_trait]
pub trait StorageSession: Send {
    /// Stage records for the next commit. The session owns them until
    /// [`StorageSession::take_staged`] is called.
    fn add_batch(&mut self, records: Vec<Record>);

    /// Durably persist the staged records.
    ///
    /// **Returns**
    /// - `Ok(count)`: the number of records committed. Every committed record
    ///   must have had its identity assigned via [`Record::assign_identity`].
    ///   Records left without an identity are treated as not committed.
    /// - `Err(..)`: the commit failed; records without an identity are
    ///   retried on the next cycle.
    async fn commit(&mut self) -> Result<usize, StorageError>;

    /// Hand the staged records back, with identities set on those that were
    /// committed. Must be callable after a failed or abandoned commit.
    fn take_staged(&mut self) -> Vec<Record>;
}
