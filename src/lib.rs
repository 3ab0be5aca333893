pub mod record;
pub mod collector;
pub mod scope;
pub mod emitter;
pub mod provider;
pub mod options;
pub mod env;

pub mod storage;
pub mod memory_storage;
#[cfg(feature = "clickhouse")]
pub mod clickhouse;
pub mod backend;

pub mod flush;
pub mod scheduler;
pub mod layer;
pub mod init;
