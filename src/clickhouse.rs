use crate::record::{
    truncate_chars, Record, RecordId, MAX_EXCEPTION_LEN, MAX_MESSAGE_LEN, MAX_SCOPE_LEN, MAX_SOURCE_LEN,
};
use crate::storage::{LogStorage, StorageError, StorageSession};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Configuration for [`ClickHouseStorage`].
///
/// The storage talks to ClickHouse over HTTP using the `JSONEachRow` format
/// and writes one row per record into `database.table`.
#[derive(Clone, Debug)]
pub struct ClickHouseConfig {
    /// Base URL without query, e.g. "http://127.0.0.1:8123"
    pub url: String,
    pub database: String,
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ClickHouseConfig {
    /// Parse `clickhouse://[user[:password]@]host[:port][/database[/table]]`.
    /// Database defaults to `default`, table to `logs`.
    pub fn from_dsn(dsn: &str) -> Self {
        let rest = dsn
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(dsn);

        let (auth, rest) = match rest.rsplit_once('@') {
            Some((auth, rest)) => (Some(auth), rest),
            None => (None, rest),
        };
        let (user, password) = match auth {
            Some(auth) => match auth.split_once(':') {
                Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                None => (Some(auth.to_string()), None),
            },
            None => (None, None),
        };

        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let host = parts.next().unwrap_or("127.0.0.1:8123");
        let database = parts.next().unwrap_or("default").to_string();
        let table = parts.next().unwrap_or("logs").to_string();

        ClickHouseConfig {
            url: format!("http://{}", host),
            database,
            table,
            user,
            password,
        }
    }
}

/// ClickHouse implementation of [`LogStorage`] using the HTTP interface.
///
/// ClickHouse does not hand back generated keys, so identities are
/// generated client-side and written in the `id` column. A batch insert is
/// atomic from the client's point of view: either every row gets an
/// identity or none does.
#[derive(Clone)]
pub struct ClickHouseStorage {
    client: Client,
    config: Arc<ClickHouseConfig>,
    next_id: Arc<AtomicU64>,
}

impl ClickHouseStorage {
    /// Construct a new storage instance using the provided configuration.
    ///
    /// **Parameters**
    /// - `config`: [`ClickHouseConfig`] describing target URL, database,
    ///   table and optional authentication settings.
    pub fn new(config: ClickHouseConfig) -> Self {
        // Seed from the clock so restarts do not reuse identities.
        let seed = Utc::now().timestamp_micros().max(0) as u64;
        ClickHouseStorage {
            client: Client::new(),
            config: Arc::new(config),
            next_id: Arc::new(AtomicU64::new(seed)),
        }
    }

    fn auth_query(&self) -> String {
        let mut query = String::new();
        if let Some(user) = &self.config.user {
            query.push_str(&format!("&user={}", urlencoding::encode(user)));
        }
        if let Some(password) = &self.config.password {
            query.push_str(&format!("&password={}", urlencoding::encode(password)));
        }
        query
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/?database={}&query=INSERT%20INTO%20{}%20FORMAT%20JSONEachRow{}",
            self.config.url,
            self.config.database,
            self.config.table,
            self.auth_query()
        )
    }

    /// Validate that the target ClickHouse table exists. This is optional
    /// and is not called automatically.
    ///
    /// **Returns**
    /// - `Ok(())` if the `DESCRIBE TABLE` query succeeded.
    /// - `Err(..)` if ClickHouse responded with a non-success status.
    pub async fn validate_schema(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let query = format!(
            "query={}{}",
            urlencoding::encode(&format!(
                "DESCRIBE TABLE {}.{} FORMAT JSON",
                self.config.database, self.config.table
            )),
            self.auth_query()
        );

        let url = format!("{}/?{}", self.config.url, query);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(format!("ClickHouse schema validation failed with status {}", resp.status()).into());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ClickHouseRow<'a> {
    id: u64,
    timestamp: String,
    source: &'a str,
    level: &'static str,
    event_id: i32,
    message: &'a str,
    scope: Option<&'a str>,
    exception: Option<&'a str>,
}

fn map_record(id: u64, record: &Record) -> ClickHouseRow<'_> {
    ClickHouseRow {
        id,
        timestamp: record.timestamp().to_rfc3339(),
        source: truncate_chars(record.source(), MAX_SOURCE_LEN),
        level: record.level().as_str(),
        event_id: record.event_id(),
        message: truncate_chars(record.message(), MAX_MESSAGE_LEN),
        scope: record.scope().map(|s| truncate_chars(s, MAX_SCOPE_LEN)),
        exception: record.exception_text().map(|s| truncate_chars(s, MAX_EXCEPTION_LEN)),
    }
}

#[async_trait]
impl LogStorage for ClickHouseStorage {
    async fn open_session(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        Ok(Box::new(ClickHouseSession {
            storage: self.clone(),
            staged: Vec::new(),
        }))
    }
}

struct ClickHouseSession {
    storage: ClickHouseStorage,
    staged: Vec<Record>,
}

#[async_trait]
impl StorageSession for ClickHouseSession {
    fn add_batch(&mut self, records: Vec<Record>) {
        self.staged.extend(records);
    }

    async fn commit(&mut self) -> Result<usize, StorageError> {
        let pending: Vec<usize> = (0..self.staged.len())
            .filter(|&i| !self.staged[i].is_persisted())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let first = self.storage.next_id.fetch_add(pending.len() as u64, Ordering::Relaxed);
        let mut body = String::new();
        for (offset, &idx) in pending.iter().enumerate() {
            let row = map_record(first + offset as u64, &self.staged[idx]);
            body.push_str(&serde_json::to_string(&row).map_err(|e| StorageError::Backend(Box::new(e)))?);
            body.push('\n');
        }

        let resp = self
            .storage
            .client
            .post(self.storage.endpoint())
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(StorageError::Backend(
                format!("ClickHouse insert failed with status {}: {}", status, text).into(),
            ));
        }

        for (offset, &idx) in pending.iter().enumerate() {
            self.staged[idx].assign_identity(RecordId(first + offset as u64));
        }
        Ok(pending.len())
    }

    fn take_staged(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.staged)
    }
}
