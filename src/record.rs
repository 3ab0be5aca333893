use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length (in characters) of [`Record::source`].
pub const MAX_SOURCE_LEN: usize = 256;
/// Maximum length (in characters) of [`Record::message`].
pub const MAX_MESSAGE_LEN: usize = 4000;
/// Maximum length (in characters) of [`Record::scope`].
pub const MAX_SCOPE_LEN: usize = 512;
/// Exception text is truncated to this many characters on construction.
pub const MAX_EXCEPTION_LEN: usize = 20480;

/// Severity of a log event, ordered from least to most severe.
///
/// `None` is never logged itself; as a threshold it disables everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
    None,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "Trace",
            Level::Debug => "Debug",
            Level::Information => "Information",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Critical => "Critical",
            Level::None => "None",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown log level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "information" | "info" => Ok(Level::Information),
            "warning" | "warn" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" | "fatal" => Ok(Level::Critical),
            "none" | "off" => Ok(Level::None),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Information,
            tracing::Level::WARN => Level::Warning,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Storage-assigned key of a durably committed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One log event, pending in the collector or persisted by storage.
///
/// Everything except [`Record::identity`] is fixed at construction. A record
/// whose identity is still unset after a flush has not been durably committed
/// and goes back to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    identity: Option<RecordId>,
    timestamp: DateTime<Utc>,
    source: String,
    message: String,
    level: Level,
    event_id: i32,
    scope: Option<String>,
    exception_text: Option<String>,
}

impl Record {
    pub fn new(source: impl Into<String>, level: Level, event_id: i32, message: impl Into<String>) -> Self {
        Record {
            identity: None,
            timestamp: Utc::now(),
            source: source.into(),
            message: message.into(),
            level,
            event_id,
            scope: None,
            exception_text: None,
        }
    }

    /// Attach a scope string; blank values are normalized to unset.
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope.filter(|s| !s.trim().is_empty());
        self
    }

    /// Attach exception text, truncated to [`MAX_EXCEPTION_LEN`] characters.
    pub fn with_exception(mut self, text: Option<String>) -> Self {
        self.exception_text = text
            .filter(|s| !s.trim().is_empty())
            .map(|s| truncate_chars(&s, MAX_EXCEPTION_LEN).to_string());
        self
    }

    pub fn identity(&self) -> Option<RecordId> {
        self.identity
    }

    pub fn is_persisted(&self) -> bool {
        self.identity.is_some()
    }

    /// Called by storage implementations once the record is committed.
    pub fn assign_identity(&mut self, id: RecordId) {
        self.identity = Some(id);
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn event_id(&self) -> i32 {
        self.event_id
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn exception_text(&self) -> Option<&str> {
        self.exception_text.as_deref()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.identity.map(|id| id.0).unwrap_or(0);
        write!(
            f,
            "[{}] {}: timestamp: '{}', source: '{}', ",
            id,
            self.level,
            self.timestamp.to_rfc3339(),
            self.source
        )?;
        if let Some(scope) = &self.scope {
            write!(f, "scope: '{}', ", scope)?;
        }
        write!(
            f,
            "message: '{}', event_id: '{}', exception: '{}'",
            self.message,
            self.event_id,
            self.exception_text.as_deref().unwrap_or("<null>")
        )
    }
}

/// Cut `value` down to at most `max` characters on a char boundary.
pub fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
