use crate::collector::Collector;
use crate::options::SinkOptions;
use crate::record::{Level, Record};
use crate::scope::{collect_scopes, ScopeGuard, ScopeProvider};
use arc_swap::ArcSwap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Borrowed error accompanying a log call.
pub type ErrorRef<'a> = Option<&'a (dyn Error + 'static)>;

/// Predicate deciding whether `(source, level)` is logged.
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&str, Level) -> bool + Send + Sync>);

impl Filter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, Level) -> bool + Send + Sync + 'static,
    {
        Filter(Arc::new(f))
    }

    pub fn allow_all() -> Self {
        Filter::new(|_, _| true)
    }

    /// Accept `level` and everything more severe, for every source.
    pub fn min_level(min: Level) -> Self {
        Filter::new(move |_, level| level >= min)
    }

    pub fn matches(&self, source: &str, level: Level) -> bool {
        (self.0)(source, level)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::allow_all()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}

/// Error reported synchronously to the caller of [`Emitter::log`]. The log
/// call has no effect when it fails.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("emitter for source {name:?} has been disposed")]
    Disposed { name: String },

    #[error("log call requires a formatter")]
    MissingFormatter,
}

/// Per-source entry point: filters by level, renders the message, captures
/// scopes and hands the resulting [`Record`] to the shared [`Collector`].
pub struct Emitter {
    name: String,
    collector: Arc<Collector>,
    filter: ArcSwap<Filter>,
    scope_provider: Option<Arc<dyn ScopeProvider>>,
    include_scopes: AtomicBool,
    disposed: AtomicBool,
}

impl Emitter {
    pub fn new(
        name: impl Into<String>,
        collector: Arc<Collector>,
        options: &SinkOptions,
        scope_provider: Option<Arc<dyn ScopeProvider>>,
        filter: Filter,
    ) -> Self {
        Emitter {
            name: name.into(),
            collector,
            filter: ArcSwap::from_pointee(filter),
            scope_provider,
            include_scopes: AtomicBool::new(options.include_scopes),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> Filter {
        Filter::clone(&self.filter.load())
    }

    pub fn set_filter(&self, filter: Filter) {
        self.filter.store(Arc::new(filter));
    }

    /// Apply reloaded options. Safe to call while other threads log; an
    /// in-flight call observes either the old or the new flag.
    pub fn load_options(&self, options: &SinkOptions) {
        self.include_scopes.store(options.include_scopes, Ordering::Release);
    }

    pub fn includes_scopes(&self) -> bool {
        self.include_scopes.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self, level: Level) -> bool {
        level != Level::None && self.filter.load().matches(&self.name, level)
    }

    /// Log an event.
    ///
    /// **Parameters**
    /// - `level`, `event_id`: severity and caller-defined event code.
    /// - `state`: value handed to `formatter`.
    /// - `error`: optional error whose chain becomes the exception text.
    /// - `formatter`: renders `state` and `error` into the message. It is
    ///   never invoked for disabled levels.
    ///
    /// **Returns**
    /// - `Ok(())` once the record is queued, or immediately when `level` is
    ///   disabled.
    /// - `Err(LogError::Disposed)` after [`Emitter::dispose`].
    /// - `Err(LogError::MissingFormatter)` when `formatter` is `None`.
    pub fn log<S, F>(
        &self,
        level: Level,
        event_id: i32,
        state: S,
        error: ErrorRef<'_>,
        formatter: Option<F>,
    ) -> Result<(), LogError>
    where
        F: FnOnce(&S, ErrorRef<'_>) -> String,
    {
        self.check_disposed()?;
        let formatter = formatter.ok_or(LogError::MissingFormatter)?;
        if !self.is_enabled(level) {
            return Ok(());
        }

        let message = formatter(&state, error);
        let record = Record::new(self.name.as_str(), level, event_id, message)
            .with_scope(self.scope_information())
            .with_exception(error.map(render_error));
        self.collector.enqueue(record);
        Ok(())
    }

    /// Shorthand for logging a preformatted message.
    pub fn log_message(&self, level: Level, message: impl Into<String>) -> Result<(), LogError> {
        self.log(level, 0, message.into(), None, Some(|m: &String, _: ErrorRef<'_>| m.clone()))
    }

    /// Open a nested scope. Without a scope provider the guard is a no-op.
    pub fn begin_scope(&self, state: impl fmt::Display) -> ScopeGuard {
        match &self.scope_provider {
            Some(provider) => provider.push(state.to_string()),
            None => ScopeGuard::noop(),
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn check_disposed(&self) -> Result<(), LogError> {
        if self.is_disposed() {
            Err(LogError::Disposed { name: self.name.clone() })
        } else {
            Ok(())
        }
    }

    fn scope_information(&self) -> Option<String> {
        if !self.includes_scopes() {
            return None;
        }
        self.scope_provider.as_deref().and_then(|provider| collect_scopes(provider))
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("name", &self.name)
            .field("include_scopes", &self.includes_scopes())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Render an error and its `source()` chain.
pub fn render_error(error: &(dyn Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut cause = error.source();
    while let Some(err) = cause {
        text.push_str("\ncaused by: ");
        text.push_str(&err.to_string());
        cause = err.source();
    }
    text
}
