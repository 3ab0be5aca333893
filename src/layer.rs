use crate::emitter::ErrorRef;
use crate::provider::SinkProvider;
use crate::record::Level;
use crate::scope::ScopeGuard;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// `tracing_subscriber` layer that turns `tracing` events into emitter log
/// calls, so they are buffered in the shared collector and flushed to
/// storage by the scheduler.
///
/// The event target selects the emitter (one per source). Entered spans are
/// pushed onto the provider's scope stack, which makes span names show up
/// in the record scope when `include_scopes` is on. Nothing here touches
/// storage; application threads only pay for filtering and one enqueue.
pub struct CollectorLayer {
    provider: Arc<SinkProvider>,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully enqueued into the collector.
    pub enqueued_events: Arc<AtomicU64>,
    /// Rejected by the level filter.
    pub filtered_events: Arc<AtomicU64>,
    /// Dropped because the emitter was already disposed.
    pub dropped_events: Arc<AtomicU64>,
}

impl CollectorLayer {
    pub fn new(provider: Arc<SinkProvider>) -> Self {
        CollectorLayer {
            provider,
            total_events: Arc::new(AtomicU64::new(0)),
            enqueued_events: Arc::new(AtomicU64::new(0)),
            filtered_events: Arc::new(AtomicU64::new(0)),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn provider(&self) -> &Arc<SinkProvider> {
        &self.provider
    }
}

/// Target prefix of the pipeline's own diagnostics. Those events reach the
/// other layers (stdout) but never the collector.
const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

fn is_own_diagnostic(target: &str) -> bool {
    target
        .strip_prefix(OWN_TARGET)
        .map_or(false, |rest| rest.is_empty() || rest.starts_with("::"))
}

/// Scope guards for each active entry of a span (spans may be re-entered).
struct EnteredScopes(Vec<ScopeGuard>);

/// Error text carried by an `error`/`exception` event field.
#[derive(Debug)]
struct EventError(String);

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for EventError {}

impl<S> Layer<S> for CollectorLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, _attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(EnteredScopes(Vec::new()));
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let guard = self.provider.scope_provider().push(span.name().to_string());
            let mut extensions = span.extensions_mut();
            match extensions.get_mut::<EnteredScopes>() {
                Some(entered) => entered.0.push(guard),
                None => extensions.insert(EnteredScopes(vec![guard])),
            }
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let guard = span
                .extensions_mut()
                .get_mut::<EnteredScopes>()
                .and_then(|entered| entered.0.pop());
            drop(guard);
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if is_own_diagnostic(meta.target()) {
            return;
        }
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let level = Level::from(*meta.level());
        let emitter = self.provider.emitter(meta.target());
        if !emitter.is_enabled(level) {
            self.filtered_events.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let event_id = visitor.event_id;
        let error = visitor.exception.take().map(EventError);
        let error: ErrorRef<'_> = error.as_ref().map(|e| e as &(dyn Error + 'static));

        match emitter.log(level, event_id, visitor, error, Some(render_event)) {
            Ok(()) => {
                self.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Render the `message` field followed by the remaining fields as
/// `key=value` pairs.
fn render_event(visitor: &FieldVisitor, _error: ErrorRef<'_>) -> String {
    let mut out = visitor.message.clone().unwrap_or_default();
    for (key, value) in &visitor.fields {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(key);
        out.push('=');
        match value {
            serde_json::Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    out
}

use tracing::field::{Field, Visit};

/// Collects event fields; `message`, `event_id` and `error`/`exception` are
/// pulled out of the generic field map.
#[derive(Default)]
pub struct FieldVisitor {
    pub fields: BTreeMap<String, serde_json::Value>,
    pub message: Option<String>,
    pub event_id: i32,
    pub exception: Option<String>,
}

impl FieldVisitor {
    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "error" | "exception" => self.exception = Some(value),
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        self.record_text(field, crate::emitter::render_error(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "event_id" {
            if let Ok(id) = i32::try_from(value) {
                self.event_id = id;
                return;
            }
        }
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "event_id" {
            if let Ok(id) = i32::try_from(value) {
                self.event_id = id;
                return;
            }
        }
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_text(field, format!("{:?}", value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::options::{OptionsMonitor, SinkOptions};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    fn layer(include_scopes: bool) -> (CollectorLayer, Arc<Collector>) {
        let options = SinkOptions { include_scopes, ..Default::default() };
        let monitor = Arc::new(OptionsMonitor::new(options).unwrap());
        let collector = Arc::new(Collector::new());
        let provider = Arc::new(SinkProvider::new(Arc::clone(&collector), monitor, None));
        (CollectorLayer::new(provider), collector)
    }

    #[test]
    fn events_become_records() {
        let (layer, collector) = layer(false);
        let total = Arc::clone(&layer.total_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "billing", event_id = 17, order = "A-1", "charge declined");
        });

        assert_eq!(total.load(Ordering::Relaxed), 1);
        let record = collector.try_dequeue().unwrap();
        assert_eq!(record.source(), "billing");
        assert_eq!(record.level(), Level::Warning);
        assert_eq!(record.event_id(), 17);
        assert_eq!(record.message(), "charge declined order=A-1");
        assert_eq!(record.scope(), None);
    }

    #[test]
    fn spans_become_scopes() {
        let (layer, collector) = layer(true);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let request = tracing::info_span!("request");
            let _r = request.enter();
            let db = tracing::info_span!("db");
            let _d = db.enter();
            tracing::error!(error = "timeout", "query failed");
        });

        let record = collector.try_dequeue().unwrap();
        assert_eq!(record.scope(), Some("request.db"));
        assert_eq!(record.exception_text(), Some("timeout"));
        assert_eq!(record.message(), "query failed");
    }

    #[test]
    fn own_diagnostics_are_not_collected() {
        let (layer, collector) = layer(false);
        let total = Arc::clone(&layer.total_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "buffered_log_sink::scheduler", "log flush cycle failed");
            tracing::debug!(target: "buffered_log_sink", "initialized");
            tracing::info!(target: "buffered_log_sink_client", "kept");
        });

        assert_eq!(total.load(Ordering::Relaxed), 1);
        assert_eq!(collector.len(), 1);
        assert_eq!(collector.try_dequeue().unwrap().source(), "buffered_log_sink_client");
    }

    #[test]
    fn filtered_events_are_counted_not_queued() {
        let (layer, collector) = layer(false);
        layer.provider().set_filter(crate::emitter::Filter::min_level(Level::Error));
        let filtered = Arc::clone(&layer.filtered_events);
        let subscriber = Registry::default().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("ignored");
            tracing::error!("kept");
        });

        assert_eq!(filtered.load(Ordering::Relaxed), 1);
        assert_eq!(collector.len(), 1);
    }
}
