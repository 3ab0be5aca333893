use crate::collector::Collector;
use crate::emitter::{Emitter, Filter};
use crate::options::{ChangeSubscription, OptionsMonitor};
use crate::scope::{LocalScopeProvider, ScopeProvider};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type EmitterMap = RwLock<HashMap<String, Arc<Emitter>>>;

/// Find-or-create registry of [`Emitter`]s sharing one [`Collector`].
///
/// Every emitter created here receives option reloads published through the
/// [`OptionsMonitor`] it was built with.
pub struct SinkProvider {
    collector: Arc<Collector>,
    monitor: Arc<OptionsMonitor>,
    scope_provider: Arc<dyn ScopeProvider>,
    filter: RwLock<Filter>,
    emitters: Arc<EmitterMap>,
    subscription: Mutex<Option<ChangeSubscription>>,
    disposed: AtomicBool,
}

impl SinkProvider {
    pub fn new(collector: Arc<Collector>, monitor: Arc<OptionsMonitor>, filter: Option<Filter>) -> Self {
        Self::with_scope_provider(collector, monitor, filter, Arc::new(LocalScopeProvider::new()))
    }

    pub fn with_scope_provider(
        collector: Arc<Collector>,
        monitor: Arc<OptionsMonitor>,
        filter: Option<Filter>,
        scope_provider: Arc<dyn ScopeProvider>,
    ) -> Self {
        let emitters: Arc<EmitterMap> = Arc::new(RwLock::new(HashMap::new()));

        let weak = Arc::downgrade(&emitters);
        let subscription = monitor.on_change(move |options| {
            if let Some(emitters) = weak.upgrade() {
                for emitter in emitters.read().values() {
                    emitter.load_options(options);
                }
            }
        });

        SinkProvider {
            collector,
            monitor,
            scope_provider,
            filter: RwLock::new(filter.unwrap_or_default()),
            emitters,
            subscription: Mutex::new(Some(subscription)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Return the emitter for `name`, creating it on first use.
    pub fn emitter(&self, name: &str) -> Arc<Emitter> {
        if let Some(emitter) = self.emitters.read().get(name) {
            return Arc::clone(emitter);
        }

        let mut emitters = self.emitters.write();
        let emitter = emitters.entry(name.to_string()).or_insert_with(|| {
            // Read options under the write lock so a concurrent reload
            // either precedes this read or reaches the new emitter.
            let emitter = Emitter::new(
                name,
                Arc::clone(&self.collector),
                &self.monitor.current(),
                Some(Arc::clone(&self.scope_provider)),
                self.filter.read().clone(),
            );
            if self.disposed.load(Ordering::Acquire) {
                emitter.dispose();
            }
            Arc::new(emitter)
        });
        Arc::clone(emitter)
    }

    /// Replace the filter on this provider and every emitter it created.
    pub fn set_filter(&self, filter: Filter) {
        *self.filter.write() = filter.clone();
        for emitter in self.emitters.read().values() {
            emitter.set_filter(filter.clone());
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn scope_provider(&self) -> &Arc<dyn ScopeProvider> {
        &self.scope_provider
    }

    pub fn emitter_names(&self) -> Vec<String> {
        self.emitters.read().keys().cloned().collect()
    }

    /// Dispose every emitter and stop listening for option reloads.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        for emitter in self.emitters.read().values() {
            emitter.dispose();
        }
        self.subscription.lock().take();
    }
}

impl Drop for SinkProvider {
    fn drop(&mut self) {
        self.dispose();
    }
}
