use crate::backend::{BackendBuildError, StorageRegistry};
use crate::collector::Collector;
use crate::emitter::Filter;
use crate::flush::FlushHandler;
use crate::layer::CollectorLayer;
use crate::options::{ConfigError, OptionsMonitor, SinkOptions};
use crate::provider::SinkProvider;
use crate::scheduler::{FlushScheduler, SchedulerError};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration of the logging layer.
///
/// **Fields**
/// - `options`: initial [`SinkOptions`]; later changes go through
///   [`SinkHandle::monitor`].
/// - `filter`: optional `(source, level)` predicate; everything is accepted
///   when unset.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is added
///   on top of [`CollectorLayer`] and events are also printed to the console.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub options: SinkOptions,
    pub filter: Option<Filter>,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            options: SinkOptions::default(),
            filter: None,
            enable_stdout: true,
        }
    }
}

/// Error returned while wiring the pipeline together.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendBuildError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("failed to install global subscriber: {0}")]
    SetGlobalDefault(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// The running pipeline: keep it alive and call [`SinkHandle::shutdown`]
/// before the process exits so pending records are flushed.
pub struct SinkHandle {
    monitor: Arc<OptionsMonitor>,
    provider: Arc<SinkProvider>,
    scheduler: FlushScheduler,
}

impl SinkHandle {
    pub fn monitor(&self) -> &Arc<OptionsMonitor> {
        &self.monitor
    }

    pub fn provider(&self) -> &Arc<SinkProvider> {
        &self.provider
    }

    pub fn collector(&self) -> &Arc<Collector> {
        self.provider.collector()
    }

    pub fn scheduler(&self) -> &FlushScheduler {
        &self.scheduler
    }

    /// Stop the scheduler (running the final flush) and dispose every
    /// emitter. Returns the number of records committed by the final flush.
    pub async fn shutdown(self) -> Result<usize, SchedulerError> {
        let result = self.scheduler.stop().await;
        self.provider.dispose();
        result
    }
}

/// Build the pipeline and its [`CollectorLayer`] without installing a global
/// subscriber. The scheduler is started; must be called inside a tokio
/// runtime.
pub fn build_pipeline(
    registry: &StorageRegistry,
    config: LayerConfig,
) -> Result<(CollectorLayer, SinkHandle), InitError> {
    let monitor = Arc::new(OptionsMonitor::new(config.options)?);
    let options = monitor.current();
    let storage = registry.resolve(&options.storage_target)?;

    let collector = Arc::new(Collector::new());
    let provider = Arc::new(SinkProvider::new(Arc::clone(&collector), Arc::clone(&monitor), config.filter));
    let handler = Arc::new(FlushHandler::new(collector, storage, options.commit_timeout));
    let scheduler = FlushScheduler::new(handler, Arc::clone(&monitor));
    scheduler.start()?;

    info!(
        storage_target = %options.storage_target,
        include_scopes = options.include_scopes,
        "buffered log sink initialized"
    );

    let layer = CollectorLayer::new(Arc::clone(&provider));
    Ok((
        layer,
        SinkHandle {
            monitor,
            provider,
            scheduler,
        },
    ))
}

/// Initialize the global `tracing` subscriber using the storage selected by
/// `config.options.storage_target` in `registry`.
///
/// **Effects**
///
/// This installs a [`Registry`] combined with [`CollectorLayer`] as the
/// global default subscriber, so all `tracing` events in the process are
/// buffered and flushed to storage.
pub fn init_tracing_with_config(registry: &StorageRegistry, config: LayerConfig) -> Result<SinkHandle, InitError> {
    let enable_stdout = config.enable_stdout;
    let (layer, handle) = build_pipeline(registry, config)?;

    // Both variants are built separately to keep the subscriber types
    // concrete.
    if enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(handle)
}

/// Initialize tracing with options read from `LOG_SINK_*` environment
/// variables and the built-in storage backends.
pub fn init_tracing() -> Result<SinkHandle, InitError> {
    let config = LayerConfig {
        options: SinkOptions::from_env()?,
        ..LayerConfig::default()
    };
    init_tracing_with_config(&StorageRegistry::with_builtin(), config)
}
