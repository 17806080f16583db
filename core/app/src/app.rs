//! Composition root wiring the offline subsystem together.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

use fsmonitor_common::{Error, LocalId, Result};
use fsmonitor_intercept::{CacheStorage, Fetcher, HttpFetcher, Interceptor};
use fsmonitor_storage::{BackendRegistry, OfflineStore, RecordStore, StoreLocation};
use fsmonitor_sync::{
    BackgroundSync, BackgroundWorker, Coordinator, HttpRemote, RemoteService, StatusBus,
    SyncEngine,
};

use crate::config::AppConfig;

/// The offline subsystem, built once per process.
pub struct OfflineApp {
    config: AppConfig,
    store: Arc<OfflineStore>,
    engine: Arc<SyncEngine>,
    coordinator: Arc<Coordinator>,
    interceptor: Arc<Interceptor>,
    background: Option<BackgroundSync>,
}

impl OfflineApp {
    /// Build the app from configuration, talking to the configured server.
    ///
    /// # Returns
    /// The app and, when background sync is enabled, the worker to run.
    pub async fn open(config: AppConfig) -> Result<(Self, Option<BackgroundWorker>)> {
        let location = StoreLocation::File(config.database_path());
        let records = BackendRegistry::builtin().open(&config.storage.backend, &location)?;

        let remote = Arc::new(HttpRemote::new(
            &config.server.base_url,
            config.server.endpoints.clone(),
            config.server.timeout(),
        )?);
        let fetcher = Arc::new(HttpFetcher::new(config.server.timeout())?);

        Self::with_services(config, records, remote, fetcher).await
    }

    /// Build the app over explicit services.
    pub async fn with_services(
        config: AppConfig,
        records: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteService>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, Option<BackgroundWorker>)> {
        config.validate()?;

        let store = Arc::new(OfflineStore::new(records));
        store.initialize().await?;

        let bus = StatusBus::default();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote,
            bus,
            config.sync.clone(),
        ));

        let (background, worker) = if config.background.enabled {
            let (background, worker) = BackgroundSync::new(config.background.interval());
            (Some(background), Some(worker))
        } else {
            (None, None)
        };

        let mut coordinator = Coordinator::new(engine.clone());
        if let Some(background) = &background {
            coordinator = coordinator.with_background(background.clone());
        }

        let origin = Url::parse(&config.server.base_url)
            .map_err(|e| Error::Config(format!("Invalid base URL: {}", e)))?;
        let caches = Arc::new(CacheStorage::with_store(store.records().clone()));
        let interceptor = Arc::new(
            Interceptor::new(config.intercept.clone(), origin, fetcher).with_caches(caches),
        );

        info!(
            "Offline subsystem ready (server {}, store {})",
            config.server.base_url,
            store.records().name()
        );

        let app = Self {
            config,
            store,
            engine,
            coordinator: Arc::new(coordinator),
            interceptor,
            background,
        };
        Ok((app, worker))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    pub fn background(&self) -> Option<&BackgroundSync> {
        self.background.as_ref()
    }

    /// Spawn the background worker on the current runtime.
    pub fn spawn_worker(&self, worker: BackgroundWorker) -> JoinHandle<()> {
        tokio::spawn(worker.run_with_engine(self.engine.clone(), self.config.requeue.clone()))
    }

    /// Apply the requeue policy now.
    pub async fn requeue_due(&self) -> Result<Vec<LocalId>> {
        self.config.requeue.apply(&self.store, Utc::now()).await
    }

    /// Stop the background worker, if any.
    pub async fn shutdown(&self) {
        if let Some(background) = &self.background {
            background.shutdown().await;
        }
    }
}
