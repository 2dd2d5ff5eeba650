use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tracing::info;

use crate::{
    audit::{AuditLogger, TracingAuditLogger},
    auth::accounts::{AccountService, StaticAccounts},
    config::Configuration,
    garbage::GarbageCollector,
    manifests::ManifestRegistry,
    metrics::HttpMetrics,
    notify::EventBroker,
    stats::{MemoryProjectStats, ProjectStats},
    store::{Store, blobs::BlobStore},
    uploads::UploadManager,
    webhook::WebhookService,
};

pub struct RegistryState {
    pub config: Configuration,
    pub(crate) blobs: Arc<BlobStore>,
    pub(crate) uploads: Arc<UploadManager>,
    pub(crate) manifests: ManifestRegistry,
    pub(crate) webhooks: Arc<WebhookService>,
    pub(crate) broker: Arc<EventBroker>,
    pub(crate) accounts: Option<Arc<dyn AccountService>>,
    pub(crate) audit: Arc<dyn AuditLogger>,
    pub(crate) stats: Arc<dyn ProjectStats>,
    pub(crate) garbage: Arc<GarbageCollector>,
    pub(crate) http: HttpMetrics,
    pub registry: Registry,
}

impl RegistryState {
    /// Loads persisted state from the storage directory and starts the
    /// background workers on `tasks`.
    pub async fn open(config: Configuration, tasks: &mut JoinSet<Result<()>>) -> Result<Arc<Self>> {
        let storage = config.storage_path();
        tokio::fs::create_dir_all(&storage)
            .await
            .with_context(|| format!("Unable to create storage directory {storage:?}"))?;

        let mut registry = Registry::with_prefix("wharf");

        let catalog = Arc::new(Store::open(storage.join("catalog.json")).await?);
        let blobs = Arc::new(BlobStore::new(storage.clone(), catalog));
        blobs.init().await?;

        // Upload sessions don't survive a restart, so nothing in uploads/ is live
        let leftovers = blobs
            .sweep_stray_uploads(&HashSet::new(), Duration::ZERO)
            .await?;
        if leftovers > 0 {
            info!("Removed {leftovers} abandoned upload files");
        }

        let uploads = Arc::new(UploadManager::new(
            blobs.clone(),
            config.uploads.idle_timeout,
            &mut registry,
        ));
        uploads.start_sweeper(tasks, config.uploads.sweep_interval);

        let webhooks = Arc::new(WebhookService::new(
            Store::open(storage.join("webhooks.json")).await?,
            &config.webhooks,
            &mut registry,
        )?);
        webhooks.seed(&config.webhooks.subscriptions).await?;
        webhooks.start(tasks);

        let broker = Arc::new(EventBroker::start(tasks, config.events.subscriber_capacity));

        let accounts = config
            .authentication
            .as_ref()
            .map(|auth| Arc::new(StaticAccounts::new(auth)) as Arc<dyn AccountService>);

        let audit: Arc<dyn AuditLogger> = Arc::new(TracingAuditLogger);
        let stats: Arc<dyn ProjectStats> = Arc::new(MemoryProjectStats::new(&mut registry));

        let manifests = ManifestRegistry::new(
            blobs.clone(),
            webhooks.clone(),
            broker.clone(),
            audit.clone(),
            stats.clone(),
            config.immutable_tags.clone(),
        );

        let projects: Vec<String> = blobs
            .catalog()
            .read(|catalog| catalog.projects.keys().cloned().collect())
            .await;
        for project in &projects {
            manifests.refresh_stats(project).await;
        }

        let garbage = Arc::new(GarbageCollector::new(
            blobs.clone(),
            uploads.clone(),
            &config.gc,
            config.uploads.idle_timeout,
            &mut registry,
        ));
        if config.gc.enabled {
            garbage.start(tasks, config.gc.interval);
        }

        let http = HttpMetrics::new(&mut registry);

        info!(?storage, projects = projects.len(), "Registry state loaded");

        Ok(Arc::new(RegistryState {
            config,
            blobs,
            uploads,
            manifests,
            webhooks,
            broker,
            accounts,
            audit,
            stats,
            garbage,
            http,
            registry,
        }))
    }
}
