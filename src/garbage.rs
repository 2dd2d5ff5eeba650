//! Garbage collection for blobs nothing ever referenced.
//!
//! Manifest deletes already release the blobs they held, so the collector
//! only has to deal with content that was uploaded and then abandoned:
//! blobs no manifest has ever listed, and upload files no session owns.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::{config::GarbageConfig, error::Result, store::blobs::BlobStore, uploads::UploadManager};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GarbageReport {
    pub blobs: usize,
    pub bytes: u64,
    pub uploads: usize,
}

pub(crate) struct GarbageCollector {
    blobs: Arc<BlobStore>,
    uploads: Arc<UploadManager>,
    minimum_age: Duration,
    upload_age: Duration,
    runs: Counter,
    reclaimed: Counter,
}

impl GarbageCollector {
    pub fn new(
        blobs: Arc<BlobStore>,
        uploads: Arc<UploadManager>,
        config: &GarbageConfig,
        upload_age: Duration,
        registry: &mut Registry,
    ) -> Self {
        let runs = Counter::default();
        registry.register("gc_runs", "Completed garbage collection passes", runs.clone());

        let reclaimed = Counter::default();
        registry.register(
            "gc_reclaimed_bytes",
            "Bytes of unreferenced blobs removed",
            reclaimed.clone(),
        );

        Self {
            blobs,
            uploads,
            minimum_age: config.minimum_age,
            upload_age,
            runs,
            reclaimed,
        }
    }

    /// One full pass. Safe to run while the registry is serving.
    pub async fn collect(&self) -> Result<GarbageReport> {
        let mut report = GarbageReport::default();

        let age = chrono::Duration::from_std(self.minimum_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut txn = self.blobs.catalog().begin().await;
        let stale = txn.stale_blobs(cutoff);
        for digest in &stale {
            if let Some(blob) = txn.forget_blob(digest) {
                report.bytes += blob.size;
            }
        }

        if !stale.is_empty() {
            let guard = txn.commit().await?;
            for digest in &stale {
                if let Err(err) = self.blobs.remove_blob_file(digest).await {
                    error!(%digest, "Garbage collection: Unable to remove blob: {err}");
                    continue;
                }
                debug!(%digest, "Garbage collection: Removed unreferenced blob");
                report.blobs += 1;
            }
            drop(guard);
        }

        let live = self.uploads.live_ids()?;
        report.uploads = self
            .blobs
            .sweep_stray_uploads(&live, self.upload_age)
            .await?;

        self.runs.inc();
        self.reclaimed.inc_by(report.bytes);

        if report != GarbageReport::default() {
            info!(
                blobs = report.blobs,
                bytes = report.bytes,
                uploads = report.uploads,
                "Garbage collection: Reaped unreferenced content"
            );
        }

        Ok(report)
    }

    pub fn start(self: &Arc<Self>, tasks: &mut JoinSet<anyhow::Result<()>>, interval: Duration) {
        let collector = self.clone();

        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            // The first tick fires immediately; skip it so startup isn't slowed
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(err) = collector.collect().await {
                    error!("Garbage collection failed: {err}");
                }
            }
        });
    }
}
