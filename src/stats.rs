use std::{collections::HashMap, sync::Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};
use serde::Serialize;

use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProjectUsage {
    pub image_count: u64,
    pub storage_used: u64,
}

/// Where per-project usage figures end up.
#[async_trait]
pub trait ProjectStats: Send + Sync {
    async fn update_stats(&self, project: &str, image_count: u64, storage_used: u64) -> Result<()>;

    async fn get_stats(&self, project: &str) -> Result<Option<ProjectUsage>>;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProjectLabels {
    project: String,
}

pub struct MemoryProjectStats {
    usage: Mutex<HashMap<String, ProjectUsage>>,
    images: Family<ProjectLabels, Gauge>,
    bytes: Family<ProjectLabels, Gauge>,
}

impl MemoryProjectStats {
    pub fn new(registry: &mut Registry) -> Self {
        let images = Family::<ProjectLabels, Gauge>::default();
        registry.register(
            "project_images",
            "Distinct manifests stored per project",
            images.clone(),
        );

        let bytes = Family::<ProjectLabels, Gauge>::default();
        registry.register(
            "project_storage_bytes",
            "Bytes of manifests and referenced blobs per project",
            bytes.clone(),
        );

        Self {
            usage: Mutex::new(HashMap::new()),
            images,
            bytes,
        }
    }
}

#[async_trait]
impl ProjectStats for MemoryProjectStats {
    async fn update_stats(&self, project: &str, image_count: u64, storage_used: u64) -> Result<()> {
        let labels = ProjectLabels {
            project: project.to_string(),
        };
        self.images
            .get_or_create(&labels)
            .set(image_count.try_into().unwrap_or(i64::MAX));
        self.bytes
            .get_or_create(&labels)
            .set(storage_used.try_into().unwrap_or(i64::MAX));

        self.usage
            .lock()
            .map_err(|_| anyhow!("Stats lock poisoned"))?
            .insert(
                project.to_string(),
                ProjectUsage {
                    image_count,
                    storage_used,
                },
            );

        Ok(())
    }

    async fn get_stats(&self, project: &str) -> Result<Option<ProjectUsage>> {
        Ok(self
            .usage
            .lock()
            .map_err(|_| anyhow!("Stats lock poisoned"))?
            .get(project)
            .cloned())
    }
}
