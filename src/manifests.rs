//! Manifests and tags on top of the blob store.
//!
//! Every mutation runs as one catalog transaction. Files are only removed
//! after the transaction that released them has been committed, and while
//! its guard is still held, so a concurrent push can't relink a digest
//! whose bytes are halfway gone.

use std::{str::FromStr, sync::Arc, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditEntry, AuditLogger},
    auth::RequestContext,
    config::ImmutableTagRule,
    digest::Digest,
    error::{Conflict, Error, Resource, Result},
    extractor::{OCI_INDEX, parse_manifest},
    notify::{DomainEvent, EventBroker},
    stats::ProjectStats,
    store::{
        blobs::BlobStore,
        catalog::{Collection, ManifestDeletion, ManifestRecord, TagRecord, project_of},
    },
    webhook::{WebhookService, model::EventType},
};

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap());

/// The `<reference>` part of a manifest path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains(':') {
            return Ok(Reference::Digest(s.parse()?));
        }

        if !TAG.is_match(s) {
            return Err(Error::Invalid(format!("invalid tag {s:?}")));
        }

        Ok(Reference::Tag(s.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct StoredManifest {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PushedManifest {
    pub digest: Digest,
    pub size: u64,
    pub subject: Option<Digest>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TagDetail {
    pub name: String,
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
    pub pushed_at: DateTime<Utc>,
    pub pushed_by: String,
}

pub(crate) struct ManifestRegistry {
    blobs: Arc<BlobStore>,
    webhooks: Arc<WebhookService>,
    broker: Arc<EventBroker>,
    audit: Arc<dyn AuditLogger>,
    stats: Arc<dyn ProjectStats>,
    immutable_tags: Vec<ImmutableTagRule>,
}

impl ManifestRegistry {
    pub fn new(
        blobs: Arc<BlobStore>,
        webhooks: Arc<WebhookService>,
        broker: Arc<EventBroker>,
        audit: Arc<dyn AuditLogger>,
        stats: Arc<dyn ProjectStats>,
        immutable_tags: Vec<ImmutableTagRule>,
    ) -> Self {
        Self {
            blobs,
            webhooks,
            broker,
            audit,
            stats,
            immutable_tags,
        }
    }

    fn is_immutable(&self, repository: &str, tag: &str) -> bool {
        self.immutable_tags
            .iter()
            .any(|rule| rule.matches(repository, tag))
    }

    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        content_type: Option<&str>,
        bytes: &[u8],
        context: &RequestContext,
    ) -> Result<PushedManifest> {
        let audit = |details: Value| {
            AuditEntry::new(context, "manifest.push", format!("{repository}:{}", display(reference)), details)
        };

        match self
            .store_manifest(repository, reference, content_type, bytes, &context.actor())
            .await
        {
            Ok((pushed, media_type)) => {
                let tag = match reference {
                    Reference::Tag(tag) => Some(tag.as_str()),
                    Reference::Digest(_) => None,
                };

                self.audit.record(audit(json!({
                    "digest": pushed.digest,
                    "size": pushed.size,
                })));
                self.emit(
                    EventType::Push,
                    repository,
                    &pushed.digest,
                    tag,
                    &media_type,
                    pushed.size,
                    &context.actor(),
                )
                .await;
                self.refresh_stats(project_of(repository)).await;

                Ok(pushed)
            }
            Err(err) => {
                self.audit.record_error(audit(Value::Null), &err.to_string());
                Err(err)
            }
        }
    }

    async fn store_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        content_type: Option<&str>,
        bytes: &[u8],
        actor: &str,
    ) -> Result<(PushedManifest, String)> {
        let digest = Digest::of(bytes);

        if let Reference::Digest(expected) = reference {
            if expected != &digest {
                return Err(Error::DigestMismatch {
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        let info = parse_manifest(content_type, bytes)?;
        let size = bytes.len() as u64;
        let now = Utc::now();

        let record = ManifestRecord {
            digest: digest.clone(),
            media_type: info.media_type.clone(),
            size,
            artifact_type: info.artifact_type.clone(),
            annotations: info.annotations.clone(),
            blobs: info.blobs.iter().map(|d| d.digest.clone()).collect(),
            manifests: info.manifests.iter().map(|d| d.digest.clone()).collect(),
            subject: info.subject.as_ref().map(|d| d.digest.clone()),
            parents: 0,
            created_at: now,
            created_by: actor.to_string(),
        };
        let subject = record.subject.clone();

        let mut txn = self.blobs.catalog().begin().await;

        let stored_elsewhere = txn
            .repositories
            .values()
            .any(|repo| repo.manifests.contains_key(&digest));

        let created = txn.register_manifest(repository, record)?;

        if let Reference::Tag(tag) = reference {
            if self.is_immutable(repository, tag) {
                if let Some(existing) = txn.resolve_tag(repository, tag) {
                    if existing.digest != digest {
                        return Err(Error::Conflict(Conflict::TagImmutable {
                            repository: repository.to_string(),
                            tag: tag.clone(),
                        }));
                    }
                }
            }

            let previous = txn.tag(
                repository,
                tag,
                TagRecord {
                    digest: digest.clone(),
                    size,
                    pushed_at: now,
                    pushed_by: actor.to_string(),
                },
            )?;

            if let Some(previous) = previous.filter(|previous| previous != &digest) {
                info!(repository, tag, %previous, %digest, "Moved tag");
            }
        }

        if !stored_elsewhere {
            self.blobs.write_manifest(&digest, bytes).await?;
        }

        if let Err(err) = txn.commit().await {
            if !stored_elsewhere {
                if let Err(err) = self.blobs.remove_manifest_file(&digest).await {
                    warn!(%digest, "Unable to remove manifest after failed commit: {err}");
                }
            }
            return Err(err.into());
        }

        info!(repository, %digest, size, created, actor, "Stored manifest");

        Ok((
            PushedManifest {
                digest,
                size,
                subject,
            },
            info.media_type,
        ))
    }

    /// Looks a manifest up by tag or digest.
    pub async fn stat_manifest(&self, repository: &str, reference: &Reference) -> Result<StoredManifest> {
        self.blobs
            .catalog()
            .read(|catalog| -> Option<StoredManifest> {
                let digest = match reference {
                    Reference::Tag(tag) => &catalog.resolve_tag(repository, tag)?.digest,
                    Reference::Digest(digest) => digest,
                };
                let manifest = catalog.manifest(repository, digest)?;
                Some(StoredManifest {
                    digest: manifest.digest.clone(),
                    media_type: manifest.media_type.clone(),
                    size: manifest.size,
                })
            })
            .await
            .ok_or(Error::NotFound(Resource::Manifest))
    }

    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &Reference,
    ) -> Result<(StoredManifest, Vec<u8>)> {
        let manifest = self.stat_manifest(repository, reference).await?;
        let bytes = self.blobs.read_manifest(&manifest.digest).await?;
        Ok((manifest, bytes))
    }

    pub async fn delete_manifest(
        &self,
        repository: &str,
        reference: &Reference,
        context: &RequestContext,
    ) -> Result<ManifestDeletion> {
        let audit = |details: Value| {
            AuditEntry::new(context, "manifest.delete", format!("{repository}:{}", display(reference)), details)
        };

        let deletion = match self.remove_manifest(repository, reference).await {
            Ok(deletion) => deletion,
            Err(err) => {
                self.audit.record_error(audit(Value::Null), &err.to_string());
                return Err(err);
            }
        };

        let tag = match reference {
            Reference::Tag(tag) => Some(tag.as_str()),
            Reference::Digest(_) => None,
        };

        self.audit.record(audit(json!({
            "digest": deletion.digest,
            "collected_manifests": deletion.collection.manifests,
            "collected_blobs": deletion.collection.blobs,
        })));
        self.emit(
            EventType::Delete,
            repository,
            &deletion.digest,
            tag,
            &deletion.media_type,
            deletion.size,
            &context.actor(),
        )
        .await;
        self.refresh_stats(project_of(repository)).await;

        Ok(deletion)
    }

    async fn remove_manifest(&self, repository: &str, reference: &Reference) -> Result<ManifestDeletion> {
        let mut txn = self.blobs.catalog().begin().await;

        let deletion = match reference {
            Reference::Tag(tag) => {
                if self.is_immutable(repository, tag) && txn.resolve_tag(repository, tag).is_some() {
                    return Err(Error::Conflict(Conflict::TagImmutable {
                        repository: repository.to_string(),
                        tag: tag.clone(),
                    }));
                }

                txn.delete_tag(repository, tag)?
            }
            Reference::Digest(digest) => {
                txn.delete_manifest(repository, digest, |tag| self.is_immutable(repository, tag))?
            }
        };

        let guard = txn.commit().await?;
        self.remove_files(&deletion.collection).await;
        drop(guard);

        info!(
            repository,
            digest = %deletion.digest,
            manifests = deletion.collection.manifests.len(),
            blobs = deletion.collection.blobs.len(),
            "Deleted manifest"
        );

        Ok(deletion)
    }

    async fn remove_files(&self, collection: &Collection) {
        for digest in &collection.manifest_files {
            if let Err(err) = self.blobs.remove_manifest_file(digest).await {
                error!(%digest, "Unable to remove manifest file: {err}");
            }
        }

        for digest in &collection.blobs {
            if let Err(err) = self.blobs.remove_blob_file(digest).await {
                error!(%digest, "Unable to remove blob file: {err}");
            }
        }
    }

    /// Tag names after `last` in lexical order, at most `n` of them, and
    /// whether more follow.
    pub async fn list_tags(
        &self,
        repository: &str,
        n: Option<usize>,
        last: Option<&str>,
    ) -> Result<(Vec<String>, bool)> {
        self.blobs
            .catalog()
            .read(|catalog| -> Result<(Vec<String>, bool)> {
                let repo = catalog.repository(repository)?;

                let mut tags = repo
                    .tags
                    .keys()
                    .filter(|tag| last.is_none_or(|last| tag.as_str() > last))
                    .cloned();

                let page: Vec<String> = match n {
                    Some(n) => tags.by_ref().take(n).collect(),
                    None => tags.by_ref().collect(),
                };
                let more = tags.next().is_some();

                Ok((page, more))
            })
            .await
    }

    pub async fn tag_details(&self, repository: &str) -> Result<Vec<TagDetail>> {
        self.blobs
            .catalog()
            .read(|catalog| -> Result<Vec<TagDetail>> {
                let repo = catalog.repository(repository)?;
                Ok(repo
                    .tags
                    .iter()
                    .map(|(name, tag)| TagDetail {
                        name: name.clone(),
                        digest: tag.digest.clone(),
                        media_type: repo
                            .manifests
                            .get(&tag.digest)
                            .map(|m| m.media_type.clone())
                            .unwrap_or_default(),
                        size: tag.size,
                        pushed_at: tag.pushed_at,
                        pushed_by: tag.pushed_by.clone(),
                    })
                    .collect())
            })
            .await
    }

    /// An image index listing manifests whose subject is `digest`, plus
    /// whether an artifact type filter was applied.
    pub async fn referrers(
        &self,
        repository: &str,
        digest: &Digest,
        artifact_type: Option<&str>,
    ) -> (Value, bool) {
        let descriptors: Vec<Value> = self
            .blobs
            .catalog()
            .read(|catalog| {
                catalog
                    .referrers(repository, digest)
                    .filter(|m| artifact_type.is_none_or(|at| m.artifact_type.as_deref() == Some(at)))
                    .map(|m| {
                        let mut descriptor = json!({
                            "mediaType": m.media_type,
                            "digest": m.digest,
                            "size": m.size,
                        });
                        if let Some(at) = &m.artifact_type {
                            descriptor["artifactType"] = json!(at);
                        }
                        if !m.annotations.is_empty() {
                            descriptor["annotations"] = json!(m.annotations);
                        }
                        descriptor
                    })
                    .collect()
            })
            .await;

        let mut index = json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": descriptors,
        });

        let filtered = artifact_type.is_some();
        if filtered {
            index["annotations"] = json!({
                "org.opencontainers.referrers.filtersApplied": "artifactType"
            });
        }

        (index, filtered)
    }

    /// Recomputes a project's usage. Failures are logged: the mutation that
    /// triggered the refresh has already happened.
    pub async fn refresh_stats(&self, project: &str) {
        let (images, bytes) = self
            .blobs
            .catalog()
            .read(|catalog| catalog.project_stats(project))
            .await;

        if let Err(err) = self.stats.update_stats(project, images, bytes).await {
            error!(project, "Unable to update project statistics: {err}");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        kind: EventType,
        repository: &str,
        digest: &Digest,
        tag: Option<&str>,
        media_type: &str,
        size: u64,
        actor: &str,
    ) {
        let project = project_of(repository);

        let event = DomainEvent {
            id: Uuid::new_v4(),
            kind,
            project: project.to_string(),
            repository: repository.to_string(),
            digest: digest.clone(),
            tag: tag.map(|tag| tag.to_string()),
            media_type: media_type.to_string(),
            size,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        };

        let payload = json!({
            "digest": digest,
            "tag": tag,
            "media_type": media_type,
            "size": size,
        });

        if let Err(err) = self
            .webhooks
            .trigger_event(kind, project, repository, &payload, actor)
            .await
        {
            error!(repository, %digest, "Unable to queue webhook events: {err}");
        }

        self.broker.publish(event);
    }
}

fn display(reference: &Reference) -> String {
    match reference {
        Reference::Tag(tag) => tag.clone(),
        Reference::Digest(digest) => digest.to_string(),
    }
}
