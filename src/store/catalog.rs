//! Registry metadata: projects, repositories, manifests, tags and blobs.
//!
//! Everything in here is pure bookkeeping over an in-memory document. The
//! blob reference count is the number of manifest records (across all
//! repositories) that list the blob. Callers apply these operations to a
//! [`Transaction`](super::Transaction) draft and act on the returned
//! [`Collection`] only after committing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    digest::Digest,
    error::{Conflict, Error, Resource, Result},
};

/// The project that owns a repository: its first path segment.
pub fn project_of(repository: &str) -> &str {
    repository
        .split_once('/')
        .map(|(project, _)| project)
        .unwrap_or(repository)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub projects: BTreeMap<String, ProjectRecord>,
    pub repositories: BTreeMap<String, RepositoryRecord>,
    pub blobs: BTreeMap<Digest, BlobRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub manifests: BTreeMap<Digest, ManifestRecord>,
    pub tags: BTreeMap<String, TagRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
    pub artifact_type: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub blobs: BTreeSet<Digest>,
    pub manifests: BTreeSet<Digest>,
    pub subject: Option<Digest>,
    /// Number of indexes in the same repository listing this manifest.
    pub parents: u64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub digest: Digest,
    pub size: u64,
    pub pushed_at: DateTime<Utc>,
    pub pushed_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub size: u64,
    pub references: u64,
    pub repositories: BTreeSet<String>,
    /// Set once any manifest has listed this blob.
    pub referenced: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobDeletion {
    /// Still referenced by a manifest, nothing changed.
    Retained,
    /// Unlinked from the repository, other repositories still hold it.
    Unlinked,
    /// Last link gone, the bytes should be removed.
    Removed,
}

/// Objects that left the catalog during an operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Collection {
    /// Manifest records removed from the repository, in removal order.
    pub manifests: Vec<Digest>,
    /// Manifest digests no repository holds any more.
    pub manifest_files: Vec<Digest>,
    /// Blobs whose reference count dropped to zero.
    pub blobs: Vec<Digest>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ManifestDeletion {
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
    pub collection: Collection,
}

impl Catalog {
    pub fn repository(&self, repository: &str) -> Result<&RepositoryRecord> {
        self.repositories
            .get(repository)
            .ok_or(Error::NotFound(Resource::Repository))
    }

    fn repository_mut(&mut self, repository: &str) -> Result<&mut RepositoryRecord> {
        self.repositories
            .get_mut(repository)
            .ok_or(Error::NotFound(Resource::Repository))
    }

    /// Creates the repository, and its project, on first use.
    pub fn ensure_repository(&mut self, repository: &str, now: DateTime<Utc>) {
        let project = project_of(repository).to_string();

        self.projects
            .entry(project.clone())
            .or_insert(ProjectRecord { created_at: now });

        self.repositories
            .entry(repository.to_string())
            .or_insert_with(|| RepositoryRecord {
                project,
                created_at: now,
                manifests: BTreeMap::new(),
                tags: BTreeMap::new(),
            });
    }

    /// A blob as seen from `repository`. Blobs that exist but aren't linked
    /// into the repository are invisible to it.
    pub fn blob_in(&self, repository: &str, digest: &Digest) -> Option<&BlobRecord> {
        self.blobs
            .get(digest)
            .filter(|blob| blob.repositories.contains(repository))
    }

    /// Records a stored blob and links it into the repository. Returns true
    /// if the blob was not previously known.
    pub fn link_blob(
        &mut self,
        repository: &str,
        digest: &Digest,
        size: u64,
        now: DateTime<Utc>,
    ) -> bool {
        self.ensure_repository(repository, now);

        match self.blobs.get_mut(digest) {
            Some(blob) => {
                blob.repositories.insert(repository.to_string());
                false
            }
            None => {
                self.blobs.insert(
                    digest.clone(),
                    BlobRecord {
                        size,
                        references: 0,
                        repositories: BTreeSet::from([repository.to_string()]),
                        referenced: false,
                        created_at: now,
                    },
                );
                true
            }
        }
    }

    pub fn mount_blob(
        &mut self,
        digest: &Digest,
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let size = self
            .blob_in(from, digest)
            .ok_or(Error::NotFound(Resource::Blob))?
            .size;

        self.link_blob(to, digest, size, now);

        Ok(size)
    }

    pub fn unlink_blob(&mut self, repository: &str, digest: &Digest) -> Result<BlobDeletion> {
        let blob = self
            .blobs
            .get_mut(digest)
            .filter(|blob| blob.repositories.contains(repository))
            .ok_or(Error::NotFound(Resource::Blob))?;

        if blob.references > 0 {
            return Ok(BlobDeletion::Retained);
        }

        blob.repositories.remove(repository);

        if blob.repositories.is_empty() {
            self.blobs.remove(digest);
            return Ok(BlobDeletion::Removed);
        }

        Ok(BlobDeletion::Unlinked)
    }

    pub fn manifest(&self, repository: &str, digest: &Digest) -> Option<&ManifestRecord> {
        self.repositories
            .get(repository)
            .and_then(|repo| repo.manifests.get(digest))
    }

    /// Manifests in the repository whose subject is `digest`.
    pub fn referrers<'a>(
        &'a self,
        repository: &str,
        digest: &'a Digest,
    ) -> impl Iterator<Item = &'a ManifestRecord> + 'a {
        self.repositories
            .get(repository)
            .into_iter()
            .flat_map(|repo| repo.manifests.values())
            .filter(move |manifest| manifest.subject.as_ref() == Some(digest))
    }

    /// Adds a manifest to the repository. Every blob it lists must be linked
    /// into the repository and every child manifest must already be there.
    /// Counts only move the first time a digest is registered in a
    /// repository; returns false for a repeat.
    pub fn register_manifest(&mut self, repository: &str, record: ManifestRecord) -> Result<bool> {
        self.ensure_repository(repository, record.created_at);

        for digest in &record.blobs {
            if self.blob_in(repository, digest).is_none() {
                return Err(Error::ManifestBlobUnknown(digest.clone()));
            }
        }

        let repo = self.repository_mut(repository)?;

        if repo.manifests.contains_key(&record.digest) {
            return Ok(false);
        }

        for digest in &record.manifests {
            if !repo.manifests.contains_key(digest) {
                return Err(Error::ManifestBlobUnknown(digest.clone()));
            }
        }

        for digest in &record.manifests {
            if let Some(child) = repo.manifests.get_mut(digest) {
                child.parents += 1;
            }
        }

        let blobs = record.blobs.clone();
        repo.manifests.insert(record.digest.clone(), record);

        for digest in &blobs {
            if let Some(blob) = self.blobs.get_mut(digest) {
                blob.references += 1;
                blob.referenced = true;
            }
        }

        Ok(true)
    }

    /// Points a tag at a registered manifest, returning the digest it
    /// previously pointed at.
    pub fn tag(
        &mut self,
        repository: &str,
        tag: &str,
        record: TagRecord,
    ) -> Result<Option<Digest>> {
        let repo = self.repository_mut(repository)?;

        if !repo.manifests.contains_key(&record.digest) {
            return Err(Error::NotFound(Resource::Manifest));
        }

        Ok(repo
            .tags
            .insert(tag.to_string(), record)
            .map(|previous| previous.digest))
    }

    pub fn resolve_tag(&self, repository: &str, tag: &str) -> Option<&TagRecord> {
        self.repositories
            .get(repository)
            .and_then(|repo| repo.tags.get(tag))
    }

    pub fn tags_for<'a>(
        &'a self,
        repository: &str,
        digest: &'a Digest,
    ) -> impl Iterator<Item = &'a String> + 'a {
        self.repositories
            .get(repository)
            .into_iter()
            .flat_map(|repo| repo.tags.iter())
            .filter(move |(_, tag)| &tag.digest == digest)
            .map(|(name, _)| name)
    }

    /// True when no tag, index or referrer in the repository points at it
    /// and it isn't attached to a subject that is still there.
    pub fn is_collectable(&self, repository: &str, digest: &Digest) -> bool {
        let Some(manifest) = self.manifest(repository, digest) else {
            return false;
        };

        let attached = manifest
            .subject
            .as_ref()
            .is_some_and(|subject| self.manifest(repository, subject).is_some());

        manifest.parents == 0
            && !attached
            && self.tags_for(repository, digest).next().is_none()
            && self.referrers(repository, digest).next().is_none()
    }

    /// Removes a manifest record from the repository along with the tags
    /// that point at it, releasing its blobs and child manifests. Children
    /// left unreferenced are collected too.
    fn collect_manifest(&mut self, repository: &str, digest: &Digest, out: &mut Collection) {
        let Some(repo) = self.repositories.get_mut(repository) else {
            return;
        };

        let Some(manifest) = repo.manifests.remove(digest) else {
            return;
        };

        repo.tags.retain(|_, tag| &tag.digest != digest);

        for child in &manifest.manifests {
            if let Some(child) = repo.manifests.get_mut(child) {
                child.parents = child.parents.saturating_sub(1);
            }
        }

        out.manifests.push(digest.clone());

        for blob_digest in &manifest.blobs {
            let Some(blob) = self.blobs.get_mut(blob_digest) else {
                continue;
            };

            blob.references = blob.references.saturating_sub(1);

            if blob.references == 0 {
                self.blobs.remove(blob_digest);
                out.blobs.push(blob_digest.clone());
            }
        }

        let still_stored = self
            .repositories
            .values()
            .any(|repo| repo.manifests.contains_key(digest));
        if !still_stored {
            out.manifest_files.push(digest.clone());
        }

        for child in &manifest.manifests {
            if self.is_collectable(repository, child) {
                self.collect_manifest(repository, child, out);
            }
        }
    }

    /// Removes one tag. The manifest goes too if nothing else points at it.
    pub fn delete_tag(&mut self, repository: &str, tag: &str) -> Result<ManifestDeletion> {
        let repo = self.repository_mut(repository)?;
        let removed = repo
            .tags
            .remove(tag)
            .ok_or(Error::NotFound(Resource::Manifest))?;

        let manifest = repo
            .manifests
            .get(&removed.digest)
            .ok_or(Error::NotFound(Resource::Manifest))?;
        let (media_type, size) = (manifest.media_type.clone(), manifest.size);

        let mut collection = Collection::default();
        if self.is_collectable(repository, &removed.digest) {
            self.collect_manifest(repository, &removed.digest, &mut collection);
        }

        Ok(ManifestDeletion {
            digest: removed.digest,
            media_type,
            size,
            collection,
        })
    }

    /// Removes a manifest, every tag pointing at it and its untagged
    /// referrers. Refused while an index still lists it or any of those
    /// referrers, or while one of them carries a tag `immutable` matches.
    /// Tagged referrers are left in place without their subject.
    pub fn delete_manifest(
        &mut self,
        repository: &str,
        digest: &Digest,
        immutable: impl Fn(&str) -> bool,
    ) -> Result<ManifestDeletion> {
        let manifest = self
            .manifest(repository, digest)
            .ok_or(Error::NotFound(Resource::Manifest))?;
        let (media_type, size) = (manifest.media_type.clone(), manifest.size);

        self.ensure_removable(repository, digest, &immutable)?;

        let mut collection = Collection::default();
        self.delete_with_referrers(repository, digest, &immutable, &mut collection)?;

        Ok(ManifestDeletion {
            digest: digest.clone(),
            media_type,
            size,
            collection,
        })
    }

    fn ensure_removable(
        &self,
        repository: &str,
        digest: &Digest,
        immutable: &dyn Fn(&str) -> bool,
    ) -> Result<()> {
        let parents = self
            .manifest(repository, digest)
            .map_or(0, |manifest| manifest.parents);
        if parents > 0 {
            return Err(Error::Conflict(Conflict::ManifestReferenced {
                digest: digest.clone(),
            }));
        }

        if let Some(tag) = self.tags_for(repository, digest).find(|tag| immutable(tag)) {
            return Err(Error::Conflict(Conflict::TagImmutable {
                repository: repository.to_string(),
                tag: tag.clone(),
            }));
        }

        Ok(())
    }

    fn delete_with_referrers(
        &mut self,
        repository: &str,
        digest: &Digest,
        immutable: &dyn Fn(&str) -> bool,
        out: &mut Collection,
    ) -> Result<()> {
        let referrers: Vec<Digest> = self
            .referrers(repository, digest)
            .map(|referrer| referrer.digest.clone())
            .collect();

        for referrer in referrers {
            self.ensure_removable(repository, &referrer, immutable)?;

            if self.tags_for(repository, &referrer).next().is_some() {
                continue;
            }

            self.delete_with_referrers(repository, &referrer, immutable, out)?;
        }

        self.collect_manifest(repository, digest, out);

        Ok(())
    }

    /// Distinct manifests in the project and the bytes they account for:
    /// manifest sizes plus every distinct blob they reference.
    pub fn project_stats(&self, project: &str) -> (u64, u64) {
        let mut manifests: BTreeMap<&Digest, u64> = BTreeMap::new();
        let mut blobs: BTreeSet<&Digest> = BTreeSet::new();

        for repo in self.repositories.values().filter(|r| r.project == project) {
            for manifest in repo.manifests.values() {
                manifests.insert(&manifest.digest, manifest.size);
                blobs.extend(manifest.blobs.iter());
            }
        }

        let blob_bytes: u64 = blobs
            .into_iter()
            .filter_map(|digest| self.blobs.get(digest))
            .map(|blob| blob.size)
            .sum();

        (
            manifests.len() as u64,
            manifests.values().sum::<u64>() + blob_bytes,
        )
    }

    /// Blobs nothing ever referenced that were created before `cutoff`.
    pub fn stale_blobs(&self, cutoff: DateTime<Utc>) -> Vec<Digest> {
        self.blobs
            .iter()
            .filter(|(_, blob)| blob.references == 0 && !blob.referenced)
            .filter(|(_, blob)| blob.created_at < cutoff)
            .map(|(digest, _)| digest.clone())
            .collect()
    }

    pub fn forget_blob(&mut self, digest: &Digest) -> Option<BlobRecord> {
        self.blobs.remove(digest)
    }
}
