//! Content-addressed byte storage on the local filesystem.
//!
//! ```text
//! <root>/blobs/ab/cd/ef/<rest>       committed blobs
//! <root>/manifests/ab/cd/ef/<rest>   manifest documents
//! <root>/uploads/<uuid>              partial uploads and temp files
//! ```
//!
//! Metadata about which repository can see which blob lives in the
//! [`Catalog`]; this type keeps the two in step.

use std::{
    collections::HashSet,
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Context, anyhow};
use axum::body::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, Take},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    digest::{Digest, Hasher},
    error::{Error, Resource, Result},
    store::{
        Store,
        catalog::{BlobDeletion, Catalog},
    },
};

pub(crate) struct BlobStore {
    root: PathBuf,
    catalog: Arc<Store<Catalog>>,
}

/// An open blob, positioned at the start of the requested range.
pub(crate) struct BlobRead {
    pub size: u64,
    /// Inclusive byte range being served, when a range was asked for.
    pub range: Option<(u64, u64)>,
    pub reader: Take<File>,
}

impl BlobStore {
    pub fn new(root: PathBuf, catalog: Arc<Store<Catalog>>) -> Self {
        Self { root, catalog }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        for dir in ["blobs", "manifests", "uploads"] {
            let path = self.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("Unable to create {path:?}"))?;
        }
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<Store<Catalog>> {
        &self.catalog
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.to_path())
    }

    pub fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("manifests").join(digest.to_path())
    }

    pub fn upload_path(&self, upload_id: &Uuid) -> PathBuf {
        self.root
            .join("uploads")
            .join(upload_id.as_hyphenated().to_string())
    }

    fn temp_path(&self) -> PathBuf {
        self.upload_path(&Uuid::new_v4())
    }

    /// Streams a whole blob in, keeping it only if it hashes to `expected`.
    /// Storing a digest that is already present just links the repository.
    pub async fn put_blob<S, E>(
        &self,
        repository: &str,
        expected: &Digest,
        body: S,
        actor: &str,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let temp = self.temp_path();
        let mut hasher = Hasher::new();

        let size = match append_stream(&temp, 0, body, &mut hasher).await {
            Ok(size) => size,
            Err(err) => {
                remove_quietly(&temp).await;
                return Err(err);
            }
        };

        let actual = hasher.finish();
        if &actual != expected {
            remove_quietly(&temp).await;
            return Err(Error::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        if let Err(err) = self.commit_blob(repository, expected, &temp, size, actor).await {
            remove_quietly(&temp).await;
            return Err(err);
        }

        Ok(size)
    }

    /// Moves a verified file into place and links it into the repository.
    pub async fn commit_blob(
        &self,
        repository: &str,
        digest: &Digest,
        source: &Path,
        size: u64,
        actor: &str,
    ) -> Result<()> {
        let mut txn = self.catalog.begin().await;
        let dest = self.blob_path(digest);
        let stored = txn.blobs.contains_key(digest) && tokio::fs::try_exists(&dest).await?;
        let created = txn.link_blob(repository, digest, size, Utc::now());

        if !stored {
            move_into_place(source, &dest).await?;
        }

        // Put the file back so the caller can retry from it.
        if let Err(err) = txn.commit().await {
            if !stored {
                if let Err(move_err) = tokio::fs::rename(&dest, source).await {
                    warn!(%digest, "Unable to move {dest:?} back after failed commit: {move_err}");
                    remove_quietly(&dest).await;
                }
            }
            return Err(err.into());
        }

        if stored {
            remove_quietly(source).await;
        }

        debug!(%digest, repository, actor, created, size, "Committed blob");

        Ok(())
    }

    pub async fn check_blob(&self, repository: &str, digest: &Digest) -> Result<u64> {
        self.catalog
            .read(|catalog| catalog.blob_in(repository, digest).map(|blob| blob.size))
            .await
            .ok_or(Error::NotFound(Resource::Blob))
    }

    /// Opens a blob for reading. `range` is an inclusive pair already
    /// clamped to the blob size.
    pub async fn get_blob(
        &self,
        repository: &str,
        digest: &Digest,
        range: Option<(u64, u64)>,
    ) -> Result<BlobRead> {
        let size = self.check_blob(repository, digest).await?;

        let mut file = match File::open(self.blob_path(digest)).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(%digest, "Blob is in the catalog but missing from disk");
                return Err(Error::NotFound(Resource::Blob));
            }
            Err(err) => return Err(err.into()),
        };

        let (start, length) = match range {
            Some((start, end)) => (start, end - start + 1),
            None => (0, size),
        };

        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        Ok(BlobRead {
            size,
            range,
            reader: file.take(length),
        })
    }

    pub async fn mount_blob(&self, digest: &Digest, from: &str, to: &str) -> Result<u64> {
        let mut txn = self.catalog.begin().await;
        let size = txn.mount_blob(digest, from, to, Utc::now())?;
        drop(txn.commit().await?);

        info!(%digest, from, to, "Mounted blob");

        Ok(size)
    }

    pub async fn delete_blob(&self, repository: &str, digest: &Digest) -> Result<BlobDeletion> {
        let mut txn = self.catalog.begin().await;
        let outcome = txn.unlink_blob(repository, digest)?;

        let _guard = match outcome {
            BlobDeletion::Retained => return Ok(outcome),
            _ => txn.commit().await?,
        };

        if outcome == BlobDeletion::Removed {
            self.remove_blob_file(digest).await?;
        }

        info!(%digest, repository, ?outcome, "Deleted blob");

        Ok(outcome)
    }

    pub async fn write_manifest(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes)
            .await
            .with_context(|| format!("Unable to write {temp:?}"))?;
        move_into_place(&temp, &self.manifest_path(digest)).await
    }

    pub async fn read_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        match tokio::fs::read(self.manifest_path(digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(Resource::Manifest))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn remove_blob_file(&self, digest: &Digest) -> Result<()> {
        remove_object(&self.blob_path(digest)).await
    }

    pub async fn remove_manifest_file(&self, digest: &Digest) -> Result<()> {
        remove_object(&self.manifest_path(digest)).await
    }

    /// Removes files in `uploads/` that no live session owns and that haven't
    /// been touched for `min_age`.
    pub async fn sweep_stray_uploads(
        &self,
        live: &HashSet<Uuid>,
        min_age: Duration,
    ) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(self.root.join("uploads")).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let owned = name
                .to_str()
                .and_then(|name| name.parse::<Uuid>().ok())
                .is_some_and(|id| live.contains(&id));
            if owned {
                continue;
            }

            let modified = entry.metadata().await?.modified()?;
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age < min_age {
                continue;
            }

            remove_quietly(&entry.path()).await;
            removed += 1;
        }

        Ok(removed)
    }
}

/// Writes `body` into `path` starting at `offset`, feeding the hasher as it
/// goes. On failure the file is cut back to `offset` and the hasher restored,
/// so the caller can retry from the same point.
pub(crate) async fn append_stream<S, E>(
    path: &Path,
    offset: u64,
    mut body: S,
    hasher: &mut Hasher,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let snapshot = hasher.clone();

    let parent = path.parent().context("Could not construct parent path")?;
    tokio::fs::create_dir_all(parent)
        .await
        .context("Failed to ensure path exists")?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("Unable to create and open file: {path:?}"))?;

    file.seek(SeekFrom::Start(offset)).await?;

    let mut written = 0u64;
    let result: Result<()> = async {
        while let Some(item) = body.next().await {
            let item = item.map_err(|err| anyhow!(err).context("Unable to stream from client"))?;
            file.write_all(&item)
                .await
                .context("Unable to write to open file")?;
            hasher.update(&item);
            written += item.len() as u64;
        }
        file.sync_all().await.context("Failed to fsync")?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        *hasher = snapshot;
        if let Err(truncate_err) = file.set_len(offset).await {
            warn!("Unable to truncate {path:?} back to {offset}: {truncate_err}");
        }
        return Err(err);
    }

    Ok(written)
}

/// Cuts a partial upload back to `offset`.
pub(crate) async fn truncate(path: &Path, offset: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(offset).await?;
    Ok(())
}

async fn move_into_place(source: &Path, dest: &Path) -> Result<()> {
    let parent = dest.parent().context("Could not construct parent path")?;
    tokio::fs::create_dir_all(parent)
        .await
        .context("Failed to ensure path exists")?;
    tokio::fs::rename(source, dest)
        .await
        .with_context(|| format!("Unable to move {source:?} to {dest:?}"))?;
    Ok(())
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            warn!("Unable to remove {path:?}: {err}");
        }
    }
}

/// Deletes a fanned-out object and prunes the directories above it that
/// became empty.
async fn remove_object(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed file {path:?}"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("Error while removing {path:?}"))
                .into());
        }
    }

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    for dir in parent.ancestors().take(3) {
        match tokio::fs::remove_dir(dir).await {
            Ok(()) => debug!("Removed directory {dir:?}"),
            // Shared with another object, or already gone
            Err(_) => return Ok(()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use tempfile::tempdir;
    use test_log::test;

    use super::*;

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect::<Vec<_>>(),
        )
    }

    async fn fixture() -> (tempfile::TempDir, BlobStore) {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), Arc::new(Store::in_memory()));
        store.init().await.unwrap();
        (dir, store)
    }

    async fn upload_count(store: &BlobStore) -> usize {
        let mut entries = tokio::fs::read_dir(store.root.join("uploads")).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[test(tokio::test)]
    async fn put_and_read_back() {
        let (_dir, store) = fixture().await;
        let digest = Digest::of(b"hello, world");

        let size = store
            .put_blob("myrepo", &digest, body(&[b"hello, ", b"world"]), "tester")
            .await
            .unwrap();
        assert_eq!(size, 12);
        assert_eq!(store.check_blob("myrepo", &digest).await.unwrap(), 12);

        let mut read = store.get_blob("myrepo", &digest, Some((7, 11))).await.unwrap();
        let mut out = String::new();
        read.reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");
        assert_eq!(read.size, 12);
    }

    #[test(tokio::test)]
    async fn mismatched_digest_leaves_nothing_behind() {
        let (_dir, store) = fixture().await;
        let claimed = Digest::of(b"something else");

        let err = store
            .put_blob("myrepo", &claimed, body(&[b"hello, world"]), "tester")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(!store.blob_path(&claimed).exists());
        assert!(!store.blob_path(&Digest::of(b"hello, world")).exists());
        assert_eq!(upload_count(&store).await, 0);
        assert!(matches!(
            store.check_blob("myrepo", &claimed).await,
            Err(Error::NotFound(Resource::Blob))
        ));
    }

    #[test(tokio::test)]
    async fn put_is_idempotent_and_links() {
        let (_dir, store) = fixture().await;
        let digest = Digest::of(b"layer");

        store
            .put_blob("a", &digest, body(&[b"layer"]), "tester")
            .await
            .unwrap();
        store
            .put_blob("b", &digest, body(&[b"layer"]), "tester")
            .await
            .unwrap();

        assert_eq!(store.check_blob("a", &digest).await.unwrap(), 5);
        assert_eq!(store.check_blob("b", &digest).await.unwrap(), 5);
    }

    #[test(tokio::test)]
    async fn mount_requires_source() {
        let (_dir, store) = fixture().await;
        let digest = Digest::of(b"layer");

        assert!(matches!(
            store.mount_blob(&digest, "a", "b").await,
            Err(Error::NotFound(Resource::Blob))
        ));

        store
            .put_blob("a", &digest, body(&[b"layer"]), "tester")
            .await
            .unwrap();
        assert_eq!(store.mount_blob(&digest, "a", "b").await.unwrap(), 5);
        assert!(store.check_blob("b", &digest).await.is_ok());
    }

    #[test(tokio::test)]
    async fn delete_removes_bytes_after_last_link() {
        let (_dir, store) = fixture().await;
        let digest = Digest::of(b"layer");
        store
            .put_blob("a", &digest, body(&[b"layer"]), "tester")
            .await
            .unwrap();
        store.mount_blob(&digest, "a", "b").await.unwrap();

        assert_eq!(
            store.delete_blob("a", &digest).await.unwrap(),
            BlobDeletion::Unlinked
        );
        assert!(store.blob_path(&digest).exists());

        assert_eq!(
            store.delete_blob("b", &digest).await.unwrap(),
            BlobDeletion::Removed
        );
        assert!(!store.blob_path(&digest).exists());
        // Fan-out directories are pruned as well
        assert!(!store.root.join("blobs").join(&digest.hash[0..2]).exists());

        assert!(matches!(
            store.delete_blob("b", &digest).await,
            Err(Error::NotFound(Resource::Blob))
        ));
    }

    #[test(tokio::test)]
    async fn failed_append_truncates() {
        let (_dir, store) = fixture().await;
        let path = store.upload_path(&Uuid::new_v4());
        let mut hasher = Hasher::new();

        append_stream(&path, 0, body(&[b"abc"]), &mut hasher)
            .await
            .unwrap();

        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"def")),
            Err(std::io::Error::other("connection reset")),
        ]);
        assert!(append_stream(&path, 3, failing, &mut hasher).await.is_err());

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abc");
        assert_eq!(hasher.finish(), Digest::of(b"abc"));
    }

    #[test(tokio::test)]
    async fn stray_uploads_are_swept() {
        let (_dir, store) = fixture().await;
        let live = Uuid::new_v4();
        tokio::fs::write(store.upload_path(&live), b"partial")
            .await
            .unwrap();
        tokio::fs::write(store.upload_path(&Uuid::new_v4()), b"stray")
            .await
            .unwrap();

        let removed = store
            .sweep_stray_uploads(&HashSet::from([live]), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(upload_count(&store).await, 1);
        assert!(store.upload_path(&live).exists());
    }
}
