//! Resumable blob uploads.
//!
//! Each session moves `Uploading -> Completed | Cancelled | Expired`. Sessions
//! live in an arena keyed by id; the arena lock is only held to look a
//! session up, and each session has its own async mutex so chunks for one
//! upload are applied in order while different uploads proceed in parallel.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use axum::body::Bytes;
use futures::Stream;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tokio::{task::JoinSet, time::Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    digest::{Digest, Hasher},
    error::{Error, Resource, Result},
    store::blobs::{BlobStore, append_stream, remove_quietly, truncate},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum UploadState {
    Uploading,
    Completed,
    Cancelled,
    Expired,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UploadMetricLabels {
    state: UploadState,
}

struct Session {
    repository: String,
    offset: u64,
    hasher: Hasher,
    state: UploadState,
    last_active: Instant,
}

/// Outcome of starting an upload.
#[derive(Debug, PartialEq)]
pub enum Initiated {
    Session { id: Uuid },
    Mounted { digest: Digest, size: u64 },
}

pub(crate) struct UploadManager {
    sessions: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<Session>>>>,
    /// Recently finished ids, so a repeated cancel can succeed.
    finished: Mutex<HashMap<Uuid, (UploadState, Instant)>>,
    blobs: Arc<BlobStore>,
    idle_timeout: Duration,
    transitions: Family<UploadMetricLabels, Counter>,
}

impl UploadManager {
    pub fn new(blobs: Arc<BlobStore>, idle_timeout: Duration, registry: &mut Registry) -> Self {
        let transitions = Family::<UploadMetricLabels, Counter>::default();
        registry.register(
            "uploads",
            "Number of upload sessions entering each state",
            transitions.clone(),
        );

        Self {
            sessions: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            blobs,
            idle_timeout,
            transitions,
        }
    }

    fn count(&self, state: UploadState) {
        self.transitions
            .get_or_create(&UploadMetricLabels { state })
            .inc();
    }

    fn lookup(&self, id: &Uuid) -> Result<Arc<tokio::sync::Mutex<Session>>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("Upload arena lock poisoned"))?;
        sessions
            .get(id)
            .cloned()
            .ok_or(Error::NotFound(Resource::Upload))
    }

    fn retire(&self, id: &Uuid, state: UploadState) -> Result<()> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("Upload arena lock poisoned"))?
            .remove(id);
        self.finished
            .lock()
            .map_err(|_| anyhow!("Upload arena lock poisoned"))?
            .insert(*id, (state, Instant::now()));
        self.count(state);
        Ok(())
    }

    /// Starts an upload. When `mount` names a blob present in the source
    /// repository it is linked straight away and no session is created.
    pub async fn initiate(
        &self,
        repository: &str,
        mount: Option<(&Digest, &str)>,
    ) -> Result<Initiated> {
        if let Some((digest, from)) = mount {
            match self.blobs.mount_blob(digest, from, repository).await {
                Ok(size) => {
                    return Ok(Initiated::Mounted {
                        digest: digest.clone(),
                        size,
                    });
                }
                Err(Error::NotFound(_)) => {
                    debug!(%digest, from, "Mount source missing, falling back to upload");
                }
                Err(err) => return Err(err),
            }
        }

        let id = Uuid::new_v4();
        let path = self.blobs.upload_path(&id);
        tokio::fs::write(&path, b"").await?;

        let session = Session {
            repository: repository.to_string(),
            offset: 0,
            hasher: Hasher::new(),
            state: UploadState::Uploading,
            last_active: Instant::now(),
        };

        self.sessions
            .lock()
            .map_err(|_| anyhow!("Upload arena lock poisoned"))?
            .insert(id, Arc::new(tokio::sync::Mutex::new(session)));
        self.count(UploadState::Uploading);

        info!(%id, repository, "Started upload");

        Ok(Initiated::Session { id })
    }

    /// Appends a chunk. When the client gives the inclusive byte range of
    /// the chunk it has to start at the bytes already received and span
    /// exactly what was sent; otherwise the chunk is dropped.
    pub async fn append<S, E>(
        &self,
        id: &Uuid,
        repository: &str,
        range: Option<(u64, u64)>,
        body: S,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let session = self.lookup(id)?;
        let mut session = session.lock().await;

        if session.repository != repository || session.state != UploadState::Uploading {
            return Err(Error::NotFound(Resource::Upload));
        }

        if let Some((first, _)) = range {
            if first != session.offset {
                return Err(Error::RangeMismatch {
                    offset: session.offset,
                });
            }
        }

        let path = self.blobs.upload_path(id);
        let start = session.offset;
        let snapshot = session.hasher.clone();
        let written = append_stream(&path, start, body, &mut session.hasher).await?;

        if let Some((first, last)) = range {
            if last.checked_sub(first).map(|span| span + 1) != Some(written) {
                session.hasher = snapshot;
                truncate(&path, start).await?;
                debug!(%id, first, last, written, "Chunk length disagrees with Content-Range");
                return Err(Error::RangeMismatch { offset: start });
            }
        }

        session.offset += written;
        session.last_active = Instant::now();

        debug!(%id, written, offset = session.offset, "Appended chunk");

        Ok(session.offset)
    }

    /// Appends any final bytes and commits the blob if it hashes to
    /// `digest`. On a mismatch the bytes from this call are dropped and the
    /// session stays open at its previous offset.
    pub async fn complete<S, E>(
        &self,
        id: &Uuid,
        repository: &str,
        digest: &Digest,
        body: S,
        actor: &str,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let session = self.lookup(id)?;
        let mut session = session.lock().await;

        if session.repository != repository || session.state != UploadState::Uploading {
            return Err(Error::NotFound(Resource::Upload));
        }

        let path = self.blobs.upload_path(id);
        let start = session.offset;
        let snapshot = session.hasher.clone();

        let written = append_stream(&path, start, body, &mut session.hasher).await?;
        let actual = session.hasher.clone().finish();

        if &actual != digest {
            session.hasher = snapshot;
            session.last_active = Instant::now();
            truncate(&path, start).await?;
            info!(%id, expected = %digest, %actual, "Upload digest mismatch");
            return Err(Error::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        let size = start + written;
        if let Err(err) = self
            .blobs
            .commit_blob(repository, digest, &path, size, actor)
            .await
        {
            session.hasher = snapshot;
            session.last_active = Instant::now();
            if let Err(truncate_err) = truncate(&path, start).await {
                error!(%id, "Unable to roll back upload to {start}: {truncate_err}");
            }
            return Err(err);
        }

        session.offset = size;
        session.state = UploadState::Completed;
        self.retire(id, UploadState::Completed)?;

        info!(%id, repository, %digest, size, "Completed upload");

        Ok(size)
    }

    /// Abandons an upload. Cancelling an id that was already cancelled
    /// succeeds.
    pub async fn cancel(&self, id: &Uuid, repository: &str) -> Result<()> {
        let session = match self.lookup(id) {
            Ok(session) => session,
            Err(Error::NotFound(resource)) => {
                let finished = self
                    .finished
                    .lock()
                    .map_err(|_| anyhow!("Upload arena lock poisoned"))?;
                return match finished.get(id) {
                    Some((UploadState::Cancelled, _)) => Ok(()),
                    _ => Err(Error::NotFound(resource)),
                };
            }
            Err(err) => return Err(err),
        };

        let mut session = session.lock().await;

        if session.repository != repository {
            return Err(Error::NotFound(Resource::Upload));
        }

        if session.state == UploadState::Cancelled {
            return Ok(());
        }

        session.state = UploadState::Cancelled;
        remove_quietly(&self.blobs.upload_path(id)).await;
        self.retire(id, UploadState::Cancelled)?;

        info!(%id, repository, "Cancelled upload");

        Ok(())
    }

    pub async fn status(&self, id: &Uuid, repository: &str) -> Result<u64> {
        let session = self.lookup(id)?;
        let session = session.lock().await;

        if session.repository != repository || session.state != UploadState::Uploading {
            return Err(Error::NotFound(Resource::Upload));
        }

        Ok(session.offset)
    }

    pub fn live_ids(&self) -> Result<HashSet<Uuid>> {
        Ok(self
            .sessions
            .lock()
            .map_err(|_| anyhow!("Upload arena lock poisoned"))?
            .keys()
            .copied()
            .collect())
    }

    /// Expires sessions that have been idle for longer than the timeout.
    /// Sessions busy with a chunk are skipped.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let candidates: Vec<(Uuid, Arc<tokio::sync::Mutex<Session>>)> = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("Upload arena lock poisoned"))?
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect();

        let mut expired = 0;

        for (id, session) in candidates {
            let Ok(mut session) = session.try_lock() else {
                continue;
            };

            if session.state != UploadState::Uploading
                || session.last_active.elapsed() < self.idle_timeout
            {
                continue;
            }

            session.state = UploadState::Expired;
            remove_quietly(&self.blobs.upload_path(&id)).await;
            self.retire(&id, UploadState::Expired)?;
            expired += 1;

            info!(%id, repository = %session.repository, "Expired idle upload");
        }

        let idle_timeout = self.idle_timeout;
        self.finished
            .lock()
            .map_err(|_| anyhow!("Upload arena lock poisoned"))?
            .retain(|_, (_, at)| at.elapsed() < idle_timeout);

        Ok(expired)
    }

    pub fn start_sweeper(
        self: &Arc<Self>,
        tasks: &mut JoinSet<anyhow::Result<()>>,
        interval: Duration,
    ) {
        let uploads = self.clone();

        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = uploads.sweep_expired().await {
                    error!("Upload sweep failed: {err}");
                }
            }
        });
    }
}
