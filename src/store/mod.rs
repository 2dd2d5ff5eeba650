//! Durable metadata.
//!
//! Each store holds one serde document behind an async mutex. Writers work
//! on a cloned draft and the draft only replaces the live copy once it has
//! been persisted, so a failed operation leaves no partial state behind.

use std::{
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub(crate) mod blobs;
pub(crate) mod catalog;

pub(crate) struct Store<T> {
    data: Mutex<T>,
    path: Option<PathBuf>,
}

impl<T> Store<T>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send,
{
    /// Loads the snapshot at `path`, starting empty if there isn't one.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let data = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("Corrupt snapshot at {path:?}"))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {path:?}, starting empty");
                T::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Unable to read snapshot {path:?}"));
            }
        };

        Ok(Self {
            data: Mutex::new(data),
            path: Some(path),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            data: Mutex::new(T::default()),
            path: None,
        }
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.data.lock().await;
        f(&guard)
    }

    pub async fn begin(&self) -> Transaction<'_, T> {
        let guard = self.data.lock().await;
        let draft = guard.clone();
        Transaction {
            guard,
            draft,
            path: self.path.as_deref(),
        }
    }
}

pub(crate) struct Transaction<'a, T> {
    guard: MutexGuard<'a, T>,
    draft: T,
    path: Option<&'a Path>,
}

impl<'a, T: Serialize> Transaction<'a, T> {
    /// Persists the draft and makes it live. The returned guard keeps other
    /// writers out until the caller has finished any follow-up filesystem work.
    pub async fn commit(self) -> Result<MutexGuard<'a, T>> {
        let Transaction {
            mut guard,
            draft,
            path,
        } = self;

        if let Some(path) = path {
            persist(path, &draft).await?;
        }

        *guard = draft;
        Ok(guard)
    }
}

async fn persist<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let raw = serde_json::to_vec(data).context("Unable to serialize snapshot")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to ensure snapshot directory exists")?;
    }

    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, &raw)
        .await
        .with_context(|| format!("Unable to write {temp:?}"))?;
    tokio::fs::rename(&temp, path)
        .await
        .with_context(|| format!("Unable to replace {path:?}"))?;

    debug!(bytes = raw.len(), "Persisted snapshot {path:?}");

    Ok(())
}

impl<T> Deref for Transaction<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.draft
    }
}

impl<T> DerefMut for Transaction<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.draft
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;
    use tempfile::tempdir;
    use test_log::test;

    use super::*;

    type Counters = BTreeMap<String, u64>;

    #[test(tokio::test)]
    async fn dropped_transaction_rolls_back() -> Result<()> {
        let store: Store<Counters> = Store::in_memory();

        {
            let mut txn = store.begin().await;
            txn.insert("pushes".into(), 1);
        }

        assert_eq!(store.read(|c| c.get("pushes").copied()).await, None);

        let mut txn = store.begin().await;
        txn.insert("pushes".into(), 2);
        drop(txn.commit().await?);

        assert_eq!(store.read(|c| c.get("pushes").copied()).await, Some(2));

        Ok(())
    }

    #[test(tokio::test)]
    async fn committed_state_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state").join("counters.json");

        let store: Store<Counters> = Store::open(path.clone()).await?;
        let mut txn = store.begin().await;
        txn.insert("pulls".into(), 7);
        drop(txn.commit().await?);

        let reopened: Store<Counters> = Store::open(path).await?;
        assert_eq!(reopened.read(|c| c.get("pulls").copied()).await, Some(7));

        Ok(())
    }

    #[test(tokio::test)]
    async fn corrupt_snapshot_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("counters.json");
        tokio::fs::write(&path, b"{not json").await?;

        assert!(Store::<Counters>::open(path).await.is_err());

        Ok(())
    }
}
