//! Progress Registry (C1): a durable, crash-safe set of in-progress job
//! identifiers, readable from a sibling execution context (the heartbeat thread).
//!
//! Backed by a flat JSON file rather than a database, so this state survives a
//! process restart with no external dependency. Every mutation is persisted via
//! an atomic rewrite: a same-directory `tempfile::NamedTempFile` is written and
//! then renamed into place, so a crash mid-write never leaves a truncated or
//! partially-written file behind. Advisory locking via `fs4` serializes mutators
//! both within this process and against any genuinely separate process sharing
//! the same registry path.

use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use tracing::error;

use crate::error::RegistryError;

/// A durable set of in-progress job identifiers, backed by a JSON file plus a
/// companion lock file.
///
/// Constructed once at startup and held behind an `Arc` (no module-level
/// statics); handed by reference to the fetcher, runner, and heartbeat.
pub struct ProgressRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ProgressRegistry {
    /// Load (or lazily create) the registry backed by `path`. An absent file is
    /// treated as an empty set (I4: contents survive restart, but a fresh
    /// deployment has nothing to recover).
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        let registry = Self { path, lock_path };
        // Ensure the file exists so `snapshot` never has to special-case "absent"
        // beyond the first read.
        let _ = registry.read_locked().await?;
        Ok(registry)
    }

    /// Add `id` to the registry, durably. The in-memory notion of membership is
    /// the file itself — there is no separate in-memory cache to go stale.
    pub async fn add(&self, id: &str) -> Result<(), RegistryError> {
        self.mutate(|ids| {
            ids.insert(id.to_string());
        })
        .await
    }

    /// Remove `id` from the registry, durably. Removing an absent id is a no-op.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        self.mutate(|ids| {
            ids.remove(id);
        })
        .await
    }

    /// A consistent point-in-time view of every in-progress job identifier.
    pub async fn snapshot(&self) -> Result<Vec<String>, RegistryError> {
        let ids = self.read_locked().await?;
        Ok(ids.into_iter().collect())
    }

    /// Number of in-progress jobs, used by the fetcher to decide `job_in_progress`.
    pub async fn count(&self) -> Result<usize, RegistryError> {
        Ok(self.read_locked().await?.len())
    }

    async fn mutate(
        &self,
        f: impl FnOnce(&mut BTreeSet<String>),
    ) -> Result<(), RegistryError> {
        let lock_file = self.open_lock_file().await?;
        lock_file
            .lock_exclusive()
            .map_err(|source| RegistryError::Lock {
                path: self.lock_path.display().to_string(),
                source,
            })?;

        let mut ids = read_ids(&self.path)?;
        f(&mut ids);
        let result = write_ids_atomically(&self.path, &ids);

        // The lock is released when `lock_file` drops at the end of this scope,
        // after the write has landed — readers never observe a partial write
        // while the lock is held.
        result
    }

    async fn read_locked(&self) -> Result<BTreeSet<String>, RegistryError> {
        let lock_file = self.open_lock_file().await?;
        lock_file
            .lock_shared()
            .map_err(|source| RegistryError::Lock {
                path: self.lock_path.display().to_string(),
                source,
            })?;
        read_ids(&self.path)
    }

    async fn open_lock_file(&self) -> Result<std::fs::File, RegistryError> {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| RegistryError::Lock {
                path: self.lock_path.display().to_string(),
                source,
            })
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    PathBuf::from(lock_path)
}

fn read_ids(path: &Path) -> Result<BTreeSet<String>, RegistryError> {
    let mut file = match std::fs::OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(source) => {
            return Err(RegistryError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;

    if contents.trim().is_empty() {
        return Ok(BTreeSet::new());
    }

    let ids: Vec<String> =
        serde_json::from_str(&contents).map_err(|source| RegistryError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    Ok(ids.into_iter().collect())
}

fn write_ids_atomically(path: &Path, ids: &BTreeSet<String>) -> Result<(), RegistryError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let ids: Vec<&String> = ids.iter().collect();
    let serialized = serde_json::to_vec(&ids).expect("job id list is always serializable");

    let map_write_err = |source| RegistryError::Write {
        path: path.display().to_string(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(map_write_err)?;
    tmp.write_all(&serialized).map_err(map_write_err)?;
    tmp.flush().map_err(map_write_err)?;
    tmp.as_file_mut()
        .seek(SeekFrom::Start(0))
        .map_err(map_write_err)?;
    tmp.persist(path).map_err(|e| {
        error!(path = %path.display(), error = %e.error, "failed to persist registry file");
        RegistryError::Write {
            path: path.display().to_string(),
            source: e.error,
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_empty_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProgressRegistry::load(dir.path().join("registry.json"))
            .await
            .unwrap();
        assert_eq!(registry.count().await.unwrap(), 0);
        assert_eq!(registry.snapshot().await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn add_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProgressRegistry::load(dir.path().join("registry.json"))
            .await
            .unwrap();

        registry.add("A").await.unwrap();
        registry.add("B").await.unwrap();
        assert_eq!(registry.count().await.unwrap(), 2);

        registry.remove("A").await.unwrap();
        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let registry = ProgressRegistry::load(&path).await.unwrap();
        registry.add("F").await.unwrap();
        drop(registry);

        // Simulates the restarted worker's first heartbeat (scenario 6).
        let reloaded = ProgressRegistry::load(&path).await.unwrap();
        assert_eq!(reloaded.snapshot().await.unwrap(), vec!["F".to_string()]);
    }

    #[tokio::test]
    async fn remove_absent_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProgressRegistry::load(dir.path().join("registry.json"))
            .await
            .unwrap();
        registry.remove("nonexistent").await.unwrap();
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_mutators_never_lose_an_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = std::sync::Arc::new(ProgressRegistry::load(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.add(&format!("job-{i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.count().await.unwrap(), 20);
    }
}
