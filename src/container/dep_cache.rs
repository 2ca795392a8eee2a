//! Dependency install caching keyed by manifest fingerprint.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::filetree::MountTree;
use super::runtime::ContainerRuntime;
use crate::errors::ContainerError;

/// Length of the hex fingerprint kept as the cache key.
const KEY_LEN: usize = 16;

/// Fingerprint of a manifest's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct DependencyCacheEntry {
    pub key: CacheKey,
    pub snapshot: MountTree,
    pub created_at: DateTime<Utc>,
}

/// Installed-dependency snapshots for the lifetime of a session. Unbounded.
#[derive(Debug, Default)]
pub struct DependencyCache {
    entries: DashMap<CacheKey, DependencyCacheEntry>,
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 of the manifest, hex encoded and truncated.
    pub fn key(manifest: &[u8]) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(manifest);
        let result = hasher.finalize();
        CacheKey(format!("{:x}", result)[..KEY_LEN].to_string())
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &CacheKey) -> Option<DependencyCacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    pub fn set(&self, key: CacheKey, snapshot: MountTree) {
        let entry = DependencyCacheEntry {
            key: key.clone(),
            snapshot,
            created_at: Utc::now(),
        };
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How dependencies ended up in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Restored from a snapshot; no install ran.
    CacheHit { key: CacheKey },
    /// The install command ran and its result is now cached.
    Installed { key: CacheKey },
}

/// Make sure `deps_dir` matches the manifest at `manifest_path`.
///
/// On a cache hit the stored snapshot is restored. Otherwise
/// `install_command` runs in the environment and, if it exits 0, the
/// resulting directory is snapshotted into the cache. Symlinks and
/// executable bits survive the round trip, so `.bin` entries keep working.
pub async fn install_dependencies(
    runtime: &dyn ContainerRuntime,
    cache: &DependencyCache,
    manifest_path: &str,
    deps_dir: &str,
    install_command: &[String],
) -> Result<InstallOutcome, ContainerError> {
    let manifest = runtime.read_file(manifest_path).await?;
    let key = DependencyCache::key(&manifest);

    if let Some(entry) = cache.get(&key) {
        runtime.restore(deps_dir, &entry.snapshot).await?;
        tracing::info!(key = %key, "dependencies restored from cache");
        return Ok(InstallOutcome::CacheHit { key });
    }

    let (program, args) = install_command
        .split_first()
        .ok_or_else(|| ContainerError::SpawnFailed("install command is empty".to_string()))?;
    tracing::info!(key = %key, command = %install_command.join(" "), "installing dependencies");

    let mut process = runtime.spawn(program, args).await?;
    let exit_code = process
        .wait_with_output(|line| tracing::debug!(target: "buildbox::install", "{}", line))
        .await
        .unwrap_or(-1);
    if exit_code != 0 {
        return Err(ContainerError::InstallFailed { exit_code });
    }

    // The install itself succeeded; an unreadable result only costs the cache entry.
    match runtime.snapshot(deps_dir).await {
        Ok(snapshot) => cache.set(key.clone(), snapshot),
        Err(e) => tracing::warn!(key = %key, error = %e, "dependency snapshot failed; not caching"),
    }
    Ok(InstallOutcome::Installed { key })
}
