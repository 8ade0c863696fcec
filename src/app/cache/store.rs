//! Durable cache layout, fetch markers and atomic publication
//!
//! The store is a key-value namespace on a shared filesystem: one
//! subdirectory per key (SHA-256 of the canonical resource name), holding the
//! fetched artifact and, while a fetch is in flight, a sibling `.fetching`
//! marker whose contents name the owning job. Correctness under multi-process
//! concurrency relies on the filesystem's atomic primitives only:
//! exclusive-create for the marker and rename for publication.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::constants::cache;
use crate::errors::{CacheError, CacheResult};

/// Opaque cache key derived from a canonical resource name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a canonical resource name
    pub fn from_canonical(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which storage tier an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Primary shared cache, same filesystem as per-job namespaces
    Primary,
    /// Overflow cache for large artifacts, typically a separate mount
    Overflow,
}

/// Shared-filesystem cache store
#[derive(Debug)]
pub struct CacheStore {
    shared_root: PathBuf,
    overflow_root: Option<PathBuf>,
}

impl CacheStore {
    /// Open (creating if necessary) the store roots
    ///
    /// The overflow root is only retained if it is genuinely distinct
    /// large-capacity storage: it must exist and, where the platform lets us
    /// check, live on a different device than the primary root.
    pub async fn new(shared_root: PathBuf, overflow_root: Option<PathBuf>) -> CacheResult<Self> {
        fs::create_dir_all(&shared_root)
            .await
            .map_err(|_| CacheError::DirectoryNotAccessible {
                path: shared_root.clone(),
            })?;

        let overflow_root = match overflow_root {
            Some(root) => {
                fs::create_dir_all(&root)
                    .await
                    .map_err(|_| CacheError::DirectoryNotAccessible { path: root.clone() })?;
                if is_distinct_mount(&shared_root, &root) {
                    Some(root)
                } else {
                    warn!(
                        "Overflow root {} is not a distinct mount, disabling overflow tier",
                        root.display()
                    );
                    None
                }
            }
            None => None,
        };

        info!("Opened cache store at {}", shared_root.display());
        Ok(Self {
            shared_root,
            overflow_root,
        })
    }

    /// Whether a distinct overflow tier is available
    pub fn overflow_available(&self) -> bool {
        self.overflow_root.is_some()
    }

    fn root(&self, tier: CacheTier) -> &Path {
        match tier {
            CacheTier::Primary => &self.shared_root,
            CacheTier::Overflow => self.overflow_root.as_deref().unwrap_or(&self.shared_root),
        }
    }

    /// Deterministic artifact location for a key within a tier
    ///
    /// Creates the containing directory (never the file). Stable across
    /// processes and hosts sharing the filesystem.
    pub async fn location_for(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        artifact_name: &str,
    ) -> CacheResult<PathBuf> {
        let dir = self.root(tier).join(key.as_str());
        fs::create_dir_all(&dir)
            .await
            .map_err(|_| CacheError::DirectoryNotAccessible { path: dir.clone() })?;
        Ok(dir.join(artifact_name))
    }

    /// Find an already-published artifact in either tier
    ///
    /// Presence is judged on the final artifact path only, never the marker,
    /// so a concurrent reader can never see a partially written entry.
    pub fn find_present(&self, key: &CacheKey, artifact_name: &str) -> Option<(CacheTier, PathBuf)> {
        for tier in [CacheTier::Primary, CacheTier::Overflow] {
            if tier == CacheTier::Overflow && self.overflow_root.is_none() {
                continue;
            }
            let path = self.root(tier).join(key.as_str()).join(artifact_name);
            if path.exists() {
                return Some((tier, path));
            }
        }
        None
    }

    /// Find an in-flight fetch marker for a key in either tier
    pub fn find_marker(&self, key: &CacheKey, artifact_name: &str) -> Option<(CacheTier, PathBuf)> {
        for tier in [CacheTier::Primary, CacheTier::Overflow] {
            if tier == CacheTier::Overflow && self.overflow_root.is_none() {
                continue;
            }
            let path = marker_path(&self.root(tier).join(key.as_str()).join(artifact_name));
            if path.exists() {
                return Some((tier, path));
            }
        }
        None
    }

    /// Create the fetch marker for an entry, recording the owner
    ///
    /// First writer wins: returns `Ok(false)` without touching the existing
    /// marker if another owner got there first.
    pub async fn mark_fetching(&self, entry: &Path, owner: &str) -> CacheResult<bool> {
        let marker = marker_path(entry);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(mut file) => {
                file.write_all(owner.as_bytes()).await.map_err(|e| {
                    CacheError::Marker {
                        key: entry.display().to_string(),
                        source: e,
                    }
                })?;
                file.flush().await.ok();
                debug!("Marked fetching {} (owner {})", entry.display(), owner);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CacheError::Marker {
                key: entry.display().to_string(),
                source: e,
            }),
        }
    }

    /// Remove the fetch marker; safe to call when none exists
    pub async fn clear_fetching(&self, entry: &Path) {
        let marker = marker_path(entry);
        match fs::remove_file(&marker).await {
            Ok(()) => debug!("Cleared fetch marker {}", marker.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not clear fetch marker {}: {}", marker.display(), e),
        }
    }

    /// Read the owner recorded in an entry's fetch marker
    pub async fn marker_owner(&self, entry: &Path) -> Option<String> {
        let marker = marker_path(entry);
        fs::read_to_string(&marker)
            .await
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Atomically publish a completed fetch: rename the temp artifact onto
    /// its final name and open permissions for other cache users
    pub async fn publish(&self, temp: &Path, entry: &Path) -> CacheResult<()> {
        fs::rename(temp, entry).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(entry, std::fs::Permissions::from_mode(0o775)).await;
        }
        info!("Published cache entry {}", entry.display());
        Ok(())
    }

    /// Materialize an entry into a caller-local path
    ///
    /// Primary-tier entries are hard linked so per-job cleanup can never
    /// truncate the shared copy. Overflow entries live on a different
    /// filesystem, so a symlink is used instead.
    pub fn link_out(&self, tier: CacheTier, entry: &Path, dest: &Path) -> CacheResult<()> {
        if dest.exists() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let result = match tier {
            CacheTier::Primary => std::fs::hard_link(entry, dest),
            CacheTier::Overflow => symlink(entry, dest),
        };
        result.map_err(|e| CacheError::LinkFailed {
            path: dest.to_path_buf(),
            source: e,
        })
    }

    /// Delete an entry's directory from both tiers
    pub async fn remove_entry(&self, key: &CacheKey) -> CacheResult<()> {
        for tier in [CacheTier::Primary, CacheTier::Overflow] {
            if tier == CacheTier::Overflow && self.overflow_root.is_none() {
                continue;
            }
            let dir = self.root(tier).join(key.as_str());
            match fs::remove_dir_all(&dir).await {
                Ok(()) => info!("Removed cache entry {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
        Ok(())
    }

    /// Remove entries not touched for `age_days`, returning how many were
    /// deleted. In-flight entries are protected by their markers' mtimes.
    pub async fn cleanup(&self, age_days: u64) -> CacheResult<usize> {
        let roots: Vec<PathBuf> = [Some(self.shared_root.clone()), self.overflow_root.clone()]
            .into_iter()
            .flatten()
            .collect();
        let cutoff = Duration::from_secs(age_days * 24 * 3600);

        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0usize;
            let now = SystemTime::now();
            for root in roots {
                let entries = match std::fs::read_dir(&root) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let age = newest_mtime(&path)
                        .and_then(|mtime| now.duration_since(mtime).ok())
                        .unwrap_or(Duration::ZERO);
                    if age > cutoff {
                        debug!("Cleanup removing {}", path.display());
                        if std::fs::remove_dir_all(&path).is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
            removed
        })
        .await
        .unwrap_or(0);

        if removed > 0 {
            info!("Cache cleanup removed {} entries", removed);
        }
        Ok(removed)
    }
}

/// Marker path for an entry (`<entry>.fetching`)
pub fn marker_path(entry: &Path) -> PathBuf {
    let mut name = entry.as_os_str().to_os_string();
    name.push(cache::FETCHING_SUFFIX);
    PathBuf::from(name)
}

/// Temp path for an entry's in-progress download (`<entry>.part`)
pub fn temp_path(entry: &Path) -> PathBuf {
    let mut name = entry.as_os_str().to_os_string();
    name.push(cache::TEMP_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Newest mtime of any file directly inside an entry directory
fn newest_mtime(dir: &Path) -> Option<SystemTime> {
    let mut newest = std::fs::metadata(dir).ok()?.modified().ok()?;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
                if mtime > newest {
                    newest = mtime;
                }
            }
        }
    }
    Some(newest)
}

#[cfg(unix)]
fn symlink(entry: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(entry, dest)
}

#[cfg(not(unix))]
fn symlink(entry: &Path, dest: &Path) -> std::io::Result<()> {
    // No cheap cross-filesystem link primitive; fall back to a copy
    std::fs::copy(entry, dest).map(|_| ())
}

#[cfg(unix)]
fn is_distinct_mount(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() != mb.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_distinct_mount(_a: &Path, b: &Path) -> bool {
    b.exists()
}
