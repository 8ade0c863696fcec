//! The at-most-one-fetch protocol and public cache API
//!
//! For a given key, at most one process holds the fetch marker at a time.
//! Every other caller either observes the published artifact (and links it
//! into its per-job namespace) or the marker (and waits, bounded). Presence
//! is only ever judged on the final artifact path, which only comes into
//! being via atomic rename, so "absent" and "present" can never be observed
//! inconsistently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::cache::config::CacheConfig;
use crate::app::cache::jobs::JobOracle;
use crate::app::cache::store::{marker_path, temp_path, CacheKey, CacheStore, CacheTier};
use crate::app::client::Transport;
use crate::app::resolver::{FetchShape, NameResolver, ResolvedName};
use crate::constants::cache;
use crate::errors::{CacheError, CacheResult};

/// Per-request fetch options
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Treat the spec as a multi-file pattern packed into one artifact
    pub multiple: bool,
    /// On a size mismatch with the source, evict and refetch instead of
    /// reporting the cached artifact as stale
    pub replace_if_differs: bool,
}

/// Coordinates fetches into the shared cache and materializes per-job links
pub struct FetchCoordinator {
    config: CacheConfig,
    store: CacheStore,
    resolver: NameResolver,
    transport: Arc<dyn Transport>,
    jobs: Arc<dyn JobOracle>,
    job_root: PathBuf,
    // Owns the per-job namespace when nobody supplied one
    _job_dir: Option<tempfile::TempDir>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("job_root", &self.job_root)
            .finish()
    }
}

impl FetchCoordinator {
    /// Create a coordinator with its own temp per-job namespace
    pub async fn new(
        config: CacheConfig,
        resolver: NameResolver,
        transport: Arc<dyn Transport>,
        jobs: Arc<dyn JobOracle>,
    ) -> CacheResult<Self> {
        let shared_root = match &config.shared_root {
            Some(path) => path.clone(),
            None => default_cache_dir()?,
        };
        let store = CacheStore::new(shared_root, config.overflow_root.clone()).await?;

        let job_dir = tempfile::tempdir()?;
        let job_root = job_dir.path().to_path_buf();
        info!("Per-job cache namespace at {}", job_root.display());

        Ok(Self {
            config,
            store,
            resolver,
            transport,
            jobs,
            job_root,
            _job_dir: Some(job_dir),
        })
    }

    /// Obtain a resource by name
    ///
    /// The single blocking call test code uses to get any artifact. Returns
    /// `None` when the resource could not be obtained for any reason; the
    /// underlying fault is logged. Callers decide their own retry policy.
    pub async fn get_resource(&self, spec: &str) -> Option<PathBuf> {
        self.get_resource_with(spec, FetchOptions::default()).await
    }

    /// Obtain a resource with explicit options
    pub async fn get_resource_with(&self, spec: &str, options: FetchOptions) -> Option<PathBuf> {
        match self.obtain(spec, options).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Could not fetch {}: {}", spec, e);
                None
            }
        }
    }

    /// Obtain a resource, surfacing the typed failure
    ///
    /// Wait timeouts, transport failures and staleness conflicts stay
    /// distinguishable here; `get_resource` flattens them to `None`.
    pub async fn obtain(&self, spec: &str, options: FetchOptions) -> CacheResult<PathBuf> {
        let resolved = self
            .resolver
            .resolve_with_probes(spec, options.multiple, self.transport.as_ref())
            .await;
        let key = CacheKey::from_canonical(resolved.canonical_name());
        let artifact = resolved.artifact_name().to_string();
        debug!("Resolved {} to {} (key {})", spec, resolved.url(), key);

        let per_job = self.job_root.join(key.as_str()).join(&artifact);
        if per_job.exists() {
            debug!("Found {} in per-job cache", spec);
            return Ok(per_job);
        }

        let started = Instant::now();
        loop {
            // Already published: validate and link out
            if let Some((tier, entry)) = self.store.find_present(&key, &artifact) {
                if resolved.shape() == FetchShape::Single {
                    self.validate(&resolved, &key, &entry, options.replace_if_differs)
                        .await?;
                    if !entry.exists() {
                        // Evicted for replacement, fetch afresh
                        continue;
                    }
                }
                debug!("Found {} in shared cache ({:?} tier)", spec, tier);
                self.store.link_out(tier, &entry, &per_job)?;
                return Ok(per_job);
            }

            // Someone else is fetching: wait, bounded, unless they are dead
            if let Some((tier, entry)) = self.store.find_marker(&key, &artifact) {
                if let Some(owner) = self.store.marker_owner(&entry).await {
                    if owner != cache::NO_JOB_OWNER && !self.jobs.is_job_running(&owner).await {
                        warn!(
                            "Clearing stale fetch marker for {} (owner {} no longer running)",
                            spec, owner
                        );
                        self.store.clear_fetching(&entry).await;
                        continue;
                    }
                }
                let budget = self.wait_budget(tier);
                if started.elapsed() >= budget {
                    return Err(CacheError::WaitTimeout {
                        key: resolved.canonical_name().to_string(),
                        seconds: budget.as_secs(),
                    });
                }
                debug!("{} is being fetched elsewhere, waiting", spec);
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            // Nobody has it: try to become the fetcher
            let tier = self.choose_tier(&resolved).await;
            let entry = self.store.location_for(tier, &key, &artifact).await?;
            if !self
                .store
                .mark_fetching(&entry, self.config.marker_owner())
                .await?
            {
                // Lost the race, fall back to waiting
                continue;
            }

            let _guard = MarkerGuard::new(&entry);
            let temp = temp_path(&entry);
            let fetched = match resolved.shape() {
                FetchShape::Single => self.transport.fetch_single(resolved.url(), &temp).await,
                FetchShape::SingleWildcard => {
                    self.transport.fetch_wildcard(resolved.url(), &temp).await
                }
                FetchShape::Directory => {
                    self.transport.fetch_directory(resolved.url(), &temp).await
                }
                FetchShape::MultiFile => self.transport.fetch_multi(resolved.url(), &temp).await,
            };

            // The guard clears the marker and any partial artifact whatever
            // happens past this point, including the error path below.
            fetched.map_err(CacheError::Fetch)?;
            self.store.publish(&temp, &entry).await?;
            self.store.link_out(tier, &entry, &per_job)?;
            return Ok(per_job);
        }
    }

    /// Check whether a resource is cached or fetchable
    pub async fn resource_exists(&self, spec: &str) -> bool {
        let resolved = self
            .resolver
            .resolve_with_probes(spec, false, self.transport.as_ref())
            .await;
        let key = CacheKey::from_canonical(resolved.canonical_name());
        let artifact = resolved.artifact_name();

        if self.job_root.join(key.as_str()).join(artifact).exists() {
            return true;
        }
        if self.store.find_present(&key, artifact).is_some() {
            return true;
        }
        self.transport.probe_size(resolved.url()).await.is_ok()
    }

    /// Force removal of a resource from the shared cache
    pub async fn evict(&self, spec: &str) -> CacheResult<()> {
        let resolved = self
            .resolver
            .resolve_with_probes(spec, false, self.transport.as_ref())
            .await;
        let key = CacheKey::from_canonical(resolved.canonical_name());
        info!("Evicting {} (key {})", spec, key);
        self.store.remove_entry(&key).await
    }

    /// Remove shared entries untouched for `days` (default from config)
    pub async fn cleanup(&self, days: Option<u64>) -> CacheResult<usize> {
        self.store
            .cleanup(days.unwrap_or(self.config.cleanup_age_days))
            .await
    }

    fn wait_budget(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Primary => self.config.primary_wait_timeout,
            CacheTier::Overflow => self.config.overflow_wait_timeout,
        }
    }

    /// Decide the storage tier before fetching, from a HEAD size probe
    async fn choose_tier(&self, resolved: &ResolvedName) -> CacheTier {
        if !self.store.overflow_available() || resolved.shape() != FetchShape::Single {
            return CacheTier::Primary;
        }
        match self.transport.probe_size(resolved.url()).await {
            Ok(Some(size)) if size > self.config.overflow_threshold => {
                debug!(
                    "{} is {} bytes, routing to overflow tier",
                    resolved.url(),
                    size
                );
                CacheTier::Overflow
            }
            _ => CacheTier::Primary,
        }
    }

    /// Validate a cached single-file artifact against the source's reported
    /// size. Probe failures never invalidate: being unable to confirm is not
    /// the same as confirmed staleness.
    async fn validate(
        &self,
        resolved: &ResolvedName,
        key: &CacheKey,
        entry: &Path,
        replace_if_differs: bool,
    ) -> CacheResult<()> {
        let source_size = match self.transport.probe_size(resolved.url()).await {
            Ok(Some(size)) => size,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!("Size probe for {} failed ({}), keeping cached copy", resolved.url(), e);
                return Ok(());
            }
        };

        let cached_size = tokio::fs::metadata(entry).await?.len();
        if cached_size == source_size {
            return Ok(());
        }

        if replace_if_differs {
            warn!(
                "Cached {} is {} bytes but source reports {}, refetching",
                resolved.url(),
                cached_size,
                source_size
            );
            self.store.remove_entry(key).await?;
            Ok(())
        } else {
            Err(CacheError::Stale {
                key: resolved.canonical_name().to_string(),
                cached_size,
                source_size,
            })
        }
    }
}

/// Guaranteed-release guard around a fetch attempt
///
/// Clears the fetch marker and any partial artifact when dropped, so one
/// failed fetch can never permanently wedge the key for other callers.
struct MarkerGuard {
    marker: PathBuf,
    temp: PathBuf,
}

impl MarkerGuard {
    fn new(entry: &Path) -> Self {
        Self {
            marker: marker_path(entry),
            temp: temp_path(entry),
        }
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        if self.temp.exists() {
            let _ = std::fs::remove_file(&self.temp);
        }
        let _ = std::fs::remove_file(&self.marker);
    }
}

fn default_cache_dir() -> CacheResult<PathBuf> {
    let dir = dirs::cache_dir()
        .ok_or_else(|| CacheError::DirectoryNotAccessible {
            path: PathBuf::from("system cache directory"),
        })?
        .join("rigpool");
    Ok(dir)
}
