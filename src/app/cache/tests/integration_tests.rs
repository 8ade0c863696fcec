//! End-to-end tests of the fetch coordination protocol
//!
//! A stub transport counts fetches and serves canned content, so the
//! at-most-one-fetch, marker-release and staleness properties can be
//! asserted without a network.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::app::cache::store::{CacheKey, CacheStore, CacheTier};
use crate::app::cache::{CacheConfig, FetchCoordinator, FetchOptions, NoJobs};
use crate::app::client::Transport;
use crate::app::resolver::{NameResolver, ResolverConfig};
use crate::errors::{CacheError, FetchError, FetchResult};

/// Transport stub serving canned content with call counting
struct StubTransport {
    files: std::sync::Mutex<HashMap<String, Vec<u8>>>,
    fetch_count: AtomicUsize,
    probe_count: AtomicUsize,
    fail_probes: AtomicBool,
    fail_fetches: AtomicBool,
    fetch_delay: Duration,
}

impl StubTransport {
    fn new(files: &[(&str, &[u8])]) -> Arc<Self> {
        Self::with_delay(files, Duration::ZERO)
    }

    fn with_delay(files: &[(&str, &[u8])], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            files: std::sync::Mutex::new(
                files
                    .iter()
                    .map(|(url, content)| (url.to_string(), content.to_vec()))
                    .collect(),
            ),
            fetch_count: AtomicUsize::new(0),
            probe_count: AtomicUsize::new(0),
            fail_probes: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            fetch_delay: delay,
        })
    }

    fn set_content(&self, url: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), content.to_vec());
    }

    fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> FetchResult<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::ServerError {
                status: 404,
                url: url.to_string(),
            })
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn probe_size(&self, url: &str) -> FetchResult<Option<u64>> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(FetchError::ServerError {
                status: 503,
                url: url.to_string(),
            });
        }
        Ok(Some(self.lookup(url)?.len() as u64))
    }

    async fn get_text(&self, url: &str) -> FetchResult<String> {
        Ok(String::from_utf8_lossy(&self.lookup(url)?).to_string())
    }

    async fn fetch_single(&self, url: &str, dest: &Path) -> FetchResult<()> {
        tokio::time::sleep(self.fetch_delay).await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(FetchError::ServerError {
                status: 500,
                url: url.to_string(),
            });
        }
        let content = self.lookup(url)?;
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, content).await?;
        Ok(())
    }

    async fn fetch_wildcard(&self, url: &str, dest: &Path) -> FetchResult<()> {
        let prefix = url.split('*').next().unwrap_or(url).to_string();
        let matched = self
            .files
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone());
        match matched {
            Some(concrete) => self.fetch_single(&concrete, dest).await,
            None => Err(FetchError::NoMatches {
                pattern: url.to_string(),
            }),
        }
    }

    async fn fetch_directory(&self, url: &str, dest: &Path) -> FetchResult<()> {
        self.fetch_single(url, dest).await
    }

    async fn fetch_multi(&self, url: &str, dest: &Path) -> FetchResult<()> {
        self.fetch_single(url, dest).await
    }
}

fn fast_config(shared: &TempDir) -> CacheConfig {
    CacheConfig {
        shared_root: Some(shared.path().to_path_buf()),
        poll_interval: Duration::from_millis(10),
        primary_wait_timeout: Duration::from_millis(200),
        overflow_wait_timeout: Duration::from_millis(400),
        ..Default::default()
    }
}

fn resolver() -> NameResolver {
    NameResolver::new(ResolverConfig {
        input_dir: "http://files".to_string(),
        http_export_prefix: "http://files".to_string(),
        ..Default::default()
    })
}

async fn coordinator(shared: &TempDir, transport: Arc<StubTransport>) -> FetchCoordinator {
    FetchCoordinator::new(fast_config(shared), resolver(), transport, Arc::new(NoJobs))
        .await
        .unwrap()
}

const URL: &str = "http://files/build/123/image.iso";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_fetch_for_concurrent_callers() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::with_delay(
        &[(URL, b"image-bytes")],
        Duration::from_millis(50),
    );
    let coordinator = Arc::new(coordinator(&shared, transport.clone()).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = coordinator.clone();
        handles.push(tokio::spawn(async move { c.get_resource(URL).await }));
    }

    let mut paths = Vec::new();
    for handle in handles {
        paths.push(handle.await.unwrap().expect("all callers get the file"));
    }

    assert_eq!(transport.fetches(), 1, "exactly one transport fetch");
    for path in &paths {
        assert_eq!(std::fs::read(path).unwrap(), b"image-bytes");
    }
}

#[tokio::test]
async fn test_second_call_performs_no_transport_activity() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"image-bytes")]);
    let coordinator = coordinator(&shared, transport.clone()).await;

    let first = coordinator.get_resource(URL).await.unwrap();
    let fetches = transport.fetches();
    let probes = transport.probe_count.load(Ordering::SeqCst);

    let second = coordinator.get_resource(URL).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::read(&second).unwrap(), b"image-bytes");
    assert_eq!(transport.fetches(), fetches);
    assert_eq!(transport.probe_count.load(Ordering::SeqCst), probes);
}

#[tokio::test]
async fn test_marker_cleared_on_success_and_failure() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"image-bytes")]);
    let coordinator = coordinator(&shared, transport.clone()).await;

    coordinator.get_resource(URL).await.unwrap();
    assert!(no_markers_below(shared.path()));

    transport.fail_fetches.store(true, Ordering::SeqCst);
    let missing = "http://files/build/123/other.iso";
    assert!(coordinator.get_resource(missing).await.is_none());
    assert!(no_markers_below(shared.path()));
    // No partial artifact left behind either
    assert!(no_partials_below(shared.path()));
}

#[tokio::test]
async fn test_wait_timeout_is_a_distinct_error() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"image-bytes")]);
    let coordinator = coordinator(&shared, transport.clone()).await;

    // Plant a marker owned by an unverifiable fetcher
    let store = CacheStore::new(shared.path().to_path_buf(), None)
        .await
        .unwrap();
    let key = CacheKey::from_canonical(URL);
    let entry = store
        .location_for(CacheTier::Primary, &key, "image.iso")
        .await
        .unwrap();
    store.mark_fetching(&entry, "nojob").await.unwrap();

    let err = coordinator
        .obtain(URL, FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::WaitTimeout { .. }));
    assert_eq!(transport.fetches(), 0);
}

#[tokio::test]
async fn test_stale_marker_from_dead_owner_is_cleared_by_waiter() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"image-bytes")]);
    let coordinator = coordinator(&shared, transport.clone()).await;

    let store = CacheStore::new(shared.path().to_path_buf(), None)
        .await
        .unwrap();
    let key = CacheKey::from_canonical(URL);
    let entry = store
        .location_for(CacheTier::Primary, &key, "image.iso")
        .await
        .unwrap();
    // NoJobs reports job-99 as dead, so the waiter may clear this
    store.mark_fetching(&entry, "job-99").await.unwrap();

    let path = coordinator.get_resource(URL).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"image-bytes");
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_staleness_conflict_and_replace() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"old-bytes")]);

    let first = coordinator(&shared, transport.clone()).await;
    first.get_resource(URL).await.unwrap();

    // The source now reports a different size
    transport.set_content(URL, b"new-and-longer-bytes");

    // A fresh coordinator (empty per-job namespace) must notice
    let second = coordinator(&shared, transport.clone()).await;
    let err = second
        .obtain(URL, FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Stale { .. }));

    // Opting into replacement refetches
    let path = second
        .obtain(
            URL,
            FetchOptions {
                replace_if_differs: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"new-and-longer-bytes");
    assert_eq!(transport.fetches(), 2);
}

#[tokio::test]
async fn test_probe_failure_never_invalidates_cached_artifact() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"image-bytes")]);

    let first = coordinator(&shared, transport.clone()).await;
    first.get_resource(URL).await.unwrap();

    transport.fail_probes.store(true, Ordering::SeqCst);
    let second = coordinator(&shared, transport.clone()).await;
    let path = second.obtain(URL, FetchOptions::default()).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"image-bytes");
    assert_eq!(transport.fetches(), 1);
}

#[tokio::test]
async fn test_evict_forces_refetch() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"image-bytes")]);
    let coordinator = coordinator(&shared, transport.clone()).await;

    coordinator.get_resource(URL).await.unwrap();
    coordinator.evict(URL).await.unwrap();

    // A fresh coordinator sees nothing cached
    let other = self::coordinator(&shared, transport.clone()).await;
    other.get_resource(URL).await.unwrap();
    assert_eq!(transport.fetches(), 2);
}

#[tokio::test]
async fn test_resource_exists() {
    let shared = TempDir::new().unwrap();
    let transport = StubTransport::new(&[(URL, b"image-bytes")]);
    let coordinator = coordinator(&shared, transport.clone()).await;

    // Uncached but probe-able
    assert!(coordinator.resource_exists(URL).await);
    assert_eq!(transport.fetches(), 0);

    // Unknown and unreachable
    assert!(!coordinator.resource_exists("http://files/nope.iso").await);

    // Cached, even when the source later disappears
    coordinator.get_resource(URL).await.unwrap();
    transport.fail_probes.store(true, Ordering::SeqCst);
    assert!(coordinator.resource_exists(URL).await);
}

#[tokio::test]
async fn test_wildcard_spec_resolves_and_caches() {
    let shared = TempDir::new().unwrap();
    let concrete = "http://files/build/tools-1.2.3.rpm";
    let transport = StubTransport::new(&[(concrete, b"rpm-bytes")]);
    let coordinator = coordinator(&shared, transport.clone()).await;

    let path = coordinator
        .get_resource("http://files/build/tools-*.rpm")
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"rpm-bytes");
    assert!(path.to_string_lossy().contains("tools-WILDCARD.rpm"));

    // Cached under the canonical wildcard name
    coordinator
        .get_resource("http://files/build/tools-*.rpm")
        .await
        .unwrap();
    assert_eq!(transport.fetches(), 1);
}

fn no_markers_below(root: &Path) -> bool {
    !any_file_with_suffix(root, ".fetching")
}

fn no_partials_below(root: &Path) -> bool {
    !any_file_with_suffix(root, ".part")
}

fn any_file_with_suffix(root: &Path, suffix: &str) -> bool {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if any_file_with_suffix(&path, suffix) {
                return true;
            }
        } else if path.to_string_lossy().ends_with(suffix) {
            return true;
        }
    }
    false
}
