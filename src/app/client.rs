//! HTTP transport for artifact sources
//!
//! Provides a rate-limited HTTP client with streaming downloads, HEAD size
//! probes, and recursive index-page listings for wildcard, multi-file and
//! whole-directory fetches. The [`Transport`] trait is the seam the fetch
//! coordinator depends on, so tests can count fetches and alternate
//! transports (e.g. SFTP) can be slotted in without touching the cache.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use governor::{clock::DefaultClock, state::InMemoryState, Quota, RateLimiter};
use reqwest::Client;
use scraper::{Html, Selector};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::constants::{cache, http};
use crate::errors::{FetchError, FetchResult};

/// Retrieval capability consumed by the fetch coordinator
///
/// A destination path always refers to a not-yet-published temporary
/// location; atomic publication is the caller's responsibility.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Probe the source's reported content length without fetching the body
    ///
    /// `Ok(None)` means the source is reachable but does not report a length.
    async fn probe_size(&self, url: &str) -> FetchResult<Option<u64>>;

    /// Fetch a small text resource into memory
    async fn get_text(&self, url: &str) -> FetchResult<String>;

    /// Stream a single file to `dest`
    async fn fetch_single(&self, url: &str, dest: &Path) -> FetchResult<()>;

    /// Fetch the first file matching a wildcard pattern to `dest`
    async fn fetch_wildcard(&self, url: &str, dest: &Path) -> FetchResult<()>;

    /// Mirror a directory tree and pack it into a single artifact at `dest`
    async fn fetch_directory(&self, url: &str, dest: &Path) -> FetchResult<()>;

    /// Fetch all files matching the spec's basename patterns and pack them
    /// into a single artifact at `dest`
    async fn fetch_multi(&self, url: &str, dest: &Path) -> FetchResult<()>;
}

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Optional HTTP proxy applied to all requests
    pub proxy: Option<String>,
    /// Request timeout
    pub request_timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Connection pool idle timeout
    pub pool_idle_timeout: Option<Duration>,
    /// Maximum number of connections per host
    pub pool_max_per_host: usize,
    /// Rate limit (requests per second)
    pub rate_limit_rps: u32,
    /// Listing depth for multi-file pattern fetches
    pub multi_file_depth: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            request_timeout: http::DEFAULT_TIMEOUT,
            connect_timeout: http::CONNECT_TIMEOUT,
            pool_idle_timeout: Some(http::POOL_IDLE_TIMEOUT),
            pool_max_per_host: http::POOL_MAX_PER_HOST,
            rate_limit_rps: http::DEFAULT_RATE_LIMIT_RPS,
            multi_file_depth: cache::MULTI_FILE_LIST_DEPTH,
        }
    }
}

/// One entry discovered on a directory index page
#[derive(Debug, Clone)]
struct ListingEntry {
    url: Url,
    name: String,
    is_dir: bool,
}

/// Rate-limited HTTP transport
pub struct HttpTransport {
    client: Client,
    rate_limiter: RateLimiter<governor::state::NotKeyed, InMemoryState, DefaultClock>,
    multi_file_depth: u32,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("multi_file_depth", &self.multi_file_depth)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport with default configuration
    pub fn new() -> FetchResult<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a transport with custom configuration
    pub fn with_config(config: ClientConfig) -> FetchResult<Self> {
        let mut builder = Client::builder()
            .user_agent(http::USER_AGENT)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_per_host);

        if let Some(idle) = config.pool_idle_timeout {
            builder = builder.pool_idle_timeout(idle);
        }

        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| FetchError::InvalidUrl {
                url: proxy.clone(),
                error: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build()?;

        let rps = NonZeroU32::new(config.rate_limit_rps).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rps));

        Ok(Self {
            client,
            rate_limiter,
            multi_file_depth: config.multi_file_depth,
        })
    }

    fn parse_url(url: &str) -> FetchResult<Url> {
        Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            error: e.to_string(),
        })
    }

    async fn get_response(&self, url: &Url) -> FetchResult<reqwest::Response> {
        self.rate_limiter.until_ready().await;
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::ServerError {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Stream a response body to a file
    async fn stream_to_file(&self, url: &Url, dest: &Path) -> FetchResult<()> {
        let response = self.get_response(url).await?;

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!("Downloaded {} to {}", url, dest.display());
        Ok(())
    }

    /// Parse an HTML index page into its directory entries
    fn parse_index(page: &str, base: &Url) -> Vec<ListingEntry> {
        let document = Html::parse_document(page);
        let selector = Selector::parse("a[href]").expect("static selector");

        let mut entries = Vec::new();
        for element in document.select(&selector) {
            let href = match element.value().attr("href") {
                Some(h) => h,
                None => continue,
            };
            // Skip navigation, sort and query links
            if href.starts_with('?') || href.starts_with('#') || href.contains("../") {
                continue;
            }
            let url = match base.join(href) {
                Ok(u) => u,
                Err(_) => continue,
            };
            // Only descend, never escape the listing root
            if !url.as_str().starts_with(base.as_str()) || url.as_str() == base.as_str() {
                continue;
            }
            let is_dir = url.path().ends_with('/');
            let name = url
                .path_segments()
                .and_then(|s| s.rev().find(|p| !p.is_empty()))
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            entries.push(ListingEntry { url, name, is_dir });
        }
        entries
    }

    /// List a directory index page
    async fn list_directory(&self, url: &Url) -> FetchResult<Vec<ListingEntry>> {
        let page = self.get_response(url).await?.text().await?;
        Ok(Self::parse_index(&page, url))
    }

    /// Recursively list files below `url` up to `depth` levels
    fn list_recursive<'a>(
        &'a self,
        url: Url,
        depth: u32,
    ) -> BoxFuture<'a, FetchResult<Vec<ListingEntry>>> {
        Box::pin(async move {
            let mut files = Vec::new();
            let entries = self.list_directory(&url).await?;
            for entry in entries {
                if entry.is_dir {
                    if depth > 1 {
                        match self.list_recursive(entry.url.clone(), depth - 1).await {
                            Ok(mut sub) => files.append(&mut sub),
                            Err(e) => warn!("Skipping unlistable {}: {}", entry.url, e),
                        }
                    }
                } else {
                    files.push(entry);
                }
            }
            Ok(files)
        })
    }

    /// Mirror a directory tree below `url` into `dest_dir`
    fn mirror<'a>(&'a self, url: Url, dest_dir: PathBuf) -> BoxFuture<'a, FetchResult<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&dest_dir).await?;
            let entries = self.list_directory(&url).await?;
            for entry in entries {
                if entry.is_dir {
                    self.mirror(entry.url, dest_dir.join(&entry.name)).await?;
                } else {
                    self.stream_to_file(&entry.url, &dest_dir.join(&entry.name))
                        .await?;
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe_size(&self, url: &str) -> FetchResult<Option<u64>> {
        let url = Self::parse_url(url)?;
        self.rate_limiter.until_ready().await;
        let response = self.client.head(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::ServerError {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.content_length())
    }

    async fn get_text(&self, url: &str) -> FetchResult<String> {
        let url = Self::parse_url(url)?;
        Ok(self.get_response(&url).await?.text().await?)
    }

    async fn fetch_single(&self, url: &str, dest: &Path) -> FetchResult<()> {
        let url = Self::parse_url(url)?;
        self.stream_to_file(&url, dest).await
    }

    async fn fetch_wildcard(&self, url: &str, dest: &Path) -> FetchResult<()> {
        // Split at the first path segment containing the wildcard; the
        // remainder is the accept pattern matched against listed basenames.
        let star = url.find('*').ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            error: "wildcard fetch without '*'".to_string(),
        })?;
        let split = url[..star].rfind('/').map(|i| i + 1).unwrap_or(0);
        let base = Self::parse_url(&url[..split])?;
        let pattern = &url[split..];

        let files = self.list_recursive(base, 1).await?;
        let matched = files
            .into_iter()
            .find(|f| wildcard_match(pattern, &f.name))
            .ok_or_else(|| FetchError::NoMatches {
                pattern: pattern.to_string(),
            })?;

        debug!("Wildcard {} matched {}", pattern, matched.name);
        self.stream_to_file(&matched.url, dest).await
    }

    async fn fetch_directory(&self, url: &str, dest: &Path) -> FetchResult<()> {
        let url = Self::parse_url(url)?;
        let staging = tempfile::tempdir()?;
        self.mirror(url, staging.path().to_path_buf()).await?;

        let src = staging.path().to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || crate::app::archive::pack_dir(&src, &dest))
            .await
            .map_err(|e| FetchError::Archive {
                reason: format!("archiver task failed: {}", e),
            })?
    }

    async fn fetch_multi(&self, url: &str, dest: &Path) -> FetchResult<()> {
        let split = url.rfind('/').map(|i| i + 1).unwrap_or(0);
        let base = Self::parse_url(&url[..split])?;
        let stem = &url[split..];
        // The basename itself plus numbered split parts (e.g. img.iso.0, .1)
        let patterns = [stem.to_string(), format!("{}.[0-9]*", stem)];

        let files = self.list_recursive(base, self.multi_file_depth).await?;
        let matched: Vec<_> = files
            .into_iter()
            .filter(|f| patterns.iter().any(|p| wildcard_match(p, &f.name)))
            .collect();
        if matched.is_empty() {
            return Err(FetchError::NoMatches {
                pattern: patterns.join(","),
            });
        }

        let staging = tempfile::tempdir()?;
        for file in &matched {
            self.stream_to_file(&file.url, &staging.path().join(&file.name))
                .await?;
        }
        debug!("Fetched {} files for multi-file spec {}", matched.len(), url);

        let src = staging.path().to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || crate::app::archive::pack_dir(&src, &dest))
            .await
            .map_err(|e| FetchError::Archive {
                reason: format!("archiver task failed: {}", e),
            })?
    }
}

/// Match a name against a shell-style pattern supporting `*` and `[0-9]`
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some('['), Some(c)) => {
                // Character class, e.g. [0-9]
                if let Some(close) = p.iter().position(|&x| x == ']') {
                    let class = &p[1..close];
                    let matched = if class.len() == 3 && class[1] == '-' {
                        *c >= class[0] && *c <= class[2]
                    } else {
                        class.contains(c)
                    };
                    matched && inner(&p[close + 1..], &n[1..])
                } else {
                    false
                }
            }
            (Some(pc), Some(nc)) => pc == nc && inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    inner(&p, &n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert!(config.proxy.is_none());
        assert_eq!(config.multi_file_depth, 2);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("tools-*.rpm", "tools-1.2.3.rpm"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("tools-*.rpm", "tools-1.2.3.deb"));
        assert!(wildcard_match("img.iso.[0-9]*", "img.iso.12"));
        assert!(!wildcard_match("img.iso.[0-9]*", "img.iso.bak"));
        assert!(wildcard_match("exact.txt", "exact.txt"));
    }

    #[test]
    fn test_parse_index_classifies_entries() {
        let base = Url::parse("http://host/build/").unwrap();
        let page = r#"
            <html><body>
            <a href="?C=M;O=A">Sort</a>
            <a href="../">Parent</a>
            <a href="subdir/">subdir/</a>
            <a href="image.iso">image.iso</a>
            <a href="http://elsewhere/escape.iso">escape</a>
            </body></html>
        "#;
        let entries = HttpTransport::parse_index(page, &base);
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.is_dir)).collect();
        assert_eq!(names, vec![("subdir", true), ("image.iso", false)]);
    }

    #[test]
    fn test_invalid_proxy_is_rejected() {
        let config = ClientConfig {
            proxy: Some("not a proxy url".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::with_config(config),
            Err(FetchError::InvalidUrl { .. })
        ));
    }
}
