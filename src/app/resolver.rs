//! Resource name resolution
//!
//! Maps a user-supplied resource specification (relative path, URL, wildcard
//! or directory spec) to a fetch URL, a canonical cache name, and a shape
//! classification. Resolution is deterministic and never fails: malformed
//! input degrades to a best-effort literal interpretation, and downstream
//! fetch failures surface the real error.
//!
//! The only network activity is the "latest" alias probe and the live/archive
//! root reachability probe; both fail open and keep the unresolved value.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::app::client::Transport;
use crate::constants::cache;

/// Configuration for name resolution
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Values substituted for `${NAME}` placeholders
    pub variables: HashMap<String, String>,
    /// Base location for relative specifications (path or URL)
    pub input_dir: String,
    /// HTTP exporter prefix applied to protocol-less specifications
    pub http_export_prefix: String,
    /// Path segment treated as a "latest" alias (e.g. "latest")
    pub latest_alias: Option<String>,
    /// Endpoint returning the concrete version for the latest alias
    pub latest_manifest_url: Option<String>,
    /// Live storage root, replaced by `archive_root` when unreachable
    pub live_root: Option<String>,
    /// Archival storage root substituted for an unreachable live root
    pub archive_root: Option<String>,
}

/// Shape of a resolved resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchShape {
    /// Plain single file
    Single,
    /// Single file selected by a wildcard pattern
    SingleWildcard,
    /// Multiple files matching a basename pattern, packed into one artifact
    MultiFile,
    /// Whole directory, mirrored and packed into one artifact
    Directory,
}

/// Immutable result of resolving a resource specification
#[derive(Debug, Clone)]
pub struct ResolvedName {
    url: String,
    canonical_name: String,
    shape: FetchShape,
}

impl ResolvedName {
    /// The URL the fetch will be performed against
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Canonical name the cache key is derived from
    pub fn canonical_name(&self) -> &str {
        &self.canonical_name
    }

    /// Classified fetch shape
    pub fn shape(&self) -> FetchShape {
        self.shape
    }

    /// Basename of the artifact within its cache entry directory
    pub fn artifact_name(&self) -> &str {
        self.canonical_name
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.canonical_name)
    }
}

/// Deterministic resolver from resource specifications to fetch descriptors
#[derive(Debug, Clone)]
pub struct NameResolver {
    config: ResolverConfig,
}

impl NameResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Resolve a specification without performing any network probes
    ///
    /// The order matters: variables are substituted first, then relative
    /// specs are rooted at the input dir, then protocol-less specs get the
    /// HTTP exporter prefix, and finally redundant separators are collapsed.
    pub fn resolve(&self, spec: &str, multiple: bool) -> ResolvedName {
        let mut url = self.substitute_variables(spec);
        url = self.root_relative(&url);
        url = self.apply_http_prefix(&url);
        url = collapse_slashes(&url);

        self.classify(url, multiple)
    }

    /// Resolve a specification, including the latest-alias and archive-root
    /// probes. Both probes fail open: on any error the unresolved value is
    /// kept and the eventual fetch reports the real failure.
    pub async fn resolve_with_probes(
        &self,
        spec: &str,
        multiple: bool,
        transport: &dyn Transport,
    ) -> ResolvedName {
        let mut url = self.substitute_variables(spec);
        url = self.root_relative(&url);
        url = self.apply_http_prefix(&url);
        url = self.resolve_latest_alias(&url, transport).await;
        url = collapse_slashes(&url);
        url = self.apply_archive_fallback(&url, transport).await;

        self.classify(url, multiple)
    }

    fn classify(&self, url: String, multiple: bool) -> ResolvedName {
        let directory = url.ends_with('/');
        let multiple = multiple || directory;
        let single_wildcard = url.contains('*') && !multiple;

        let mut canonical_name = url.replace('*', "WILDCARD");
        if directory {
            canonical_name.push_str(cache::PACKED_DIR_SUFFIX);
        }
        if multiple {
            canonical_name.push_str(cache::ARCHIVE_SUFFIX);
        }

        let shape = if directory {
            FetchShape::Directory
        } else if multiple {
            FetchShape::MultiFile
        } else if single_wildcard {
            FetchShape::SingleWildcard
        } else {
            FetchShape::Single
        };

        ResolvedName {
            url,
            canonical_name,
            shape,
        }
    }

    /// Replace `${NAME}` placeholders with configured variables
    ///
    /// Unknown placeholders are left verbatim so the caller sees the literal
    /// spec rather than an error.
    fn substitute_variables(&self, spec: &str) -> String {
        let mut out = String::with_capacity(spec.len());
        let mut rest = spec;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.config.variables.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            debug!("Unknown variable ${{{}}} left unsubstituted", name);
                            out.push_str(&rest[start..start + 2 + end + 1]);
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated placeholder, keep the remainder literally
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Root a relative specification at the configured input dir
    fn root_relative(&self, url: &str) -> String {
        if has_protocol(url) || url.starts_with('/') {
            url.to_string()
        } else {
            format!("{}/{}", self.config.input_dir, url)
        }
    }

    /// Prefix protocol-less specifications with the HTTP exporter
    fn apply_http_prefix(&self, url: &str) -> String {
        if has_protocol(url) {
            url.to_string()
        } else {
            format!("{}/{}", self.config.http_export_prefix, url)
        }
    }

    /// Replace a "latest" alias path segment with the concrete version
    /// reported by the manifest endpoint
    async fn resolve_latest_alias(&self, url: &str, transport: &dyn Transport) -> String {
        let (alias, manifest_url) = match (&self.config.latest_alias, &self.config.latest_manifest_url)
        {
            (Some(a), Some(m)) => (a, m),
            _ => return url.to_string(),
        };

        let needle = format!("/{}/", alias);
        if !url.contains(&needle) && !url.ends_with(&format!("/{}", alias)) {
            return url.to_string();
        }

        match transport.get_text(manifest_url).await {
            Ok(body) => {
                let version = body.lines().next().unwrap_or("").trim();
                if version.is_empty() {
                    warn!("Latest manifest at {} was empty, keeping alias", manifest_url);
                    return url.to_string();
                }
                debug!("Resolved latest alias to version {}", version);
                let replacement = format!("/{}/", version);
                if url.contains(&needle) {
                    url.replacen(&needle, &replacement, 1)
                } else {
                    format!(
                        "{}/{}",
                        url.trim_end_matches(&format!("/{}", alias)),
                        version
                    )
                }
            }
            Err(e) => {
                warn!("Latest manifest probe failed ({}), keeping alias", e);
                url.to_string()
            }
        }
    }

    /// Swap the live storage root for the archive root when the live copy is
    /// unreachable and the archived copy is reachable
    async fn apply_archive_fallback(&self, url: &str, transport: &dyn Transport) -> String {
        let (live, archive) = match (&self.config.live_root, &self.config.archive_root) {
            (Some(l), Some(a)) => (l, a),
            _ => return url.to_string(),
        };

        if !url.starts_with(live.as_str()) {
            return url.to_string();
        }

        if transport.probe_size(url).await.is_ok() {
            return url.to_string();
        }

        let archived = format!("{}{}", archive, &url[live.len()..]);
        match transport.probe_size(&archived).await {
            Ok(_) => {
                debug!("Live root unreachable, using archive copy {}", archived);
                archived
            }
            Err(_) => url.to_string(),
        }
    }
}

fn has_protocol(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Collapse redundant path separators, preserving the protocol separator
fn collapse_slashes(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for c in url.chars() {
        if c == '/' && out.ends_with('/') && !out.ends_with(":/") {
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> NameResolver {
        let mut variables = HashMap::new();
        variables.insert("BUILD".to_string(), "1234".to_string());
        variables.insert("ARCH".to_string(), "x86_64".to_string());
        NameResolver::new(ResolverConfig {
            variables,
            input_dir: "http://distfiles/builds/current".to_string(),
            http_export_prefix: "http://exports".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_relative_spec_rooted_at_input_dir() {
        let r = resolver().resolve("images/base.iso", false);
        assert_eq!(r.url(), "http://distfiles/builds/current/images/base.iso");
        assert_eq!(r.shape(), FetchShape::Single);
        assert_eq!(r.artifact_name(), "base.iso");
    }

    #[test]
    fn test_absolute_path_gets_http_prefix() {
        let r = resolver().resolve("/mirror/tools.tgz", false);
        assert_eq!(r.url(), "http://exports/mirror/tools.tgz");
    }

    #[test]
    fn test_explicit_url_untouched() {
        let r = resolver().resolve("https://host/a/b.iso", false);
        assert_eq!(r.url(), "https://host/a/b.iso");
    }

    #[test]
    fn test_variable_substitution() {
        let r = resolver().resolve("http://host/build/${BUILD}/${ARCH}/img.iso", false);
        assert_eq!(r.url(), "http://host/build/1234/x86_64/img.iso");
    }

    #[test]
    fn test_unknown_variable_left_verbatim() {
        let r = resolver().resolve("http://host/${NOPE}/img.iso", false);
        assert_eq!(r.url(), "http://host/${NOPE}/img.iso");
    }

    #[test]
    fn test_slash_collapse_preserves_protocol() {
        let r = resolver().resolve("http://host//a///b.iso", false);
        assert_eq!(r.url(), "http://host/a/b.iso");
    }

    #[test]
    fn test_directory_classification() {
        let r = resolver().resolve("http://host/build/hotfixes/", false);
        assert_eq!(r.shape(), FetchShape::Directory);
        assert!(r.canonical_name().ends_with("packeddir.tar.gz"));
    }

    #[test]
    fn test_wildcard_classification() {
        let r = resolver().resolve("http://host/build/tools-*.rpm", false);
        assert_eq!(r.shape(), FetchShape::SingleWildcard);
        assert_eq!(r.canonical_name(), "http://host/build/tools-WILDCARD.rpm");
    }

    #[test]
    fn test_wildcard_with_multiple_is_multifile() {
        let r = resolver().resolve("http://host/build/tools-*.rpm", true);
        assert_eq!(r.shape(), FetchShape::MultiFile);
        assert!(r.canonical_name().ends_with(".tar.gz"));
    }

    #[test]
    fn test_identical_canonicalization_shares_key() {
        let a = resolver().resolve("images//base.iso", false);
        let b = resolver().resolve("images/base.iso", false);
        assert_eq!(a.canonical_name(), b.canonical_name());
    }

    use crate::errors::{FetchError, FetchResult};
    use async_trait::async_trait;
    use std::path::Path;

    /// Transport that only answers probes: a fixed manifest body and a set of
    /// URL prefixes that respond to size probes
    struct ProbeStub {
        manifest: Option<String>,
        reachable: Vec<&'static str>,
    }

    impl ProbeStub {
        fn unreachable(url: &str) -> FetchError {
            FetchError::ServerError {
                status: 503,
                url: url.to_string(),
            }
        }
    }

    #[async_trait]
    impl Transport for ProbeStub {
        async fn probe_size(&self, url: &str) -> FetchResult<Option<u64>> {
            if self.reachable.iter().any(|p| url.starts_with(p)) {
                Ok(Some(1))
            } else {
                Err(Self::unreachable(url))
            }
        }

        async fn get_text(&self, url: &str) -> FetchResult<String> {
            self.manifest.clone().ok_or_else(|| Self::unreachable(url))
        }

        async fn fetch_single(&self, url: &str, _dest: &Path) -> FetchResult<()> {
            Err(Self::unreachable(url))
        }

        async fn fetch_wildcard(&self, url: &str, _dest: &Path) -> FetchResult<()> {
            Err(Self::unreachable(url))
        }

        async fn fetch_directory(&self, url: &str, _dest: &Path) -> FetchResult<()> {
            Err(Self::unreachable(url))
        }

        async fn fetch_multi(&self, url: &str, _dest: &Path) -> FetchResult<()> {
            Err(Self::unreachable(url))
        }
    }

    fn alias_resolver() -> NameResolver {
        NameResolver::new(ResolverConfig {
            input_dir: "http://distfiles/builds/current".to_string(),
            http_export_prefix: "http://exports".to_string(),
            latest_alias: Some("latest".to_string()),
            latest_manifest_url: Some("http://distfiles/builds/latest-id".to_string()),
            ..Default::default()
        })
    }

    fn archive_resolver() -> NameResolver {
        NameResolver::new(ResolverConfig {
            input_dir: "http://distfiles/builds/current".to_string(),
            http_export_prefix: "http://exports".to_string(),
            live_root: Some("http://distfiles".to_string()),
            archive_root: Some("http://vault/archive".to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_latest_alias_replaced_by_manifest_version() {
        let transport = ProbeStub {
            manifest: Some("81234\n".to_string()),
            reachable: vec![],
        };
        let r = alias_resolver()
            .resolve_with_probes("http://host/build/latest/img.iso", false, &transport)
            .await;
        assert_eq!(r.url(), "http://host/build/81234/img.iso");

        // Trailing-alias form resolves the same way
        let r = alias_resolver()
            .resolve_with_probes("http://host/build/latest", false, &transport)
            .await;
        assert_eq!(r.url(), "http://host/build/81234");
    }

    #[tokio::test]
    async fn test_latest_alias_kept_when_manifest_probe_fails() {
        let transport = ProbeStub {
            manifest: None,
            reachable: vec![],
        };
        let r = alias_resolver()
            .resolve_with_probes("http://host/build/latest/img.iso", false, &transport)
            .await;
        assert_eq!(r.url(), "http://host/build/latest/img.iso");
    }

    #[tokio::test]
    async fn test_latest_alias_kept_when_manifest_is_empty() {
        let transport = ProbeStub {
            manifest: Some("  \n".to_string()),
            reachable: vec![],
        };
        let r = alias_resolver()
            .resolve_with_probes("http://host/build/latest/img.iso", false, &transport)
            .await;
        assert_eq!(r.url(), "http://host/build/latest/img.iso");
    }

    #[tokio::test]
    async fn test_archive_root_substituted_when_live_unreachable() {
        let transport = ProbeStub {
            manifest: None,
            reachable: vec!["http://vault"],
        };
        let r = archive_resolver()
            .resolve_with_probes("images/base.iso", false, &transport)
            .await;
        assert_eq!(r.url(), "http://vault/archive/builds/current/images/base.iso");
    }

    #[tokio::test]
    async fn test_live_root_kept_when_reachable() {
        let transport = ProbeStub {
            manifest: None,
            reachable: vec!["http://distfiles"],
        };
        let r = archive_resolver()
            .resolve_with_probes("images/base.iso", false, &transport)
            .await;
        assert_eq!(r.url(), "http://distfiles/builds/current/images/base.iso");
    }

    #[tokio::test]
    async fn test_live_root_kept_when_archive_also_unreachable() {
        let transport = ProbeStub {
            manifest: None,
            reachable: vec![],
        };
        let r = archive_resolver()
            .resolve_with_probes("images/base.iso", false, &transport)
            .await;
        assert_eq!(r.url(), "http://distfiles/builds/current/images/base.iso");
    }
}
