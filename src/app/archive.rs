//! Artifact packing
//!
//! Directory and multi-file fetches are materialized as a single compressed
//! tar artifact so the cache always stores exactly one file per key.

use std::fs::File;
use std::path::Path;

use flate2::{write::GzEncoder, Compression};
use tracing::debug;

use crate::errors::{FetchError, FetchResult};

/// Pack the contents of `src_dir` into a gzip-compressed tar at `dest`
///
/// Paths inside the archive are relative to `src_dir`. The destination is
/// written in full; callers are expected to publish it atomically.
pub fn pack_dir(src_dir: &Path, dest: &Path) -> FetchResult<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    builder
        .append_dir_all(".", src_dir)
        .map_err(|e| FetchError::Archive {
            reason: format!("appending {}: {}", src_dir.display(), e),
        })?;

    let encoder = builder.into_inner().map_err(|e| FetchError::Archive {
        reason: format!("finalizing tar: {}", e),
    })?;
    encoder.finish().map_err(|e| FetchError::Archive {
        reason: format!("finalizing gzip stream: {}", e),
    })?;

    debug!("Packed {} into {}", src_dir.display(), dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_pack_dir_contains_all_files() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"beta").unwrap();

        let out = TempDir::new().unwrap();
        let dest = out.path().join("packed.tar.gz");
        pack_dir(src.path(), &dest).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&dest).unwrap()));
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry
                .path()
                .unwrap()
                .display()
                .to_string()
                .trim_start_matches("./")
                .to_string();
            if entry.header().entry_type().is_file() {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                names.push((path, content));
            }
        }
        names.sort();
        assert_eq!(
            names,
            vec![
                ("a.txt".to_string(), "alpha".to_string()),
                ("sub/b.txt".to_string(), "beta".to_string()),
            ]
        );
    }

    #[test]
    fn test_pack_missing_dir_is_archive_error() {
        let out = TempDir::new().unwrap();
        let dest = out.path().join("packed.tar.gz");
        let err = pack_dir(Path::new("/nonexistent-rigpool-src"), &dest).unwrap_err();
        assert!(matches!(err, FetchError::Archive { .. }));
    }
}
