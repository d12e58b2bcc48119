//! Temporary files and atomic placement
//!
//! Output is written next to its destination under a `.part` suffix and only
//! renamed into place once every stage succeeded. A completed file therefore
//! never carries the suffix, and a leftover `.part` file is never mistaken for
//! a finished one.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const PART_SUFFIX: &str = ".part";
const TRANSCODE_SUFFIX: &str = ".transcode.part";

/// Where decrypted bytes are staged for `destination`
pub(crate) fn temp_path(destination: &Path) -> PathBuf {
    with_suffix(destination, PART_SUFFIX)
}

/// Where transcoder output is staged for `destination`
pub(crate) fn transcode_path(destination: &Path) -> PathBuf {
    with_suffix(destination, TRANSCODE_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Whether `path` holds a previous result worth keeping
///
/// Only a non-empty regular file counts; an empty file is what an interrupted
/// external copy leaves behind.
pub(crate) async fn is_existing_output(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Create the destination's parent directory
pub(crate) async fn prepare_parent(destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_destination_io(parent, e))?;
        }
    }
    Ok(())
}

/// Rename `staged` onto `destination`, returning the final size
pub(crate) async fn place(staged: &Path, destination: &Path) -> Result<u64> {
    tokio::fs::rename(staged, destination)
        .await
        .map_err(|e| Error::from_destination_io(destination, e))?;
    let meta = tokio::fs::metadata(destination)
        .await
        .map_err(|e| Error::from_destination_io(destination, e))?;
    Ok(meta.len())
}

/// Remove a staging file, ignoring files that were never created
pub(crate) async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed temporary file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary file")
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn staging_paths_keep_the_directory() {
        let destination = Path::new("/music/tracks/1.flac");
        assert_eq!(
            temp_path(destination),
            PathBuf::from("/music/tracks/1.flac.part")
        );
        assert_eq!(
            transcode_path(destination),
            PathBuf::from("/music/tracks/1.flac.transcode.part")
        );
    }

    #[tokio::test]
    async fn only_non_empty_files_count_as_existing() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.flac");
        let full = dir.path().join("full.flac");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"fLaC").unwrap();

        assert!(!is_existing_output(&empty).await);
        assert!(is_existing_output(&full).await);
        assert!(!is_existing_output(dir.path()).await);
        assert!(!is_existing_output(&dir.path().join("missing.flac")).await);
    }

    #[tokio::test]
    async fn place_moves_staged_file_and_reports_size() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("albums/1.flac");
        prepare_parent(&destination).await.unwrap();
        let staged = temp_path(&destination);
        std::fs::write(&staged, vec![0u8; 2500]).unwrap();

        assert_eq!(place(&staged, &destination).await.unwrap(), 2500);
        assert!(!staged.exists());
        assert!(destination.exists());

        // Already gone, nothing to report
        discard(&staged).await;
    }
}
