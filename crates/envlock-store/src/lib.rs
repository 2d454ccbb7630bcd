//! Project registry and on-disk layout for envlock.
//!
//! The registry maps a project name to the container that backs it, the image it
//! was created from, and the directory holding its canonical lock record. The
//! whole registry is one JSON file replaced atomically on every write; there is
//! no finer-grained locking.

pub mod layout;
pub mod registry;

pub use layout::{StoreLayout, REGISTRY_FORMAT_VERSION};
pub use registry::{validate_project_name, ProjectEntry, ProjectRegistry};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `dest` with `content` via a temp file in the same directory.
pub fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(&dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid project name: {0}")]
    InvalidName(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("project '{0}' is already registered (use --force to replace it)")]
    ProjectExists(String),
    #[error("registry format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn store_error_display_project_not_found() {
        let e = StoreError::ProjectNotFound("web".to_owned());
        assert!(e.to_string().contains("web"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }
}
