//! Snapshot model, package specifiers, checksums, and lock records for envlock.
//!
//! This crate defines the schema layer: the canonical `Snapshot` of a
//! container-backed environment, the package specifier parser shared by the diff
//! engine and the reconciliation planner, the order-insensitive `sha256:` checksum,
//! and the versioned JSON `LockRecord` persisted by `envlock lock`.

pub mod checksum;
pub mod packages;
pub mod record;
pub mod snapshot;
pub mod types;

pub use checksum::compute_checksum;
pub use packages::{
    normalize_package_list, parse_package_specs, split_spec, PackageManager, ParsedPackages,
};
pub use record::{LockRecord, LOCK_FILE_NAME, LOCK_RECORD_VERSION};
pub use snapshot::{AptSources, BaseImage, ContainerConfig, PackageSet, Registries, Snapshot};
pub use types::{Checksum, EnvironmentId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("lock record I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock record parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported lock record version {0} (this build reads up to {LOCK_RECORD_VERSION})")]
    UnsupportedVersion(u32),
}
