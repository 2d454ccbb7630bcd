use crate::snapshot::Snapshot;
use crate::types::EnvironmentId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Current record format. v1 had no checksum; v2 adds it.
pub const LOCK_RECORD_VERSION: u32 = 2;

/// File name of a project's canonical lock record.
pub const LOCK_FILE_NAME: &str = "envlock.lock.json";

/// The persisted, canonical description of a project's environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub version: u32,
    pub project: String,
    #[serde(rename = "environmentId")]
    pub environment_id: EnvironmentId,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

impl LockRecord {
    /// Wrap a snapshot, sealing it so the stored checksum is always fresh.
    pub fn new(project: &str, environment_id: EnvironmentId, snapshot: Snapshot) -> Self {
        Self {
            version: LOCK_RECORD_VERSION,
            project: project.to_owned(),
            environment_id,
            created_at: chrono::Utc::now().to_rfc3339(),
            snapshot: snapshot.unsealed().seal(),
        }
    }

    /// `true` when the record carries a checksum the fast path can trust.
    pub fn has_checksum(&self) -> bool {
        self.version >= 2 && self.snapshot.checksum().is_some()
    }

    pub fn to_json(&self) -> Result<String, SchemaError> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(content: &str) -> Result<Self, SchemaError> {
        let record: LockRecord = serde_json::from_str(content)?;
        if record.version == 0 || record.version > LOCK_RECORD_VERSION {
            return Err(SchemaError::UnsupportedVersion(record.version));
        }
        Ok(record)
    }

    /// Replace the file at `path` atomically (temp file, fsync, rename).
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SchemaError> {
        let path = path.as_ref();
        let content = self.to_json()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| SchemaError::Io(e.error))?;
        // Fsync parent directory to ensure rename durability on power loss.
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BaseImage, PackageSet};

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            base_image: BaseImage {
                name: "node:20".to_owned(),
                digest: "sha256:feed".to_owned(),
                id: "sha256:beef".to_owned(),
            },
            packages: PackageSet {
                npm: vec!["typescript@5.4.5".to_owned(), "@types/node@20.4.5".to_owned()],
                ..PackageSet::default()
            },
            ..Snapshot::default()
        }
    }

    #[test]
    fn record_roundtrip() {
        let record = LockRecord::new("web", EnvironmentId::new("web-dev"), sample_snapshot());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        record.write_to_file(&path).unwrap();
        let loaded = LockRecord::read_from_file(&path).unwrap();
        assert_eq!(record, loaded);
        assert!(loaded.snapshot.verify_checksum());
    }

    #[test]
    fn serialized_field_names_match_record_format() {
        let record = LockRecord::new("web", EnvironmentId::new("web-dev"), sample_snapshot());
        let value: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        for key in [
            "version",
            "project",
            "environmentId",
            "createdAt",
            "checksum",
            "base_image",
            "container",
            "packages",
            "registries",
            "apt_sources",
            "setup_commands",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["version"], 2);
    }

    #[test]
    fn new_record_is_sealed_and_sorted() {
        let record = LockRecord::new("web", EnvironmentId::new("web-dev"), sample_snapshot());
        assert!(record.has_checksum());
        assert_eq!(
            record.snapshot.packages.npm,
            vec!["@types/node@20.4.5", "typescript@5.4.5"]
        );
    }

    #[test]
    fn v1_record_without_checksum_is_readable() {
        let json = r#"{
            "version": 1,
            "project": "legacy",
            "environmentId": "legacy-dev",
            "createdAt": "2024-01-01T00:00:00Z",
            "base_image": {"name": "ubuntu:22.04"},
            "packages": {"apt": ["git=1:2.34.1-1ubuntu1"]}
        }"#;
        let record = LockRecord::from_json(json).unwrap();
        assert!(!record.has_checksum());
        assert_eq!(record.snapshot.packages.apt.len(), 1);
        assert!(record.snapshot.setup_commands.is_empty());
    }

    #[test]
    fn future_version_is_rejected() {
        let json = r#"{"version": 9, "project": "p", "environmentId": "e",
            "createdAt": "", "base_image": {"name": "x"}}"#;
        assert!(matches!(
            LockRecord::from_json(json),
            Err(SchemaError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            LockRecord::from_json("{not json"),
            Err(SchemaError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LockRecord::read_from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, SchemaError::Io(_)));
    }
}
