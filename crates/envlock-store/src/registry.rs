use crate::layout::{StoreLayout, REGISTRY_FORMAT_VERSION};
use crate::{write_atomic, StoreError};
use envlock_schema::{EnvironmentId, LOCK_FILE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// A project known to envlock and the container backing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectEntry {
    pub name: String,
    pub environment_id: EnvironmentId,
    /// Declared base image reference (`python:3.11-slim`, `ghcr.io/org/img@sha256:…`).
    pub image: String,
    /// Directory holding the project's canonical lock record.
    pub dir: PathBuf,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    pub registered_at: String,
}

impl ProjectEntry {
    pub fn new(
        name: &str,
        environment_id: EnvironmentId,
        image: &str,
        dir: PathBuf,
        setup_commands: Vec<String>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            environment_id,
            image: image.trim().to_owned(),
            dir,
            setup_commands,
            registered_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    format_version: u32,
    #[serde(default)]
    projects: BTreeMap<String, ProjectEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            format_version: REGISTRY_FORMAT_VERSION,
            projects: BTreeMap::new(),
        }
    }
}

pub fn validate_project_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > 64 {
        return Err(StoreError::InvalidName(
            "project name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(StoreError::InvalidName(
            "project name must match [a-zA-Z0-9_-]".to_owned(),
        ));
    }
    Ok(())
}

/// Global project registry, persisted as a single JSON document.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    layout: StoreLayout,
}

impl ProjectRegistry {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn load(&self) -> Result<RegistryFile, StoreError> {
        let path = self.layout.registry_file();
        if !path.exists() {
            return Ok(RegistryFile::default());
        }
        let content = fs::read_to_string(&path)?;
        let file: RegistryFile = serde_json::from_str(&content)?;
        if file.format_version != REGISTRY_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: REGISTRY_FORMAT_VERSION,
                found: file.format_version,
            });
        }
        Ok(file)
    }

    fn save(&self, file: &RegistryFile) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(file)?;
        write_atomic(&self.layout.registry_file(), content.as_bytes())
    }

    pub fn list(&self) -> Result<Vec<ProjectEntry>, StoreError> {
        Ok(self.load()?.projects.into_values().collect())
    }

    pub fn get(&self, name: &str) -> Result<ProjectEntry, StoreError> {
        validate_project_name(name)?;
        self.load()?
            .projects
            .remove(name)
            .ok_or_else(|| StoreError::ProjectNotFound(name.to_owned()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.load()
            .map(|f| f.projects.contains_key(name))
            .unwrap_or(false)
    }

    /// Add or (with `replace`) overwrite a project entry.
    pub fn register(&self, entry: ProjectEntry, replace: bool) -> Result<(), StoreError> {
        validate_project_name(&entry.name)?;
        let mut file = self.load()?;
        if !replace && file.projects.contains_key(&entry.name) {
            return Err(StoreError::ProjectExists(entry.name));
        }
        debug!(
            "registering project {} -> {}",
            entry.name, entry.environment_id
        );
        file.projects.insert(entry.name.clone(), entry);
        self.save(&file)
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let mut file = self.load()?;
        if file.projects.remove(name).is_none() {
            return Err(StoreError::ProjectNotFound(name.to_owned()));
        }
        self.save(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (tempfile::TempDir, ProjectRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::new(StoreLayout::new(dir.path()));
        (dir, registry)
    }

    fn sample_entry(name: &str) -> ProjectEntry {
        ProjectEntry::new(
            name,
            EnvironmentId::new(format!("{name}-dev")),
            "python:3.11-slim",
            PathBuf::from("/src").join(name),
            vec!["pip install -r requirements.txt".to_owned()],
        )
    }

    #[test]
    fn empty_registry_lists_nothing() {
        let (_dir, registry) = test_registry();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn register_and_get() {
        let (_dir, registry) = test_registry();
        registry.register(sample_entry("api"), false).unwrap();
        let entry = registry.get("api").unwrap();
        assert_eq!(entry.environment_id, "api-dev");
        assert_eq!(entry.lock_path(), PathBuf::from("/src/api/envlock.lock.json"));
    }

    #[test]
    fn duplicate_register_requires_replace() {
        let (_dir, registry) = test_registry();
        registry.register(sample_entry("api"), false).unwrap();
        assert!(matches!(
            registry.register(sample_entry("api"), false),
            Err(StoreError::ProjectExists(_))
        ));

        let mut replacement = sample_entry("api");
        replacement.image = "python:3.12-slim".to_owned();
        registry.register(replacement, true).unwrap();
        assert_eq!(registry.get("api").unwrap().image, "python:3.12-slim");
    }

    #[test]
    fn missing_project_is_not_found() {
        let (_dir, registry) = test_registry();
        assert!(matches!(
            registry.get("ghost"),
            Err(StoreError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn invalid_names_rejected() {
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("has space").is_err());
        assert!(validate_project_name("semi;colon").is_err());
        assert!(validate_project_name(&"a".repeat(65)).is_err());
        assert!(validate_project_name("web_app-2").is_ok());
    }

    #[test]
    fn remove_deletes_entry() {
        let (_dir, registry) = test_registry();
        registry.register(sample_entry("a"), false).unwrap();
        registry.register(sample_entry("b"), false).unwrap();
        registry.remove("a").unwrap();
        let names: Vec<String> = registry.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b"]);
        assert!(registry.remove("a").is_err());
    }

    #[test]
    fn unknown_format_version_rejected() {
        let (_dir, registry) = test_registry();
        std::fs::write(
            registry.layout().registry_file(),
            r#"{"format_version": 99, "projects": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            registry.list(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
