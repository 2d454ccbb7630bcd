use crate::capture::{capture_snapshot, ensure_running};
use crate::concurrency::CancelToken;
use crate::config::Config;
use crate::diff::{DiffEngine, DriftDetector, DriftReport};
use crate::CoreError;
use envlock_runtime::{select_backend, EnvironmentRuntime};
use envlock_schema::{EnvironmentId, LockRecord, Snapshot};
use envlock_store::{ProjectEntry, ProjectRegistry, StoreLayout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Central context for lock, diff, verify and apply.
///
/// Holds the runtime backend, the project registry and the drift detector.
/// Cloning is cheap and shares the same backend.
#[derive(Clone)]
pub struct Engine {
    pub(crate) runtime: Arc<dyn EnvironmentRuntime>,
    registry: ProjectRegistry,
    pub(crate) detector: Arc<dyn DriftDetector>,
}

/// Result of a successful `lock`.
#[derive(Debug, Clone)]
pub struct LockResult {
    pub record: LockRecord,
    pub path: PathBuf,
}

impl Engine {
    pub fn new(runtime: Arc<dyn EnvironmentRuntime>, registry: ProjectRegistry) -> Self {
        Self {
            runtime,
            registry,
            detector: Arc::new(DiffEngine),
        }
    }

    /// Build the engine described by a user configuration.
    pub fn from_config(config: &Config) -> Result<Self, CoreError> {
        let runtime = select_backend(&config.runtime.backend, &config.runtime.binary)?;
        let registry = ProjectRegistry::new(StoreLayout::new(config.store_root()));
        Ok(Self::new(Arc::from(runtime), registry))
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Arc<dyn DriftDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn runtime(&self) -> &dyn EnvironmentRuntime {
        self.runtime.as_ref()
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    pub fn register(&self, entry: ProjectEntry, replace: bool) -> Result<(), CoreError> {
        self.registry.layout().initialize()?;
        info!("registering project {} ({})", entry.name, entry.environment_id);
        Ok(self.registry.register(entry, replace)?)
    }

    pub fn projects(&self) -> Result<Vec<ProjectEntry>, CoreError> {
        Ok(self.registry.list()?)
    }

    pub fn project(&self, name: &str) -> Result<ProjectEntry, CoreError> {
        Ok(self.registry.get(name)?)
    }

    /// Read the project's canonical lock record.
    pub fn load_record(&self, entry: &ProjectEntry) -> Result<LockRecord, CoreError> {
        let path = entry.lock_path();
        if !path.exists() {
            return Err(CoreError::NotFound(format!(
                "no lock record for '{}' at {} (run `envlock lock {}` first)",
                entry.name,
                path.display(),
                entry.name
            )));
        }
        Ok(LockRecord::read_from_file(&path)?)
    }

    /// Start the environment if needed and capture its live state.
    pub(crate) fn capture_live(
        &self,
        id: &EnvironmentId,
        image_ref: &str,
        setup_commands: &[String],
        token: &CancelToken,
    ) -> Result<Snapshot, CoreError> {
        ensure_running(self.runtime(), id)?;
        capture_snapshot(self.runtime(), id, image_ref, setup_commands, token)
    }

    /// Capture the project's environment and persist it as a checksummed record.
    ///
    /// The record goes to the project's canonical path unless `output` is given.
    pub fn lock(
        &self,
        project: &str,
        output: Option<&Path>,
        token: &CancelToken,
    ) -> Result<LockResult, CoreError> {
        let entry = self.project(project)?;
        let snapshot = self.capture_live(
            &entry.environment_id,
            &entry.image,
            &entry.setup_commands,
            token,
        )?;
        token.check()?;

        let record = LockRecord::new(&entry.name, entry.environment_id.clone(), snapshot);
        let path = output.map_or_else(|| entry.lock_path(), Path::to_path_buf);
        record.write_to_file(&path)?;
        info!(
            "locked {} ({} package(s)) to {}",
            entry.name,
            record.snapshot.packages.total(),
            path.display()
        );
        Ok(LockResult { record, path })
    }

    /// Read-only drift report between the lock record and the live environment.
    pub fn diff(&self, project: &str, token: &CancelToken) -> Result<DriftReport, CoreError> {
        let entry = self.project(project)?;
        let record = self.load_record(&entry)?;
        let declared = &record.snapshot;
        let live = self.capture_live(
            &entry.environment_id,
            &declared.base_image.name,
            &declared.setup_commands,
            token,
        )?;
        Ok(self.detector.detect(declared, &live))
    }
}
