use crate::RuntimeError;
use envlock_schema::{AptSources, EnvironmentId, PackageManager, PackageSet, Registries};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::thread;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub environment_id: EnvironmentId,
    pub running: bool,
    /// Runtime-specific state string (`running`, `exited`, `created`, …).
    pub state: String,
}

/// Content identity of an image as reported by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDigest {
    pub digest: String,
    pub image_id: String,
}

/// Container configuration as reported by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerMeta {
    /// Id of the image the container was created from.
    pub image_id: String,
    pub environment: BTreeMap<String, String>,
    pub working_dir: String,
    pub user: String,
    pub restart_policy: String,
    pub labels: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
    pub resources: BTreeMap<String, String>,
    pub network: String,
    pub gpu: String,
}

/// The environment runtime collaborator.
///
/// Container process control, image handling and in-container execution live
/// behind this trait. Every answer is trusted as ground truth for the moment it
/// was given.
pub trait EnvironmentRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn exists(&self, id: &EnvironmentId) -> Result<bool, RuntimeError>;

    fn status(&self, id: &EnvironmentId) -> Result<RuntimeStatus, RuntimeError>;

    fn start(&self, id: &EnvironmentId) -> Result<(), RuntimeError>;

    /// Resolve an image reference (tag, digest ref, or image id) locally.
    fn resolve_image_digest(&self, reference: &str) -> Result<ImageDigest, RuntimeError>;

    fn container_meta(&self, id: &EnvironmentId) -> Result<ContainerMeta, RuntimeError>;

    /// Published ports as `[host_ip:]host_port:container_port/proto`.
    fn port_mappings(&self, id: &EnvironmentId) -> Result<Vec<String>, RuntimeError>;

    /// Mounts as `source:destination[:ro]`.
    fn mounts(&self, id: &EnvironmentId) -> Result<Vec<String>, RuntimeError>;

    fn apt_sources(&self, id: &EnvironmentId) -> Result<AptSources, RuntimeError>;

    fn registries(&self, id: &EnvironmentId) -> Result<Registries, RuntimeError>;

    /// Installed packages of one manager as `name<sep>version` specifiers.
    /// A manager that is not installed in the environment yields an empty list.
    fn installed_packages(
        &self,
        id: &EnvironmentId,
        manager: PackageManager,
    ) -> Result<Vec<String>, RuntimeError>;

    /// Run shell scripts in order as root, stopping at the first failure.
    fn execute(
        &self,
        id: &EnvironmentId,
        commands: &[String],
        show_output: bool,
    ) -> Result<(), RuntimeError>;

    /// Commit the container's filesystem to a tagged image; returns the image id.
    fn commit_to_image(&self, id: &EnvironmentId, tag: &str) -> Result<String, RuntimeError>;

    fn remove_image(&self, tag: &str) -> Result<(), RuntimeError>;
}

/// Query all five package managers concurrently.
///
/// Each manager fills its own slot; nothing is shared between the workers.
pub fn query_installed_packages(
    runtime: &dyn EnvironmentRuntime,
    id: &EnvironmentId,
) -> Result<PackageSet, RuntimeError> {
    let results: Vec<(PackageManager, Result<Vec<String>, RuntimeError>)> =
        thread::scope(|scope| {
            let handles: Vec<_> = PackageManager::ALL
                .iter()
                .map(|&manager| {
                    (
                        manager,
                        scope.spawn(move || runtime.installed_packages(id, manager)),
                    )
                })
                .collect();
            handles
                .into_iter()
                .map(|(manager, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(RuntimeError::ExecFailed(format!(
                            "{manager} package query panicked"
                        )))
                    });
                    (manager, result)
                })
                .collect()
        });

    let mut set = PackageSet::default();
    for (manager, result) in results {
        let list = result?;
        debug!("{} {manager} package(s) installed in {id}", list.len());
        *set.get_mut(manager) = list;
    }
    Ok(set)
}

/// Build a runtime from its configured name.
///
/// `binary` is the CLI executable for the docker-compatible backends.
pub fn select_backend(
    name: &str,
    binary: &str,
) -> Result<Box<dyn EnvironmentRuntime>, RuntimeError> {
    match name {
        "docker" | "podman" => Ok(Box::new(crate::docker::DockerBackend::new(binary))),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::Unavailable(format!(
            "unknown runtime backend '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    #[test]
    fn select_valid_backends() {
        assert!(select_backend("docker", "docker").is_ok());
        assert!(select_backend("podman", "podman").is_ok());
        assert!(select_backend("mock", "").is_ok());
    }

    #[test]
    fn select_invalid_backend_fails() {
        assert!(matches!(
            select_backend("lxc", "lxc"),
            Err(RuntimeError::Unavailable(_))
        ));
    }

    #[test]
    fn fan_out_fills_every_manager_slot() {
        let backend = MockBackend::new();
        let id = EnvironmentId::new("fanout");
        backend.set_packages(
            &id,
            PackageSet {
                apt: vec!["git=1:2.39.2-1".to_owned()],
                pip: vec!["flask==2.3.0".to_owned()],
                npm: vec!["typescript@5.4.5".to_owned()],
                yarn: vec!["serve@14.2.1".to_owned()],
                pnpm: vec!["vite@5.2.0".to_owned()],
            },
        );
        let set = query_installed_packages(&backend, &id).unwrap();
        assert_eq!(set.total(), 5);
        assert_eq!(set.yarn, vec!["serve@14.2.1"]);
    }

    #[test]
    fn fan_out_propagates_errors() {
        let backend = MockBackend::without_autocreate();
        let err = query_installed_packages(&backend, &EnvironmentId::new("ghost")).unwrap_err();
        assert!(matches!(err, RuntimeError::EnvironmentNotFound(_)));
    }
}
