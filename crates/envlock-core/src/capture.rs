use crate::concurrency::CancelToken;
use crate::CoreError;
use envlock_runtime::{
    query_installed_packages, EnvironmentRuntime, ImageDigest, RuntimeError, RuntimeStatus,
};
use envlock_schema::{BaseImage, ContainerConfig, EnvironmentId, Snapshot};
use std::thread::{self, ScopedJoinHandle};
use tracing::{debug, info, warn};

fn existing_status(
    runtime: &dyn EnvironmentRuntime,
    id: &EnvironmentId,
) -> Result<RuntimeStatus, CoreError> {
    let unavailable = |e: RuntimeError| CoreError::RuntimeUnavailable(format!("{id}: {e}"));
    if !runtime.exists(id).map_err(unavailable)? {
        return Err(CoreError::RuntimeUnavailable(format!(
            "environment '{id}' does not exist"
        )));
    }
    runtime.status(id).map_err(unavailable)
}

/// Make sure the environment exists and is running, starting it if needed.
pub fn ensure_running(runtime: &dyn EnvironmentRuntime, id: &EnvironmentId) -> Result<(), CoreError> {
    let status = existing_status(runtime, id)?;
    if !status.running {
        info!("starting environment {id} (state: {})", status.state);
        runtime.start(id).map_err(|e| {
            CoreError::RuntimeUnavailable(format!("environment '{id}' could not be started: {e}"))
        })?;
    }
    Ok(())
}

/// Like `ensure_running`, but a stopped environment is an error rather than
/// something to start.
pub fn require_running(runtime: &dyn EnvironmentRuntime, id: &EnvironmentId) -> Result<(), CoreError> {
    let status = existing_status(runtime, id)?;
    if !status.running {
        return Err(CoreError::RuntimeUnavailable(format!(
            "environment '{id}' is not running (state: {})",
            status.state
        )));
    }
    Ok(())
}

fn join<T>(handle: ScopedJoinHandle<'_, Result<T, RuntimeError>>, what: &str) -> Result<T, RuntimeError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(RuntimeError::ExecFailed(format!("{what} query panicked"))))
}

/// Resolve the declared image, falling back to the container's own image id
/// when the reference does not resolve locally.
fn resolve_base_digest(
    runtime: &dyn EnvironmentRuntime,
    declared: Result<ImageDigest, RuntimeError>,
    image_ref: &str,
    container_image_id: &str,
) -> Result<ImageDigest, RuntimeError> {
    match declared {
        Ok(digest) => Ok(digest),
        Err(e) if !container_image_id.is_empty() => {
            debug!("{image_ref} did not resolve ({e}); using container image {container_image_id}");
            match runtime.resolve_image_digest(container_image_id) {
                Ok(digest) => Ok(digest),
                Err(e) => {
                    warn!("container image {container_image_id} did not resolve: {e}");
                    Ok(ImageDigest {
                        digest: container_image_id.to_owned(),
                        image_id: container_image_id.to_owned(),
                    })
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// Capture the live state of an environment as an unsealed snapshot.
///
/// Every runtime query is issued concurrently; each fills its own slot. The
/// setup commands are not observable in a running container and are taken
/// from the caller.
pub fn capture_snapshot(
    runtime: &dyn EnvironmentRuntime,
    id: &EnvironmentId,
    image_ref: &str,
    setup_commands: &[String],
    token: &CancelToken,
) -> Result<Snapshot, CoreError> {
    token.check()?;
    let (meta, ports, mounts, apt_sources, registries, declared_digest, packages) =
        thread::scope(|s| {
            let meta = s.spawn(move || runtime.container_meta(id));
            let ports = s.spawn(move || runtime.port_mappings(id));
            let mounts = s.spawn(move || runtime.mounts(id));
            let apt = s.spawn(move || runtime.apt_sources(id));
            let registries = s.spawn(move || runtime.registries(id));
            let digest = s.spawn(move || runtime.resolve_image_digest(image_ref));
            let packages = s.spawn(move || query_installed_packages(runtime, id));
            (
                join(meta, "container metadata"),
                join(ports, "port mapping"),
                join(mounts, "mount"),
                join(apt, "apt source"),
                join(registries, "registry"),
                join(digest, "image digest"),
                join(packages, "package"),
            )
        });
    token.check()?;

    let meta = meta?;
    let image = resolve_base_digest(runtime, declared_digest, image_ref, &meta.image_id)?;

    let container = ContainerConfig {
        working_dir: meta.working_dir,
        user: meta.user,
        restart_policy: meta.restart_policy,
        network: meta.network,
        ports: ports?,
        volumes: mounts?,
        labels: meta.labels,
        environment: meta.environment,
        capabilities: meta.capabilities,
        resources: meta.resources,
        gpu: meta.gpu,
    };
    let mut snapshot = Snapshot::new(
        BaseImage {
            name: image_ref.to_owned(),
            digest: image.digest,
            id: image.image_id,
        },
        container,
        packages?,
        registries?,
        apt_sources?,
        setup_commands.to_vec(),
    );
    snapshot.normalize();
    debug!(
        "captured {id}: {} package(s), {} port(s), {} mount(s)",
        snapshot.packages.total(),
        snapshot.container.ports.len(),
        snapshot.container.volumes.len()
    );
    Ok(snapshot)
}
