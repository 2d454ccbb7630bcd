use crate::backend::{ContainerMeta, EnvironmentRuntime, ImageDigest, RuntimeStatus};
use crate::probe;
use crate::RuntimeError;
use envlock_schema::{AptSources, EnvironmentId, PackageManager, Registries};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

/// Backend for docker-compatible CLIs (`docker`, `podman`).
///
/// Every call shells out to the binary; nothing is cached between calls, so each
/// answer reflects the runtime at the moment it was asked.
pub struct DockerBackend {
    binary: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectState {
    status: String,
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectConfig {
    env: Option<Vec<String>>,
    working_dir: String,
    user: String,
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RestartPolicy {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct PortBinding {
    host_ip: String,
    host_port: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DeviceRequest {
    count: i64,
    #[serde(rename = "DeviceIDs")]
    device_ids: Option<Vec<String>>,
    capabilities: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectHostConfig {
    restart_policy: RestartPolicy,
    network_mode: String,
    cap_add: Option<Vec<String>>,
    port_bindings: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
    memory: i64,
    memory_swap: i64,
    nano_cpus: i64,
    cpu_shares: i64,
    cpuset_cpus: String,
    pids_limit: Option<i64>,
    shm_size: i64,
    device_requests: Option<Vec<DeviceRequest>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectMount {
    #[serde(rename = "Type")]
    kind: String,
    name: String,
    source: String,
    destination: String,
    #[serde(rename = "RW")]
    rw: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ContainerInspect {
    image: String,
    state: InspectState,
    config: InspectConfig,
    host_config: InspectHostConfig,
    mounts: Option<Vec<InspectMount>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ImageInspect {
    id: String,
    repo_digests: Option<Vec<String>>,
}

fn parse_container_inspect(json: &str) -> Result<ContainerInspect, RuntimeError> {
    let mut items: Vec<ContainerInspect> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse(format!("container inspect: {e}")))?;
    items
        .pop()
        .ok_or_else(|| RuntimeError::Parse("container inspect returned no objects".to_owned()))
}

fn parse_image_inspect(json: &str) -> Result<ImageDigest, RuntimeError> {
    let mut items: Vec<ImageInspect> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse(format!("image inspect: {e}")))?;
    let image = items
        .pop()
        .ok_or_else(|| RuntimeError::Parse("image inspect returned no objects".to_owned()))?;
    // Locally built images have no repo digest; the image id is the only identity.
    let digest = image
        .repo_digests
        .unwrap_or_default()
        .iter()
        .find_map(|d| d.rsplit_once('@').map(|(_, digest)| digest.to_owned()))
        .unwrap_or_else(|| image.id.clone());
    Ok(ImageDigest {
        digest,
        image_id: image.id,
    })
}

fn gpu_summary(requests: &[DeviceRequest]) -> String {
    let gpu_requests: Vec<&DeviceRequest> = requests
        .iter()
        .filter(|r| {
            r.capabilities
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|set| set.iter().any(|c| c == "gpu"))
        })
        .collect();
    let Some(request) = gpu_requests.first() else {
        return String::new();
    };
    if let Some(ids) = request.device_ids.as_ref().filter(|ids| !ids.is_empty()) {
        return format!("device={}", ids.join(","));
    }
    match request.count {
        -1 => "all".to_owned(),
        n => n.to_string(),
    }
}

fn meta_from_inspect(inspect: &ContainerInspect) -> ContainerMeta {
    let environment = inspect
        .config
        .env
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

    let host = &inspect.host_config;
    let mut resources = BTreeMap::new();
    let numeric = [
        ("memory", host.memory),
        ("memory_swap", host.memory_swap),
        ("nano_cpus", host.nano_cpus),
        ("cpu_shares", host.cpu_shares),
        ("shm_size", host.shm_size),
    ];
    for (key, value) in numeric {
        if value > 0 {
            resources.insert(key.to_owned(), value.to_string());
        }
    }
    if let Some(limit) = host.pids_limit.filter(|l| *l > 0) {
        resources.insert("pids_limit".to_owned(), limit.to_string());
    }
    if !host.cpuset_cpus.is_empty() {
        resources.insert("cpuset_cpus".to_owned(), host.cpuset_cpus.clone());
    }

    let mut capabilities = host.cap_add.clone().unwrap_or_default();
    capabilities.sort();

    ContainerMeta {
        image_id: inspect.image.clone(),
        environment,
        working_dir: inspect.config.working_dir.clone(),
        user: inspect.config.user.clone(),
        restart_policy: host.restart_policy.name.clone(),
        labels: inspect.config.labels.clone().unwrap_or_default(),
        capabilities,
        resources,
        network: host.network_mode.clone(),
        gpu: gpu_summary(host.device_requests.as_deref().unwrap_or_default()),
    }
}

fn ports_from_inspect(inspect: &ContainerInspect) -> Vec<String> {
    let mut ports = Vec::new();
    for (container_port, bindings) in inspect.host_config.port_bindings.iter().flatten() {
        for binding in bindings.iter().flatten() {
            let host_ip = binding.host_ip.as_str();
            if host_ip.is_empty() || host_ip == "0.0.0.0" {
                ports.push(format!("{}:{container_port}", binding.host_port));
            } else {
                ports.push(format!("{host_ip}:{}:{container_port}", binding.host_port));
            }
        }
    }
    ports
}

fn mounts_from_inspect(inspect: &ContainerInspect) -> Vec<String> {
    inspect
        .mounts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|m| {
            let source = if m.kind == "volume" && !m.name.is_empty() {
                &m.name
            } else {
                &m.source
            };
            let mut line = format!("{source}:{}", m.destination);
            if !m.rw {
                line.push_str(":ro");
            }
            line
        })
        .collect()
}

fn is_missing_object(stderr: &str) -> bool {
    let msg = stderr.to_lowercase();
    msg.contains("no such") || msg.contains("not found") || msg.contains("does not exist")
}

fn first_line(script: &str) -> &str {
    script.lines().next().unwrap_or_default()
}

fn package_query_script(manager: PackageManager) -> &'static str {
    match manager {
        PackageManager::Apt => {
            "command -v dpkg-query >/dev/null 2>&1 || exit 0; \
             dpkg-query -W -f='${db:Status-Abbrev} ${Package}=${Version}\\n' 2>/dev/null \
             | awk '$1 == \"ii\" { print $2 }'"
        }
        PackageManager::Pip => {
            "command -v pip >/dev/null 2>&1 || exit 0; \
             pip list --format=freeze --disable-pip-version-check 2>/dev/null || true"
        }
        PackageManager::Npm => {
            "command -v npm >/dev/null 2>&1 || exit 0; npm ls -g --depth=0 --json 2>/dev/null || true"
        }
        PackageManager::Yarn => {
            "command -v yarn >/dev/null 2>&1 || exit 0; yarn global list --depth=0 2>/dev/null || true"
        }
        PackageManager::Pnpm => {
            "command -v pnpm >/dev/null 2>&1 || exit 0; pnpm ls -g --depth=0 --json 2>/dev/null || true"
        }
    }
}

fn cat_script(path: &str) -> String {
    format!("cat {} 2>/dev/null || true", crate::shell_escape(path))
}

impl DockerBackend {
    pub fn new(binary: &str) -> Self {
        let binary = if binary.trim().is_empty() {
            "docker"
        } else {
            binary.trim()
        };
        Self {
            binary: binary.to_owned(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn run(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("{}: executable not found", self.binary))
                } else {
                    RuntimeError::Io(e)
                }
            })
    }

    fn inspect(&self, id: &EnvironmentId) -> Result<ContainerInspect, RuntimeError> {
        let output = self.run(&["container", "inspect", id.as_str()])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_object(&stderr) {
                return Err(RuntimeError::EnvironmentNotFound(id.to_string()));
            }
            return Err(RuntimeError::ExecFailed(format!(
                "{} container inspect {id}: {}",
                self.binary,
                stderr.trim()
            )));
        }
        parse_container_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    /// Run a read-only script as root and return its stdout.
    fn capture(&self, id: &EnvironmentId, script: &str) -> Result<String, RuntimeError> {
        let output = self.run(&["exec", "-u", "root", id.as_str(), "sh", "-c", script])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_object(&stderr) {
                return Err(RuntimeError::EnvironmentNotFound(id.to_string()));
            }
            return Err(RuntimeError::ExecFailed(format!(
                "probe `{}` failed: {}",
                first_line(script),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl EnvironmentRuntime for DockerBackend {
    fn name(&self) -> &str {
        &self.binary
    }

    fn exists(&self, id: &EnvironmentId) -> Result<bool, RuntimeError> {
        match self.inspect(id) {
            Ok(_) => Ok(true),
            Err(RuntimeError::EnvironmentNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn status(&self, id: &EnvironmentId) -> Result<RuntimeStatus, RuntimeError> {
        let inspect = self.inspect(id)?;
        Ok(RuntimeStatus {
            environment_id: id.clone(),
            running: inspect.state.running,
            state: inspect.state.status,
        })
    }

    fn start(&self, id: &EnvironmentId) -> Result<(), RuntimeError> {
        let output = self.run(&["start", id.as_str()])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_object(&stderr) {
            return Err(RuntimeError::EnvironmentNotFound(id.to_string()));
        }
        Err(RuntimeError::ExecFailed(format!(
            "{} start {id}: {}",
            self.binary,
            stderr.trim()
        )))
    }

    fn resolve_image_digest(&self, reference: &str) -> Result<ImageDigest, RuntimeError> {
        let output = self.run(&["image", "inspect", reference])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_object(&stderr) {
                return Err(RuntimeError::ImageNotFound(reference.to_owned()));
            }
            return Err(RuntimeError::ExecFailed(format!(
                "{} image inspect {reference}: {}",
                self.binary,
                stderr.trim()
            )));
        }
        parse_image_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    fn container_meta(&self, id: &EnvironmentId) -> Result<ContainerMeta, RuntimeError> {
        Ok(meta_from_inspect(&self.inspect(id)?))
    }

    fn port_mappings(&self, id: &EnvironmentId) -> Result<Vec<String>, RuntimeError> {
        Ok(ports_from_inspect(&self.inspect(id)?))
    }

    fn mounts(&self, id: &EnvironmentId) -> Result<Vec<String>, RuntimeError> {
        Ok(mounts_from_inspect(&self.inspect(id)?))
    }

    fn apt_sources(&self, id: &EnvironmentId) -> Result<AptSources, RuntimeError> {
        let sources = self.capture(
            id,
            &format!(
                "cat {} {}/*.list 2>/dev/null || true",
                probe::APT_SOURCES_PATH,
                probe::APT_SOURCES_DIR
            ),
        )?;
        let pin = self.capture(id, &cat_script(probe::APT_RELEASE_PIN_PATH))?;
        Ok(probe::apt_sources_from_files(&sources, &pin))
    }

    fn registries(&self, id: &EnvironmentId) -> Result<Registries, RuntimeError> {
        let pip = self.capture(id, &cat_script(probe::PIP_CONF_PATH))?;
        let npm = self.capture(id, &cat_script(probe::NPMRC_PATH))?;
        let yarn = self.capture(id, &cat_script(probe::YARNRC_PATH))?;
        let pnpm = self.capture(id, &cat_script(probe::PNPMRC_PATH))?;
        Ok(probe::registries_from_files(&pip, &npm, &yarn, &pnpm))
    }

    fn installed_packages(
        &self,
        id: &EnvironmentId,
        manager: PackageManager,
    ) -> Result<Vec<String>, RuntimeError> {
        let output = self.capture(id, package_query_script(manager))?;
        Ok(match manager {
            PackageManager::Apt | PackageManager::Pip => probe::parse_lines(&output),
            PackageManager::Npm => probe::parse_npm_ls_json(&output),
            PackageManager::Yarn => probe::parse_yarn_global_list(&output),
            PackageManager::Pnpm => probe::parse_pnpm_ls_json(&output),
        })
    }

    fn execute(
        &self,
        id: &EnvironmentId,
        commands: &[String],
        show_output: bool,
    ) -> Result<(), RuntimeError> {
        for script in commands {
            debug!("exec in {id}: {}", first_line(script));
            let mut cmd = Command::new(&self.binary);
            cmd.args(["exec", "-u", "root", id.as_str(), "sh", "-c", script])
                .stdin(Stdio::null());
            let (success, code, stderr) = if show_output {
                let status = cmd
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()?;
                (status.success(), status.code(), String::new())
            } else {
                let output = cmd.output()?;
                (
                    output.status.success(),
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                )
            };
            if !success {
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                warn!("command failed in {id}: {}", first_line(script));
                return Err(RuntimeError::ExecFailed(format!(
                    "`{}` exited with code {}{}",
                    first_line(script),
                    code.unwrap_or(1),
                    if tail.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", tail.join("\n"))
                    }
                )));
            }
        }
        Ok(())
    }

    fn commit_to_image(&self, id: &EnvironmentId, tag: &str) -> Result<String, RuntimeError> {
        let output = self.run(&["commit", id.as_str(), tag])?;
        if !output.status.success() {
            return Err(RuntimeError::ExecFailed(format!(
                "{} commit {id} {tag}: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["rmi", tag])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_object(&stderr) {
                return Err(RuntimeError::ImageNotFound(tag.to_owned()));
            }
            return Err(RuntimeError::ExecFailed(format!(
                "{} rmi {tag}: {}",
                self.binary,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
