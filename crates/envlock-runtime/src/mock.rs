use crate::backend::{ContainerMeta, EnvironmentRuntime, ImageDigest, RuntimeStatus};
use crate::probe;
use crate::{RuntimeError, HEREDOC_DELIMITER};
use envlock_schema::{split_spec, AptSources, EnvironmentId, PackageManager, PackageSet, Registries};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Live state of one mock environment.
#[derive(Debug, Clone, Default)]
pub struct MockEnvironment {
    pub running: bool,
    pub meta: ContainerMeta,
    pub ports: Vec<String>,
    pub mounts: Vec<String>,
    pub apt_sources: AptSources,
    pub registries: Registries,
    pub packages: PackageSet,
}

#[derive(Debug, Default)]
struct MockState {
    environments: BTreeMap<String, MockEnvironment>,
    images: BTreeMap<String, ImageDigest>,
    executed: Vec<String>,
    committed: Vec<String>,
    removed_images: Vec<String>,
    fail_on: Vec<String>,
    fail_commit: bool,
    fail_start: bool,
    delay: Option<Duration>,
}

/// In-memory runtime used by orchestrator tests and the `mock` backend.
///
/// Executed scripts are interpreted just far enough to keep the state
/// consistent: package install/remove commands and file rewrites of the
/// probed configuration files update the environment, so an apply followed by
/// a verify converges. Anything else is only recorded.
pub struct MockBackend {
    state: Mutex<MockState>,
    autocreate: bool,
    execute_calls: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            autocreate: true,
            execute_calls: AtomicUsize::new(0),
        }
    }
}

fn default_environment(id: &str) -> MockEnvironment {
    MockEnvironment {
        running: true,
        meta: ContainerMeta {
            image_id: format!("sha256:mock-image-{id}"),
            working_dir: "/workspace".to_owned(),
            user: "root".to_owned(),
            restart_policy: "no".to_owned(),
            network: "bridge".to_owned(),
            ..ContainerMeta::default()
        },
        ..MockEnvironment::default()
    }
}

fn mock_digest(reference: &str) -> ImageDigest {
    let slug: String = reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    ImageDigest {
        digest: format!("sha256:mock-{slug}"),
        image_id: format!("sha256:mock-id-{slug}"),
    }
}

/// Split a rendered command line into words, undoing backslash escapes and
/// single-quoted segments.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            '\'' => {
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
                in_word = true;
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn is_env_assignment(word: &str) -> bool {
    word.split_once('=').is_some_and(|(key, _)| {
        !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

fn upsert_package(list: &mut Vec<String>, manager: PackageManager, spec: &str) {
    let Some((name, _)) = split_spec(spec, manager.separator()) else {
        return;
    };
    remove_package(list, manager, &name);
    list.push(spec.to_owned());
    list.sort();
}

fn remove_package(list: &mut Vec<String>, manager: PackageManager, name: &str) {
    let name = name.to_lowercase();
    list.retain(|entry| {
        split_spec(entry, manager.separator()).map_or(true, |(n, _)| n != name)
    });
}

impl MockEnvironment {
    fn apply_write(&mut self, path: &str, contents: &str) {
        match path {
            probe::PIP_CONF_PATH => {
                let (index, extras) = probe::parse_pip_conf(contents);
                self.registries.pip_index_url = index;
                self.registries.pip_extra_index_urls = extras;
            }
            probe::NPMRC_PATH => self.registries.npm_registry = probe::parse_npmrc_registry(contents),
            probe::YARNRC_PATH => {
                self.registries.yarn_registry = probe::parse_yarnrc_registry(contents);
            }
            probe::PNPMRC_PATH => {
                self.registries.pnpm_registry = probe::parse_npmrc_registry(contents);
            }
            probe::APT_SOURCES_PATH => {
                let parsed = probe::apt_sources_from_files(contents, "");
                self.apt_sources.sources_lists = parsed.sources_lists;
                self.apt_sources.snapshot_url = parsed.snapshot_url;
            }
            probe::APT_RELEASE_PIN_PATH => {
                self.apt_sources.pinned_release = probe::parse_release_pin(contents);
            }
            _ => {}
        }
    }

    fn apply_exec(&mut self, words: &[String]) {
        let words: Vec<&str> = words
            .iter()
            .map(String::as_str)
            .skip_while(|w| is_env_assignment(w))
            .collect();
        let Some((&program, rest)) = words.split_first() else {
            return;
        };
        let (manager, install, operands): (PackageManager, bool, &[&str]) = match (program, rest) {
            ("apt-get", ["install", operands @ ..]) => (PackageManager::Apt, true, operands),
            ("apt-get", ["remove", operands @ ..]) => (PackageManager::Apt, false, operands),
            ("pip", ["install", operands @ ..]) => (PackageManager::Pip, true, operands),
            ("pip", ["uninstall", operands @ ..]) => (PackageManager::Pip, false, operands),
            ("npm", ["install", operands @ ..]) => (PackageManager::Npm, true, operands),
            ("npm", ["uninstall", operands @ ..]) => (PackageManager::Npm, false, operands),
            ("yarn", ["global", "add", operands @ ..]) => (PackageManager::Yarn, true, operands),
            ("yarn", ["global", "remove", operands @ ..]) => (PackageManager::Yarn, false, operands),
            ("pnpm", ["add", operands @ ..]) => (PackageManager::Pnpm, true, operands),
            ("pnpm", ["remove", operands @ ..]) => (PackageManager::Pnpm, false, operands),
            _ => return,
        };
        let list = self.packages.get_mut(manager);
        for operand in operands.iter().filter(|o| !o.starts_with('-')) {
            if install {
                upsert_package(list, manager, operand);
            } else {
                remove_package(list, manager, operand);
            }
        }
    }

    fn apply_script(&mut self, script: &str) {
        let marker = format!("<<'{HEREDOC_DELIMITER}'\n");
        if let Some(start) = script.find(&marker) {
            let header = &script[..start];
            let body = &script[start + marker.len()..];
            let body = body.strip_suffix(HEREDOC_DELIMITER).unwrap_or(body);
            if let Some(path) = header
                .rsplit_once("cat > ")
                .and_then(|(_, rest)| split_words(rest).into_iter().next())
            {
                self.apply_write(&path, body);
            }
            return;
        }
        for part in script.split(" && ") {
            self.apply_exec(&split_words(part));
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that reports unknown environments and images as missing instead
    /// of creating them on first use.
    pub fn without_autocreate() -> Self {
        Self {
            autocreate: false,
            ..Self::default()
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    fn with_env<T>(
        &self,
        id: &EnvironmentId,
        f: impl FnOnce(&mut MockEnvironment) -> T,
    ) -> Result<T, RuntimeError> {
        let delay = self.lock()?.delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.lock()?;
        if !state.environments.contains_key(id.as_str()) {
            if !self.autocreate {
                return Err(RuntimeError::EnvironmentNotFound(id.to_string()));
            }
            state
                .environments
                .insert(id.to_string(), default_environment(id));
        }
        state
            .environments
            .get_mut(id.as_str())
            .map(f)
            .ok_or_else(|| RuntimeError::EnvironmentNotFound(id.to_string()))
    }

    /// Replace (or create) an environment wholesale.
    pub fn insert_environment(&self, id: &EnvironmentId, env: MockEnvironment) {
        if let Ok(mut state) = self.lock() {
            state.environments.insert(id.to_string(), env);
        }
    }

    pub fn environment(&self, id: &EnvironmentId) -> Option<MockEnvironment> {
        self.lock().ok()?.environments.get(id.as_str()).cloned()
    }

    fn update(&self, id: &EnvironmentId, f: impl FnOnce(&mut MockEnvironment)) {
        if let Ok(mut state) = self.lock() {
            let env = state
                .environments
                .entry(id.to_string())
                .or_insert_with(|| default_environment(id));
            f(env);
        }
    }

    pub fn set_packages(&self, id: &EnvironmentId, packages: PackageSet) {
        self.update(id, |env| env.packages = packages);
    }

    pub fn set_meta(&self, id: &EnvironmentId, meta: ContainerMeta) {
        self.update(id, |env| env.meta = meta);
    }

    pub fn set_registries(&self, id: &EnvironmentId, registries: Registries) {
        self.update(id, |env| env.registries = registries);
    }

    pub fn set_apt_sources(&self, id: &EnvironmentId, sources: AptSources) {
        self.update(id, |env| env.apt_sources = sources);
    }

    pub fn set_ports(&self, id: &EnvironmentId, ports: Vec<String>) {
        self.update(id, |env| env.ports = ports);
    }

    pub fn set_mounts(&self, id: &EnvironmentId, mounts: Vec<String>) {
        self.update(id, |env| env.mounts = mounts);
    }

    pub fn set_running(&self, id: &EnvironmentId, running: bool) {
        self.update(id, |env| env.running = running);
    }

    pub fn add_image(&self, reference: &str, digest: ImageDigest) {
        if let Ok(mut state) = self.lock() {
            state.images.insert(reference.to_owned(), digest);
        }
    }

    /// Fail any executed script containing `pattern`.
    pub fn fail_commands_matching(&self, pattern: &str) {
        if let Ok(mut state) = self.lock() {
            state.fail_on.push(pattern.to_owned());
        }
    }

    pub fn fail_commit(&self, fail: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_commit = fail;
        }
    }

    pub fn fail_start(&self, fail: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_start = fail;
        }
    }

    /// Sleep this long at the start of every environment query.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut state) = self.lock() {
            state.delay = delay;
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.lock().map(|s| s.executed.clone()).unwrap_or_default()
    }

    pub fn committed(&self) -> Vec<String> {
        self.lock().map(|s| s.committed.clone()).unwrap_or_default()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.lock().map(|s| s.removed_images.clone()).unwrap_or_default()
    }

    /// Number of `execute` calls, successful or not.
    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }
}

impl EnvironmentRuntime for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn exists(&self, id: &EnvironmentId) -> Result<bool, RuntimeError> {
        let state = self.lock()?;
        Ok(self.autocreate || state.environments.contains_key(id.as_str()))
    }

    fn status(&self, id: &EnvironmentId) -> Result<RuntimeStatus, RuntimeError> {
        let running = self.with_env(id, |env| env.running)?;
        Ok(RuntimeStatus {
            environment_id: id.clone(),
            running,
            state: if running { "running" } else { "exited" }.to_owned(),
        })
    }

    fn start(&self, id: &EnvironmentId) -> Result<(), RuntimeError> {
        if self.lock()?.fail_start {
            return Err(RuntimeError::ExecFailed(format!("mock: cannot start {id}")));
        }
        self.with_env(id, |env| env.running = true)
    }

    fn resolve_image_digest(&self, reference: &str) -> Result<ImageDigest, RuntimeError> {
        let state = self.lock()?;
        if let Some(digest) = state.images.get(reference) {
            return Ok(digest.clone());
        }
        // Container image ids resolve to themselves.
        if let Some(env) = state
            .environments
            .values()
            .find(|env| env.meta.image_id == reference)
        {
            return Ok(ImageDigest {
                digest: env.meta.image_id.clone(),
                image_id: env.meta.image_id.clone(),
            });
        }
        if self.autocreate {
            return Ok(mock_digest(reference));
        }
        Err(RuntimeError::ImageNotFound(reference.to_owned()))
    }

    fn container_meta(&self, id: &EnvironmentId) -> Result<ContainerMeta, RuntimeError> {
        self.with_env(id, |env| env.meta.clone())
    }

    fn port_mappings(&self, id: &EnvironmentId) -> Result<Vec<String>, RuntimeError> {
        self.with_env(id, |env| env.ports.clone())
    }

    fn mounts(&self, id: &EnvironmentId) -> Result<Vec<String>, RuntimeError> {
        self.with_env(id, |env| env.mounts.clone())
    }

    fn apt_sources(&self, id: &EnvironmentId) -> Result<AptSources, RuntimeError> {
        self.with_env(id, |env| env.apt_sources.clone())
    }

    fn registries(&self, id: &EnvironmentId) -> Result<Registries, RuntimeError> {
        self.with_env(id, |env| env.registries.clone())
    }

    fn installed_packages(
        &self,
        id: &EnvironmentId,
        manager: PackageManager,
    ) -> Result<Vec<String>, RuntimeError> {
        self.with_env(id, |env| env.packages.get(manager).to_vec())
    }

    fn execute(
        &self,
        id: &EnvironmentId,
        commands: &[String],
        _show_output: bool,
    ) -> Result<(), RuntimeError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        for script in commands {
            let failing = {
                let mut state = self.lock()?;
                state.executed.push(script.clone());
                state.fail_on.iter().any(|p| script.contains(p.as_str()))
            };
            if failing {
                return Err(RuntimeError::ExecFailed(format!(
                    "mock: command failed: {}",
                    script.lines().next().unwrap_or_default()
                )));
            }
            self.with_env(id, |env| env.apply_script(script))?;
        }
        Ok(())
    }

    fn commit_to_image(&self, id: &EnvironmentId, tag: &str) -> Result<String, RuntimeError> {
        let mut state = self.lock()?;
        if state.fail_commit {
            return Err(RuntimeError::ExecFailed(format!("mock: commit of {id} failed")));
        }
        if !self.autocreate && !state.environments.contains_key(id.as_str()) {
            return Err(RuntimeError::EnvironmentNotFound(id.to_string()));
        }
        let image_id = format!("sha256:mock-commit-{}", state.committed.len() + 1);
        state.committed.push(tag.to_owned());
        state.images.insert(
            tag.to_owned(),
            ImageDigest {
                digest: image_id.clone(),
                image_id: image_id.clone(),
            },
        );
        Ok(image_id)
    }

    fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        if state.images.remove(tag).is_none() {
            return Err(RuntimeError::ImageNotFound(tag.to_owned()));
        }
        state.removed_images.push(tag.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShellCommand;

    fn id() -> EnvironmentId {
        EnvironmentId::new("mock-env")
    }

    #[test]
    fn autocreate_environment_is_running() {
        let backend = MockBackend::new();
        assert!(backend.exists(&id()).unwrap());
        assert!(backend.status(&id()).unwrap().running);
    }

    #[test]
    fn without_autocreate_reports_missing() {
        let backend = MockBackend::without_autocreate();
        assert!(!backend.exists(&id()).unwrap());
        assert!(matches!(
            backend.container_meta(&id()),
            Err(RuntimeError::EnvironmentNotFound(_))
        ));
        assert!(matches!(
            backend.resolve_image_digest("python:3.11"),
            Err(RuntimeError::ImageNotFound(_))
        ));
    }

    #[test]
    fn image_ids_resolve_to_themselves() {
        let backend = MockBackend::without_autocreate();
        backend.set_running(&id(), true);
        let image_id = backend.container_meta(&id()).unwrap().image_id;
        assert_eq!(backend.resolve_image_digest(&image_id).unwrap().digest, image_id);
    }

    #[test]
    fn split_words_undoes_escaping() {
        let words = split_words("pip install evil==1\\;curl\\ x\\|sh 'a b'");
        assert_eq!(words, vec!["pip", "install", "evil==1;curl x|sh", "a b"]);
    }

    #[test]
    fn executes_package_commands() {
        let backend = MockBackend::new();
        backend.set_packages(
            &id(),
            PackageSet {
                apt: vec!["git=1:2.39.2-1".to_owned(), "vim=9.0.1-1".to_owned()],
                pip: vec!["flask==2.4.0".to_owned()],
                ..PackageSet::default()
            },
        );
        let scripts: Vec<String> = [
            ShellCommand::exec("apt-get", &["install", "-y"])
                .with_env("DEBIAN_FRONTEND", "noninteractive")
                .with_args(["curl=7.88.1-10"]),
            ShellCommand::exec("apt-get", &["remove", "-y", "vim"]),
            ShellCommand::exec("pip", &["install", "flask==2.3.0"]),
        ]
        .iter()
        .map(|c| c.render().unwrap())
        .collect();
        backend.execute(&id(), &scripts, false).unwrap();

        let env = backend.environment(&id()).unwrap();
        assert_eq!(env.packages.apt, vec!["curl=7.88.1-10", "git=1:2.39.2-1"]);
        assert_eq!(env.packages.pip, vec!["flask==2.3.0"]);
        assert_eq!(backend.executed().len(), 3);
    }

    #[test]
    fn executes_file_rewrites() {
        let backend = MockBackend::new();
        let scripts = vec![
            ShellCommand::write_file(probe::NPMRC_PATH, "registry=https://npm.internal/\n")
                .render()
                .unwrap(),
            ShellCommand::write_file(probe::APT_RELEASE_PIN_PATH, "APT::Default-Release \"bookworm\";\n")
                .render()
                .unwrap(),
        ];
        backend.execute(&id(), &scripts, false).unwrap();
        let env = backend.environment(&id()).unwrap();
        assert_eq!(env.registries.npm_registry, "https://npm.internal/");
        assert_eq!(env.apt_sources.pinned_release, "bookworm");
    }

    #[test]
    fn failure_injection_stops_execution() {
        let backend = MockBackend::new();
        backend.fail_commands_matching("pip");
        let scripts = vec!["pip install x==1".to_owned(), "npm install -g y@1".to_owned()];
        assert!(backend.execute(&id(), &scripts, false).is_err());
        assert_eq!(backend.executed(), vec!["pip install x==1"]);
        assert_eq!(backend.execute_calls(), 1);
    }

    #[test]
    fn commit_and_remove_image() {
        let backend = MockBackend::new();
        backend.commit_to_image(&id(), "rollback:1").unwrap();
        backend.remove_image("rollback:1").unwrap();
        assert_eq!(backend.committed(), vec!["rollback:1"]);
        assert_eq!(backend.removed_images(), vec!["rollback:1"]);
        assert!(backend.remove_image("rollback:1").is_err());

        backend.fail_commit(true);
        assert!(backend.commit_to_image(&id(), "rollback:2").is_err());
    }
}
