//! Reconciliation planning and configuration file rendering.
//!
//! The planner turns per-manager package diffs into an ordered list of
//! corrective commands. Registry and apt-source settings are reconciled by
//! rewriting whole files, so replaying the same commands is idempotent.

use crate::diff::diff_packages;
use crate::CoreError;
use envlock_runtime::probe::{
    APT_RELEASE_PIN_PATH, APT_SOURCES_PATH, NPMRC_PATH, PIP_CONF_PATH, PNPMRC_PATH, YARNRC_PATH,
};
use envlock_runtime::ShellCommand;
use envlock_schema::{AptSources, PackageManager, PackageSet, Registries};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Refresh,
    Install,
    Remove,
    Autoremove,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Refresh => "refresh",
            ActionKind::Install => "install",
            ActionKind::Remove => "remove",
            ActionKind::Autoremove => "autoremove",
        })
    }
}

/// One corrective command and the manager it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileAction {
    pub manager: PackageManager,
    pub kind: ActionKind,
    /// Specifiers for installs, bare names for removals.
    pub targets: Vec<String>,
    pub command: ShellCommand,
}

impl ReconcileAction {
    pub fn render(&self) -> Result<String, CoreError> {
        Ok(self.command.render()?)
    }
}

fn install_command(manager: PackageManager, specs: &[String]) -> ShellCommand {
    let base = match manager {
        PackageManager::Apt => ShellCommand::exec(
            "apt-get",
            &["install", "-y", "--no-install-recommends", "--allow-downgrades"],
        )
        .with_env("DEBIAN_FRONTEND", "noninteractive"),
        PackageManager::Pip => ShellCommand::exec("pip", &["install"]),
        PackageManager::Npm => ShellCommand::exec("npm", &["install", "-g"]),
        PackageManager::Yarn => ShellCommand::exec("yarn", &["global", "add"]),
        PackageManager::Pnpm => ShellCommand::exec("pnpm", &["add", "-g"]),
    };
    base.with_args(specs.iter().cloned())
}

fn remove_command(manager: PackageManager, names: &[String]) -> ShellCommand {
    let base = match manager {
        PackageManager::Apt => ShellCommand::exec("apt-get", &["remove", "-y"]),
        PackageManager::Pip => ShellCommand::exec("pip", &["uninstall", "-y"]),
        PackageManager::Npm => ShellCommand::exec("npm", &["uninstall", "-g"]),
        PackageManager::Yarn => ShellCommand::exec("yarn", &["global", "remove"]),
        PackageManager::Pnpm => ShellCommand::exec("pnpm", &["remove", "-g"]),
    };
    base.with_args(names.iter().cloned())
}

fn action(manager: PackageManager, kind: ActionKind, targets: Vec<String>) -> ReconcileAction {
    let command = match kind {
        ActionKind::Install => install_command(manager, &targets),
        ActionKind::Remove => remove_command(manager, &targets),
        ActionKind::Refresh => ShellCommand::exec("apt-get", &["update"]),
        ActionKind::Autoremove => ShellCommand::exec("apt-get", &["autoremove", "-y"]),
    };
    ReconcileAction {
        manager,
        kind,
        targets,
        command,
    }
}

/// Plan one manager: installs (missing or version-mismatched) before removals.
///
/// apt batches every install into one call preceded by a metadata refresh and
/// every removal into one call followed by an autoremove. The other managers
/// get one command per package.
pub fn plan_manager(
    manager: PackageManager,
    declared: &[String],
    live: &[String],
) -> Vec<ReconcileAction> {
    let diff = diff_packages(manager, declared, live);
    let mut wanted: BTreeMap<&str, &str> = diff
        .removed
        .iter()
        .map(|(name, version)| (name.as_str(), version.as_str()))
        .collect();
    for (name, (version, _)) in &diff.changed {
        wanted.insert(name, version);
    }
    let installs: Vec<String> = wanted
        .into_iter()
        .map(|(name, version)| manager.spec(name, version))
        .collect();
    let removals: Vec<String> = diff.added.into_keys().collect();

    let mut actions = Vec::new();
    if manager == PackageManager::Apt {
        if !installs.is_empty() {
            actions.push(action(manager, ActionKind::Refresh, Vec::new()));
            actions.push(action(manager, ActionKind::Install, installs));
        }
        if !removals.is_empty() {
            actions.push(action(manager, ActionKind::Remove, removals));
            actions.push(action(manager, ActionKind::Autoremove, Vec::new()));
        }
        return actions;
    }

    actions.extend(
        installs
            .into_iter()
            .map(|spec| action(manager, ActionKind::Install, vec![spec])),
    );
    actions.extend(
        removals
            .into_iter()
            .map(|name| action(manager, ActionKind::Remove, vec![name])),
    );
    actions
}

/// Plan every manager in the fixed order apt, pip, npm, yarn, pnpm.
pub fn plan(declared: &PackageSet, live: &PackageSet) -> Vec<ReconcileAction> {
    PackageManager::ALL
        .iter()
        .flat_map(|&m| plan_manager(m, declared.get(m), live.get(m)))
        .collect()
}

/// A configuration file rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigCommand {
    /// What the file configures (`pip`, `npm`, `apt-sources`, …).
    pub target: &'static str,
    pub command: ShellCommand,
}

impl ConfigCommand {
    pub fn render(&self) -> Result<String, CoreError> {
        Ok(self.command.render()?)
    }
}

const ALLOWED_SCHEMES: [&str; 3] = ["http", "https", "file"];

/// Accept only `http`, `https` and `file` URLs without whitespace or control
/// characters.
pub fn validate_registry_url(field: &str, url: &str) -> Result<(), CoreError> {
    if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::Validation(format!(
            "{field}: URL contains whitespace or control characters"
        )));
    }
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| CoreError::Validation(format!("{field}: '{url}' is not a URL")))?;
    if !ALLOWED_SCHEMES.contains(&scheme.as_str()) {
        return Err(CoreError::Validation(format!(
            "{field}: scheme '{scheme}' is not allowed (expected http, https or file)"
        )));
    }
    Ok(())
}

pub fn validate_release_name(release: &str) -> Result<(), CoreError> {
    if release.is_empty()
        || !release
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(CoreError::Validation(format!(
            "apt release '{release}' must match [A-Za-z0-9._-]+"
        )));
    }
    Ok(())
}

/// Validate every declared registry URL and apt-source setting.
pub fn validate_sources(registries: &Registries, apt: &AptSources) -> Result<(), CoreError> {
    for (field, url) in registries.urls() {
        if !url.is_empty() {
            validate_registry_url(field, url)?;
        }
    }
    if !apt.snapshot_url.is_empty() {
        validate_registry_url("apt snapshot url", &apt.snapshot_url)?;
    }
    if !apt.pinned_release.is_empty() {
        validate_release_name(&apt.pinned_release)?;
    }
    for line in &apt.sources_lists {
        if line.chars().any(char::is_control) {
            return Err(CoreError::Validation(
                "apt source line contains control characters".to_owned(),
            ));
        }
    }
    Ok(())
}

fn pip_conf(registries: &Registries) -> String {
    let mut out = String::from("[global]\n");
    if !registries.pip_index_url.is_empty() {
        out.push_str(&format!("index-url = {}\n", registries.pip_index_url));
    }
    let mut extras = registries.pip_extra_index_urls.iter();
    if let Some(first) = extras.next() {
        out.push_str(&format!("extra-index-url = {first}\n"));
        for url in extras {
            out.push_str(&format!("    {url}\n"));
        }
    }
    out
}

/// Render the file rewrites for every non-empty declared setting, after
/// validating them.
pub fn render_config_commands(
    registries: &Registries,
    apt: &AptSources,
) -> Result<Vec<ConfigCommand>, CoreError> {
    validate_sources(registries, apt)?;

    let mut commands = Vec::new();
    if !registries.pip_index_url.is_empty() || !registries.pip_extra_index_urls.is_empty() {
        commands.push(ConfigCommand {
            target: "pip",
            command: ShellCommand::write_file(PIP_CONF_PATH, pip_conf(registries)),
        });
    }
    let npmrc_style = [
        ("npm", NPMRC_PATH, &registries.npm_registry),
        ("pnpm", PNPMRC_PATH, &registries.pnpm_registry),
    ];
    for (target, path, url) in npmrc_style {
        if !url.is_empty() {
            commands.push(ConfigCommand {
                target,
                command: ShellCommand::write_file(path, format!("registry={url}\n")),
            });
        }
    }
    if !registries.yarn_registry.is_empty() {
        commands.push(ConfigCommand {
            target: "yarn",
            command: ShellCommand::write_file(
                YARNRC_PATH,
                format!("registry \"{}\"\n", registries.yarn_registry),
            ),
        });
    }
    if !apt.sources_lists.is_empty() {
        let mut body = apt.sources_lists.join("\n");
        body.push('\n');
        commands.push(ConfigCommand {
            target: "apt-sources",
            command: ShellCommand::write_file(APT_SOURCES_PATH, body),
        });
    }
    if !apt.pinned_release.is_empty() {
        commands.push(ConfigCommand {
            target: "apt-release",
            command: ShellCommand::write_file(
                APT_RELEASE_PIN_PATH,
                format!("APT::Default-Release \"{}\";\n", apt.pinned_release),
            ),
        });
    }
    Ok(commands)
}
