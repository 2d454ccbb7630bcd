//! Drift detection between a declared snapshot and a live one.
//!
//! Four pure primitives (field, set, map, package) back both the read-only
//! `diff` report and the verify fallback. Each primitive returns its report
//! lines, empty when the two sides agree.

use envlock_schema::{parse_package_specs, PackageManager, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftCategory {
    BaseImage,
    Container,
    Apt,
    Pip,
    Npm,
    Yarn,
    Pnpm,
    Registry,
    AptSource,
}

impl DriftCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DriftCategory::BaseImage => "base-image",
            DriftCategory::Container => "container",
            DriftCategory::Apt => "apt",
            DriftCategory::Pip => "pip",
            DriftCategory::Npm => "npm",
            DriftCategory::Yarn => "yarn",
            DriftCategory::Pnpm => "pnpm",
            DriftCategory::Registry => "registry",
            DriftCategory::AptSource => "apt-source",
        }
    }
}

impl From<PackageManager> for DriftCategory {
    fn from(manager: PackageManager) -> Self {
        match manager {
            PackageManager::Apt => DriftCategory::Apt,
            PackageManager::Pip => DriftCategory::Pip,
            PackageManager::Npm => DriftCategory::Npm,
            PackageManager::Yarn => DriftCategory::Yarn,
            PackageManager::Pnpm => DriftCategory::Pnpm,
        }
    }
}

impl fmt::Display for DriftCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One drifted field, set, map or package list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftItem {
    pub category: DriftCategory,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// Ordered drift items; empty means the environment matches its lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriftReport {
    items: Vec<DriftItem>,
}

impl DriftReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the output of a diff primitive; empty output adds nothing.
    ///
    /// The first line becomes the item description, the rest its details.
    pub fn record(&mut self, category: DriftCategory, lines: Vec<String>) {
        let mut lines = lines.into_iter();
        if let Some(description) = lines.next() {
            self.items.push(DriftItem {
                category,
                description,
                details: lines.collect(),
            });
        }
    }

    pub fn items(&self) -> &[DriftItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn categories(&self) -> BTreeSet<DriftCategory> {
        self.items.iter().map(|i| i.category).collect()
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            writeln!(f, "[{}] {}", item.category, item.description)?;
            for detail in &item.details {
                writeln!(f, "    {detail}")?;
            }
        }
        Ok(())
    }
}

fn normalize_field(value: &str) -> String {
    value.trim().to_lowercase().trim_end_matches('/').to_owned()
}

fn normalize_set(list: &[String]) -> BTreeSet<&str> {
    list.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Compare two scalar values after trimming, lower-casing and stripping
/// trailing slashes.
pub fn diff_field(name: &str, declared: &str, live: &str) -> Vec<String> {
    if normalize_field(declared) == normalize_field(live) {
        return Vec::new();
    }
    vec![format!(
        "{name}: \"{}\" (lock) != \"{}\" (live)",
        declared.trim(),
        live.trim()
    )]
}

/// Compare two lists as sets of trimmed, non-blank entries.
pub fn diff_set(name: &str, declared: &[String], live: &[String]) -> Vec<String> {
    let declared = normalize_set(declared);
    let live = normalize_set(live);
    if declared == live {
        return Vec::new();
    }
    let only_declared: Vec<&str> = declared.difference(&live).copied().collect();
    let only_live: Vec<&str> = live.difference(&declared).copied().collect();
    let mut out = vec![format!(
        "{name}: {} only in lock, {} only in live",
        only_declared.len(),
        only_live.len()
    )];
    out.extend(only_declared.iter().map(|x| format!("- {x} (in lock, not live)")));
    out.extend(only_live.iter().map(|y| format!("+ {y} (in live, not lock)")));
    out
}

/// Compare two maps key by key; lines are ordered by key.
pub fn diff_map(
    name: &str,
    declared: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
) -> Vec<String> {
    let keys: BTreeSet<&String> = declared.keys().chain(live.keys()).collect();
    let mut lines = Vec::new();
    for key in keys {
        match (declared.get(key), live.get(key)) {
            (Some(d), Some(l)) if d == l => {}
            (Some(d), Some(l)) => lines.push(format!("changed: {key}: {d} → {l}")),
            (Some(d), None) => lines.push(format!("removed: {key}={d}")),
            (None, Some(l)) => lines.push(format!("added: {key}={l}")),
            (None, None) => {}
        }
    }
    if lines.is_empty() {
        return lines;
    }
    let mut out = vec![format!("{name}: {} key(s) differ", lines.len())];
    out.extend(lines);
    out
}

/// Package-level difference for one manager, keyed by package name.
///
/// `added` are packages only in the live environment, `removed` only in the
/// lock, `changed` maps a name to `(locked, live)` versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageDiff {
    pub manager: Option<PackageManager>,
    pub added: BTreeMap<String, String>,
    pub removed: BTreeMap<String, String>,
    pub changed: BTreeMap<String, (String, String)>,
}

impl PackageDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} changed",
            self.added.len(),
            self.removed.len(),
            self.changed.len()
        )
    }

    /// Summary line followed by one line per package.
    pub fn lines(&self) -> Vec<String> {
        if self.is_empty() {
            return Vec::new();
        }
        let label = self.manager.map_or("packages", PackageManager::as_str);
        let mut out = vec![format!("{label} packages: {}", self.summary())];
        out.extend(self.added.iter().map(|(n, v)| format!("+ {n} {v} (in live, not lock)")));
        out.extend(self.removed.iter().map(|(n, v)| format!("- {n} {v} (in lock, not live)")));
        out.extend(
            self.changed
                .iter()
                .map(|(n, (d, l))| format!("~ {n}: {d} → {l}")),
        );
        out
    }
}

pub fn diff_packages(manager: PackageManager, declared: &[String], live: &[String]) -> PackageDiff {
    let declared = parse_package_specs(declared, manager.separator()).versions;
    let mut live = parse_package_specs(live, manager.separator()).versions;
    let mut diff = PackageDiff {
        manager: Some(manager),
        ..PackageDiff::default()
    };
    for (name, version) in declared {
        match live.remove(&name) {
            Some(live_version) if live_version == version => {}
            Some(live_version) => {
                diff.changed.insert(name, (version, live_version));
            }
            None => {
                diff.removed.insert(name, version);
            }
        }
    }
    diff.added = live;
    diff
}

/// Produces a drift report for a declared/live snapshot pair.
pub trait DriftDetector: Send + Sync {
    fn detect(&self, declared: &Snapshot, live: &Snapshot) -> DriftReport;
}

/// Full field-by-field comparison across every tracked part of a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine;

impl DriftDetector for DiffEngine {
    fn detect(&self, declared: &Snapshot, live: &Snapshot) -> DriftReport {
        let mut report = DriftReport::new();

        let (d, l) = (&declared.base_image, &live.base_image);
        report.record(DriftCategory::BaseImage, diff_field("base image", &d.name, &l.name));
        report.record(
            DriftCategory::BaseImage,
            diff_field("base image digest", &d.digest, &l.digest),
        );

        let (d, l) = (&declared.container, &live.container);
        let container = DriftCategory::Container;
        report.record(container, diff_field("working dir", &d.working_dir, &l.working_dir));
        report.record(container, diff_field("user", &d.user, &l.user));
        report.record(
            container,
            diff_field("restart policy", &d.restart_policy, &l.restart_policy),
        );
        report.record(container, diff_field("network", &d.network, &l.network));
        report.record(container, diff_field("gpu", &d.gpu, &l.gpu));
        report.record(container, diff_set("ports", &d.ports, &l.ports));
        report.record(container, diff_set("volumes", &d.volumes, &l.volumes));
        report.record(
            container,
            diff_set("capabilities", &d.capabilities, &l.capabilities),
        );
        report.record(container, diff_map("environment", &d.environment, &l.environment));
        report.record(container, diff_map("labels", &d.labels, &l.labels));
        report.record(container, diff_map("resources", &d.resources, &l.resources));

        for manager in PackageManager::ALL {
            let diff = diff_packages(
                manager,
                declared.packages.get(manager),
                live.packages.get(manager),
            );
            report.record(manager.into(), diff.lines());
        }

        let (d, l) = (&declared.registries, &live.registries);
        let registry = DriftCategory::Registry;
        report.record(registry, diff_field("pip index-url", &d.pip_index_url, &l.pip_index_url));
        report.record(
            registry,
            diff_set(
                "pip extra-index-url",
                &d.pip_extra_index_urls,
                &l.pip_extra_index_urls,
            ),
        );
        report.record(registry, diff_field("npm registry", &d.npm_registry, &l.npm_registry));
        report.record(registry, diff_field("yarn registry", &d.yarn_registry, &l.yarn_registry));
        report.record(registry, diff_field("pnpm registry", &d.pnpm_registry, &l.pnpm_registry));

        let (d, l) = (&declared.apt_sources, &live.apt_sources);
        let source = DriftCategory::AptSource;
        report.record(source, diff_field("apt snapshot url", &d.snapshot_url, &l.snapshot_url));
        report.record(source, diff_set("apt sources", &d.sources_lists, &l.sources_lists));
        report.record(
            source,
            diff_field("apt pinned release", &d.pinned_release, &l.pinned_release),
        );

        report
    }
}
