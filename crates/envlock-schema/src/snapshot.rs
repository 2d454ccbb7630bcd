use crate::checksum::compute_checksum;
use crate::packages::{normalize_package_list, PackageManager};
use crate::types::Checksum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The image an environment is derived from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseImage {
    pub name: String,
    /// Content identity of the image layer set (`sha256:…` or a repo digest).
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub id: String,
}

/// Runtime configuration of the container backing an environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub restart_policy: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu: String,
}

/// Installed packages per manager, as `name<sep>version` specifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageSet {
    #[serde(default)]
    pub apt: Vec<String>,
    #[serde(default)]
    pub pip: Vec<String>,
    #[serde(default)]
    pub npm: Vec<String>,
    #[serde(default)]
    pub yarn: Vec<String>,
    #[serde(default)]
    pub pnpm: Vec<String>,
}

impl PackageSet {
    pub fn get(&self, manager: PackageManager) -> &[String] {
        match manager {
            PackageManager::Apt => &self.apt,
            PackageManager::Pip => &self.pip,
            PackageManager::Npm => &self.npm,
            PackageManager::Yarn => &self.yarn,
            PackageManager::Pnpm => &self.pnpm,
        }
    }

    pub fn get_mut(&mut self, manager: PackageManager) -> &mut Vec<String> {
        match manager {
            PackageManager::Apt => &mut self.apt,
            PackageManager::Pip => &mut self.pip,
            PackageManager::Npm => &mut self.npm,
            PackageManager::Yarn => &mut self.yarn,
            PackageManager::Pnpm => &mut self.pnpm,
        }
    }

    pub fn total(&self) -> usize {
        PackageManager::ALL.iter().map(|m| self.get(*m).len()).sum()
    }

    /// Sort and dedup every manager's list into its canonical stored form.
    pub fn normalize(&mut self) {
        for manager in PackageManager::ALL {
            let list = self.get_mut(manager);
            *list = normalize_package_list(list, manager);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registries {
    #[serde(default)]
    pub pip_index_url: String,
    #[serde(default)]
    pub pip_extra_index_urls: Vec<String>,
    #[serde(default)]
    pub npm_registry: String,
    #[serde(default)]
    pub yarn_registry: String,
    #[serde(default)]
    pub pnpm_registry: String,
}

impl Registries {
    /// Every configured URL with the field it came from, blanks omitted.
    pub fn urls(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if !self.pip_index_url.trim().is_empty() {
            out.push(("pip_index_url", self.pip_index_url.as_str()));
        }
        for extra in &self.pip_extra_index_urls {
            if !extra.trim().is_empty() {
                out.push(("pip_extra_index_urls", extra.as_str()));
            }
        }
        for (field, value) in [
            ("npm_registry", &self.npm_registry),
            ("yarn_registry", &self.yarn_registry),
            ("pnpm_registry", &self.pnpm_registry),
        ] {
            if !value.trim().is_empty() {
                out.push((field, value.as_str()));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AptSources {
    #[serde(default)]
    pub snapshot_url: String,
    #[serde(default)]
    pub sources_lists: Vec<String>,
    #[serde(default)]
    pub pinned_release: String,
}

/// Canonical, hashable description of an environment.
///
/// The checksum is derived: it is only ever set by [`Snapshot::seal`] and is
/// re-derived by [`Snapshot::verify_checksum`]. Mutating a sealed snapshot
/// leaves a stale checksum that verification will reject.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub base_image: BaseImage,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub packages: PackageSet,
    #[serde(default)]
    pub registries: Registries,
    #[serde(default)]
    pub apt_sources: AptSources,
    /// Commands that produced the environment. Order is significant.
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) checksum: Option<Checksum>,
}

impl Snapshot {
    pub fn new(
        base_image: BaseImage,
        container: ContainerConfig,
        packages: PackageSet,
        registries: Registries,
        apt_sources: AptSources,
        setup_commands: Vec<String>,
    ) -> Self {
        Self {
            base_image,
            container,
            packages,
            registries,
            apt_sources,
            setup_commands,
            checksum: None,
        }
    }

    /// Sort-normalize every order-insensitive list.
    ///
    /// Ports and volumes keep their captured order: the hasher and the diff
    /// engine treat them as sets, so their stored order does not matter.
    pub fn normalize(&mut self) {
        self.packages.normalize();
        normalize_string_list(&mut self.container.capabilities);
        normalize_string_list(&mut self.registries.pip_extra_index_urls);
        normalize_string_list(&mut self.apt_sources.sources_lists);
    }

    /// Normalize and compute the checksum, consuming the draft.
    #[must_use]
    pub fn seal(mut self) -> Self {
        self.normalize();
        self.checksum = Some(compute_checksum(&self));
        self
    }

    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    /// `true` if a checksum is stored and still matches the content.
    pub fn verify_checksum(&self) -> bool {
        self.checksum
            .as_ref()
            .is_some_and(|stored| *stored == compute_checksum(self))
    }

    /// A copy without the stored checksum, ready for editing and resealing.
    #[must_use]
    pub fn unsealed(&self) -> Self {
        Self {
            checksum: None,
            ..self.clone()
        }
    }
}

fn normalize_string_list(values: &mut Vec<String>) {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    *values = out;
}
