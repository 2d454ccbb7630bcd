use crate::packages::PackageManager;
use crate::snapshot::Snapshot;
use crate::types::Checksum;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const CHECKSUM_PREFIX: &str = "sha256:";

/// Compute the reproducibility digest of a snapshot.
///
/// Fields are fed in a fixed order, each terminated by NUL. Ports, volumes and
/// capabilities are hashed as sorted sets and maps by sorted key, so reordering
/// them never changes the digest. `setup_commands` are hashed in their original
/// order. Package lists are hashed in stored order, which [`Snapshot::seal`]
/// has already sorted.
///
/// Any change to this field order is a record format change and must bump
/// `LOCK_RECORD_VERSION`.
pub fn compute_checksum(snapshot: &Snapshot) -> Checksum {
    let mut hasher = Sha256::new();

    write_field(&mut hasher, &snapshot.base_image.name);
    write_field(&mut hasher, &snapshot.base_image.digest);

    let c = &snapshot.container;
    hasher.update(b"container:");
    write_field(&mut hasher, &c.working_dir);
    write_field(&mut hasher, &c.user);
    write_field(&mut hasher, &c.restart_policy);
    write_field(&mut hasher, &c.network);
    write_field(&mut hasher, &c.gpu);

    write_set(&mut hasher, "ports", &c.ports);
    write_set(&mut hasher, "volumes", &c.volumes);
    write_set(&mut hasher, "capabilities", &c.capabilities);

    write_map(&mut hasher, "environment", &c.environment);
    write_map(&mut hasher, "labels", &c.labels);
    write_map(&mut hasher, "resources", &c.resources);

    hasher.update(b"setup:");
    for cmd in &snapshot.setup_commands {
        write_field(&mut hasher, cmd);
    }

    for manager in PackageManager::ALL {
        hasher.update(format!("packages.{manager}:").as_bytes());
        for spec in snapshot.packages.get(manager) {
            write_field(&mut hasher, spec);
        }
    }

    let r = &snapshot.registries;
    hasher.update(b"registries:");
    write_field(&mut hasher, &r.pip_index_url);
    for url in &r.pip_extra_index_urls {
        write_field(&mut hasher, url);
    }
    hasher.update(b"npm:");
    write_field(&mut hasher, &r.npm_registry);
    write_field(&mut hasher, &r.yarn_registry);
    write_field(&mut hasher, &r.pnpm_registry);

    let a = &snapshot.apt_sources;
    hasher.update(b"apt_sources:");
    write_field(&mut hasher, &a.snapshot_url);
    for line in &a.sources_lists {
        write_field(&mut hasher, line);
    }
    hasher.update(b"release:");
    write_field(&mut hasher, &a.pinned_release);

    Checksum::new(format!(
        "{CHECKSUM_PREFIX}{}",
        hex::encode(hasher.finalize())
    ))
}

fn write_field(hasher: &mut Sha256, value: &str) {
    hasher.update(value.as_bytes());
    hasher.update([0u8]);
}

fn write_set(hasher: &mut Sha256, label: &str, items: &[String]) {
    let mut sorted: Vec<&str> = items.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    hasher.update(format!("{label}:").as_bytes());
    for item in sorted {
        write_field(hasher, item);
    }
}

fn write_map(hasher: &mut Sha256, label: &str, map: &BTreeMap<String, String>) {
    hasher.update(format!("{label}:").as_bytes());
    for (key, value) in map {
        write_field(hasher, key);
        write_field(hasher, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{AptSources, BaseImage, ContainerConfig, PackageSet, Registries};

    fn sample() -> Snapshot {
        let mut container = ContainerConfig {
            working_dir: "/workspace".to_owned(),
            user: "dev".to_owned(),
            restart_policy: "unless-stopped".to_owned(),
            network: "bridge".to_owned(),
            ports: vec!["8080:80/tcp".to_owned(), "5432:5432/tcp".to_owned()],
            volumes: vec!["/src:/workspace".to_owned(), "cache:/root/.cache".to_owned()],
            capabilities: vec!["SYS_PTRACE".to_owned(), "NET_ADMIN".to_owned()],
            gpu: String::new(),
            ..ContainerConfig::default()
        };
        container.environment.insert("LANG".to_owned(), "C.UTF-8".to_owned());
        container.environment.insert("PATH".to_owned(), "/usr/bin".to_owned());
        container.labels.insert("team".to_owned(), "web".to_owned());
        container.resources.insert("memory".to_owned(), "2g".to_owned());

        Snapshot::new(
            BaseImage {
                name: "debian:bookworm".to_owned(),
                digest: "sha256:1111".to_owned(),
                id: "sha256:2222".to_owned(),
            },
            container,
            PackageSet {
                apt: vec!["curl=7.88.1-10".to_owned(), "git=1:2.39.2-1".to_owned()],
                pip: vec!["flask==2.3.0".to_owned()],
                ..PackageSet::default()
            },
            Registries {
                pip_index_url: "https://pypi.org/simple".to_owned(),
                ..Registries::default()
            },
            AptSources::default(),
            vec!["apt-get update".to_owned(), "make bootstrap".to_owned()],
        )
    }

    #[test]
    fn checksum_is_deterministic_and_prefixed() {
        let s = sample();
        let a = compute_checksum(&s);
        let b = compute_checksum(&s);
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn list_order_does_not_matter() {
        let base = sample();
        let mut permuted = sample();
        permuted.container.ports.reverse();
        permuted.container.volumes.reverse();
        permuted.container.capabilities.reverse();
        assert_eq!(compute_checksum(&base), compute_checksum(&permuted));
    }

    #[test]
    fn map_insertion_order_does_not_matter() {
        let base = sample();
        let mut rebuilt = sample();
        rebuilt.container.environment.clear();
        rebuilt.container.environment.insert("PATH".to_owned(), "/usr/bin".to_owned());
        rebuilt.container.environment.insert("LANG".to_owned(), "C.UTF-8".to_owned());
        assert_eq!(compute_checksum(&base), compute_checksum(&rebuilt));
    }

    #[test]
    fn setup_command_order_matters() {
        let base = sample();
        let mut swapped = sample();
        swapped.setup_commands.reverse();
        assert_ne!(compute_checksum(&base), compute_checksum(&swapped));
    }

    #[test]
    fn sensitive_fields_change_the_digest() {
        let base = compute_checksum(&sample());

        let mut s = sample();
        s.base_image.name = "debian:trixie".to_owned();
        assert_ne!(base, compute_checksum(&s));

        let mut s = sample();
        s.packages.pip = vec!["flask==2.4.0".to_owned()];
        assert_ne!(base, compute_checksum(&s));

        let mut s = sample();
        s.container.gpu = "all".to_owned();
        assert_ne!(base, compute_checksum(&s));

        let mut s = sample();
        s.setup_commands.push("npm ci".to_owned());
        assert_ne!(base, compute_checksum(&s));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let mut a = sample();
        a.container.user = "ab".to_owned();
        a.container.working_dir = "c".to_owned();
        let mut b = sample();
        b.container.user = "b".to_owned();
        b.container.working_dir = "ca".to_owned();
        assert_ne!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn package_moved_between_managers_changes_digest() {
        let mut a = sample();
        a.packages.npm = vec!["left-pad@1.3.0".to_owned()];
        let mut b = sample();
        b.packages.yarn = vec!["left-pad@1.3.0".to_owned()];
        assert_ne!(compute_checksum(&a), compute_checksum(&b));
    }
}
