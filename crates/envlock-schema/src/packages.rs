//! Package specifier parsing for the five supported package managers.
//!
//! A specifier is a manager-specific `name<sep>version` string (`git=1:2.39.2-1`,
//! `flask==2.3.0`, `@types/node@20.4.5`). Parsing is deliberately permissive:
//! blank and malformed entries are skipped and counted, never rejected, so an odd
//! line in `pip freeze` output cannot block reconciliation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Pip,
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    /// Fixed order used for hashing, diffing, and planning.
    pub const ALL: [PackageManager; 5] = [
        PackageManager::Apt,
        PackageManager::Pip,
        PackageManager::Npm,
        PackageManager::Yarn,
        PackageManager::Pnpm,
    ];

    pub fn separator(self) -> &'static str {
        match self {
            PackageManager::Apt => "=",
            PackageManager::Pip => "==",
            PackageManager::Npm | PackageManager::Yarn | PackageManager::Pnpm => "@",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Pip => "pip",
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }

    /// Render a `name<sep>version` specifier for this manager.
    pub fn spec(self, name: &str, version: &str) -> String {
        format!("{name}{}{version}", self.separator())
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of parsing a specifier list: `name -> version` plus bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPackages {
    pub versions: BTreeMap<String, String>,
    /// Blank-free entries that had no usable separator, name, or version.
    pub skipped: usize,
    /// Entries whose name was already seen; the later entry won.
    pub duplicates: usize,
}

impl ParsedPackages {
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.versions.get(name).map(String::as_str)
    }
}

/// Split a single specifier into a lower-cased name and a version.
///
/// `=` and `==` split on the first occurrence; `@` splits on the last one so that
/// scoped npm names keep their leading `@`. A bare `@scope/name` has its only `@`
/// at position 0 and does not parse.
pub fn split_spec(entry: &str, separator: &str) -> Option<(String, String)> {
    let entry = entry.trim();
    if separator.is_empty() || entry.is_empty() {
        return None;
    }
    let idx = if separator == "@" {
        entry.rfind('@').filter(|&i| i > 0)?
    } else {
        entry.find(separator)?
    };
    let name = entry[..idx].trim();
    let version = entry[idx + separator.len()..].trim();
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((name.to_lowercase(), version.to_owned()))
}

/// Parse a list of specifiers into a `name -> version` mapping.
///
/// Duplicate names resolve last-write-wins.
pub fn parse_package_specs(list: &[String], separator: &str) -> ParsedPackages {
    let mut parsed = ParsedPackages::default();
    for entry in list {
        if entry.trim().is_empty() {
            continue;
        }
        match split_spec(entry, separator) {
            Some((name, version)) => {
                if parsed.versions.insert(name, version).is_some() {
                    parsed.duplicates += 1;
                }
            }
            None => {
                debug!("skipping malformed package specifier '{entry}'");
                parsed.skipped += 1;
            }
        }
    }
    if parsed.duplicates > 0 {
        warn!(
            "{} duplicate package name(s) for separator '{separator}', last entry wins",
            parsed.duplicates
        );
    }
    parsed
}

/// Canonical stored form of a specifier list: trimmed, blank-free, one entry per
/// package name (last write wins), sorted.
///
/// Unparseable entries are kept verbatim (keyed by their full text) so that
/// normalization never silently discards captured data.
pub fn normalize_package_list(list: &[String], manager: PackageManager) -> Vec<String> {
    let mut by_key: BTreeMap<String, String> = BTreeMap::new();
    for entry in list {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = split_spec(trimmed, manager.separator())
            .map_or_else(|| trimmed.to_owned(), |(name, _)| name);
        by_key.insert(key, trimmed.to_owned());
    }
    let mut out: Vec<String> = by_key.into_values().collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn parses_apt_epoch_version() {
        let parsed = parse_package_specs(&list(&["git=1:2.39.2-1"]), "=");
        assert_eq!(parsed.get("git"), Some("1:2.39.2-1"));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn parses_scoped_npm_name_on_last_at() {
        let parsed = parse_package_specs(&list(&["@types/node@20.4.5"]), "@");
        assert_eq!(parsed.get("@types/node"), Some("20.4.5"));
    }

    #[test]
    fn parses_pip_double_equals() {
        let parsed = parse_package_specs(&list(&["flask==2.3.0"]), "==");
        assert_eq!(parsed.get("flask"), Some("2.3.0"));
    }

    #[test]
    fn lowercases_names_but_not_versions() {
        let parsed = parse_package_specs(&list(&["Django==4.2.0RC1"]), "==");
        assert_eq!(parsed.get("django"), Some("4.2.0RC1"));
    }

    #[test]
    fn bare_scoped_name_is_dropped() {
        let parsed = parse_package_specs(&list(&["@scope/name", "left-pad@1.3.0"]), "@");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.get("left-pad"), Some("1.3.0"));
    }

    #[test]
    fn blanks_are_ignored_and_not_counted() {
        let parsed = parse_package_specs(&list(&["", "   ", "curl=7.88.1-10"]), "=");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.skipped, 0);
    }

    #[test]
    fn malformed_entries_are_skipped_and_counted() {
        let parsed = parse_package_specs(
            &list(&["requests", "pkg @ file:///tmp/pkg", "=1.0", "numpy=="]),
            "==",
        );
        assert!(parsed.is_empty());
        assert_eq!(parsed.skipped, 4);
    }

    #[test]
    fn duplicate_names_last_write_wins() {
        let parsed = parse_package_specs(&list(&["flask==2.3.0", "Flask==2.4.0"]), "==");
        assert_eq!(parsed.get("flask"), Some("2.4.0"));
        assert_eq!(parsed.duplicates, 1);
    }

    #[test]
    fn pip_separator_does_not_split_single_equals() {
        assert_eq!(split_spec("weird=1.0", "=="), None);
        assert_eq!(
            split_spec("pkg==1.0==rc", "=="),
            Some(("pkg".to_owned(), "1.0==rc".to_owned()))
        );
    }

    #[test]
    fn normalize_sorts_and_dedups_by_name() {
        let out = normalize_package_list(
            &list(&["vim=9.0.1-1", " git=1:2.39.2-1 ", "", "Vim=9.1.0-1"]),
            PackageManager::Apt,
        );
        assert_eq!(out, vec!["Vim=9.1.0-1", "git=1:2.39.2-1"]);
    }

    #[test]
    fn normalize_keeps_unparseable_entries() {
        let out = normalize_package_list(&list(&["leftpad", "a@1"]), PackageManager::Npm);
        assert_eq!(out, vec!["a@1", "leftpad"]);
    }

    #[test]
    fn manager_separators() {
        assert_eq!(PackageManager::Apt.separator(), "=");
        assert_eq!(PackageManager::Pip.separator(), "==");
        assert_eq!(PackageManager::Pnpm.separator(), "@");
        assert_eq!(PackageManager::Yarn.spec("react", "18.2.0"), "react@18.2.0");
    }
}
