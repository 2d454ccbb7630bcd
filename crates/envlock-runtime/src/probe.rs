//! In-container configuration files and the parsers that read them back.
//!
//! The apply orchestrator rewrites these files in full; the live-state probes
//! parse them to recover the effective registry and apt-source settings.

use envlock_schema::{AptSources, Registries};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const PIP_CONF_PATH: &str = "/etc/pip.conf";
pub const NPMRC_PATH: &str = "/usr/local/etc/npmrc";
pub const YARNRC_PATH: &str = "/root/.yarnrc";
pub const PNPMRC_PATH: &str = "/root/.config/pnpm/rc";
pub const APT_SOURCES_PATH: &str = "/etc/apt/sources.list";
pub const APT_SOURCES_DIR: &str = "/etc/apt/sources.list.d";
pub const APT_RELEASE_PIN_PATH: &str = "/etc/apt/apt.conf.d/99envlock-release";

/// Parse `index-url` and `extra-index-url` from a pip.conf `[global]` section.
///
/// `extra-index-url` may hold several whitespace-separated URLs, including on
/// indented continuation lines.
pub fn parse_pip_conf(content: &str) -> (String, Vec<String>) {
    let mut index = String::new();
    let mut extras = Vec::new();
    let mut in_global = false;
    let mut in_extra = false;

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_global = line.eq_ignore_ascii_case("[global]") || line.eq_ignore_ascii_case("[install]");
            in_extra = false;
            continue;
        }
        if !in_global {
            continue;
        }
        let continuation = raw.starts_with(' ') || raw.starts_with('\t');
        if continuation && in_extra {
            extras.extend(line.split_whitespace().map(str::to_owned));
            continue;
        }
        in_extra = false;
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "index-url" | "index_url" => index = value.trim().to_owned(),
            "extra-index-url" | "extra_index_url" => {
                extras.extend(value.split_whitespace().map(str::to_owned));
                in_extra = true;
            }
            _ => {}
        }
    }
    (index, extras)
}

/// Parse `registry=<url>` from an npmrc-style file.
pub fn parse_npmrc_registry(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#') && !l.starts_with(';'))
        .find_map(|l| {
            let (key, value) = l.split_once('=')?;
            (key.trim() == "registry").then(|| value.trim().to_owned())
        })
        .unwrap_or_default()
}

/// Parse `registry "<url>"` from a yarn v1 rc file.
pub fn parse_yarnrc_registry(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find_map(|l| {
            let rest = l.strip_prefix("registry")?;
            if !rest.starts_with([' ', '\t']) {
                return None;
            }
            Some(rest.trim().trim_matches('"').to_owned())
        })
        .unwrap_or_default()
}

pub fn registries_from_files(
    pip_conf: &str,
    npmrc: &str,
    yarnrc: &str,
    pnpmrc: &str,
) -> Registries {
    let (pip_index_url, pip_extra_index_urls) = parse_pip_conf(pip_conf);
    Registries {
        pip_index_url,
        pip_extra_index_urls,
        npm_registry: parse_npmrc_registry(npmrc),
        yarn_registry: parse_yarnrc_registry(yarnrc),
        pnpm_registry: parse_npmrc_registry(pnpmrc),
    }
}

/// Active `deb`/`deb-src` lines from one or more sources.list files.
pub fn parse_sources_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("deb ") || l.starts_with("deb-src "))
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

/// The repository URL of a `deb` line, skipping an optional `[options]` block.
pub fn source_line_url(line: &str) -> Option<&str> {
    let mut tokens = line.split_whitespace().skip(1);
    let mut token = tokens.next()?;
    if token.starts_with('[') {
        while !token.ends_with(']') {
            token = tokens.next()?;
        }
        token = tokens.next()?;
    }
    Some(token)
}

/// Parse `APT::Default-Release "<release>";`.
pub fn parse_release_pin(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find_map(|l| {
            let rest = l.strip_prefix("APT::Default-Release")?;
            Some(rest.trim().trim_end_matches(';').trim().trim_matches('"').to_owned())
        })
        .unwrap_or_default()
}

pub fn apt_sources_from_files(sources: &str, release_pin: &str) -> AptSources {
    let sources_lists = parse_sources_lines(sources);
    let snapshot_url = sources_lists
        .iter()
        .filter_map(|l| source_line_url(l))
        .find(|url| url.contains("snapshot."))
        .unwrap_or_default()
        .to_owned();
    AptSources {
        snapshot_url,
        sources_lists,
        pinned_release: parse_release_pin(release_pin),
    }
}

#[derive(Debug, Deserialize)]
struct NpmLsDependency {
    #[serde(default)]
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct NpmLsOutput {
    #[serde(default)]
    dependencies: BTreeMap<String, NpmLsDependency>,
}

/// Parse `npm ls -g --depth=0 --json` into `name@version` specifiers.
pub fn parse_npm_ls_json(output: &str) -> Vec<String> {
    let parsed: NpmLsOutput = serde_json::from_str(output).unwrap_or_default();
    specs_from_dependencies(parsed.dependencies)
}

/// Parse `pnpm ls -g --depth=0 --json`, which wraps one object per root in an array.
pub fn parse_pnpm_ls_json(output: &str) -> Vec<String> {
    let roots: Vec<NpmLsOutput> = serde_json::from_str(output).unwrap_or_default();
    let mut deps = BTreeMap::new();
    for root in roots {
        deps.extend(root.dependencies);
    }
    specs_from_dependencies(deps)
}

fn specs_from_dependencies(deps: BTreeMap<String, NpmLsDependency>) -> Vec<String> {
    deps.into_iter()
        .filter(|(_, d)| !d.version.is_empty())
        .map(|(name, d)| format!("{name}@{}", d.version))
        .collect()
}

/// Parse `yarn global list` lines of the form `info "name@version" has binaries:`.
pub fn parse_yarn_global_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| {
            let rest = l.trim().strip_prefix("info \"")?;
            let end = rest.find('"')?;
            Some(rest[..end].to_owned())
        })
        .collect()
}

/// Non-empty output lines, trimmed.
pub fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}
