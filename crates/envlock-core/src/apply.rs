use crate::capture::{capture_snapshot, require_running};
use crate::concurrency::{run_with_timeout, CancelToken};
use crate::diff::{diff_field, diff_map, diff_set};
use crate::engine::Engine;
use crate::plan::{plan, render_config_commands, ConfigCommand, ReconcileAction};
use crate::CoreError;
use envlock_schema::{ContainerConfig, EnvironmentId, Snapshot};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Which group of commands an apply was executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStage {
    Configuration,
    Packages,
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApplyStage::Configuration => "configuration",
            ApplyStage::Packages => "packages",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub project: String,
    pub dry_run: bool,
    pub warnings: Vec<String>,
    pub config_commands: Vec<ConfigCommand>,
    pub actions: Vec<ReconcileAction>,
    /// Number of commands executed successfully.
    pub executed: usize,
    /// Set only when a rollback image was taken and is still present.
    pub rollback_tag: Option<String>,
}

impl ApplyResult {
    pub fn is_noop(&self) -> bool {
        self.config_commands.is_empty() && self.actions.is_empty()
    }

    /// Every command in execution order, as shell text.
    pub fn rendered_commands(&self) -> Result<Vec<String>, CoreError> {
        let config = self.config_commands.iter().map(ConfigCommand::render);
        let actions = self.actions.iter().map(ReconcileAction::render);
        config.chain(actions).collect()
    }
}

/// Container-level drift that apply cannot reconcile in place.
pub fn container_warnings(declared: &ContainerConfig, live: &ContainerConfig) -> Vec<String> {
    let diffs = [
        diff_field("working dir", &declared.working_dir, &live.working_dir),
        diff_field("user", &declared.user, &live.user),
        diff_field("restart policy", &declared.restart_policy, &live.restart_policy),
        diff_field("network", &declared.network, &live.network),
        diff_set("capabilities", &declared.capabilities, &live.capabilities),
        diff_map("resources", &declared.resources, &live.resources),
        diff_map("environment", &declared.environment, &live.environment),
    ];
    diffs
        .into_iter()
        .filter(|lines| !lines.is_empty())
        .map(|lines| {
            format!(
                "container drift needs a recreate, not apply: {}",
                lines.join("; ")
            )
        })
        .collect()
}

/// Whether the file behind a config command differs from the live state.
fn config_drifted(target: &str, declared: &Snapshot, live: &Snapshot) -> bool {
    let (dr, lr) = (&declared.registries, &live.registries);
    let (da, la) = (&declared.apt_sources, &live.apt_sources);
    match target {
        "pip" => {
            !diff_field("", &dr.pip_index_url, &lr.pip_index_url).is_empty()
                || !diff_set("", &dr.pip_extra_index_urls, &lr.pip_extra_index_urls).is_empty()
        }
        "npm" => !diff_field("", &dr.npm_registry, &lr.npm_registry).is_empty(),
        "yarn" => !diff_field("", &dr.yarn_registry, &lr.yarn_registry).is_empty(),
        "pnpm" => !diff_field("", &dr.pnpm_registry, &lr.pnpm_registry).is_empty(),
        "apt-sources" => {
            !diff_set("", &da.sources_lists, &la.sources_lists).is_empty()
                || !diff_field("", &da.snapshot_url, &la.snapshot_url).is_empty()
        }
        "apt-release" => !diff_field("", &da.pinned_release, &la.pinned_release).is_empty(),
        _ => true,
    }
}

/// What a running apply has committed so far, readable by a caller that
/// stopped waiting for it.
#[derive(Debug, Default)]
struct ApplyProgress {
    stage: Option<ApplyStage>,
    rollback_tag: Option<String>,
}

type SharedProgress = Arc<Mutex<ApplyProgress>>;

fn record_progress(progress: &SharedProgress, update: impl FnOnce(&mut ApplyProgress)) {
    if let Ok(mut state) = progress.lock() {
        update(&mut state);
    }
}

fn rollback_tag(project: &str) -> String {
    format!(
        "envlock-rollback-{}:{}",
        project.to_lowercase(),
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    )
}

impl Engine {
    /// Reconcile the live environment towards the project's lock record.
    ///
    /// Registry URLs and release names are validated before any runtime call.
    /// A dry run stops after planning. Otherwise the container is committed to
    /// a rollback image, configuration files are rewritten, and package
    /// commands run in plan order. On failure the rollback image is kept and
    /// reported; it is never restored automatically.
    ///
    /// A dry run never starts a stopped environment; it fails with
    /// `RuntimeUnavailable` instead.
    pub fn apply(
        &self,
        project: &str,
        dry_run: bool,
        token: &CancelToken,
    ) -> Result<ApplyResult, CoreError> {
        self.apply_tracked(project, dry_run, token, &SharedProgress::default())
    }

    fn apply_tracked(
        &self,
        project: &str,
        dry_run: bool,
        token: &CancelToken,
        progress: &SharedProgress,
    ) -> Result<ApplyResult, CoreError> {
        let entry = self.project(project)?;
        let record = self.load_record(&entry)?;
        let declared = &record.snapshot;
        let mut config_commands =
            render_config_commands(&declared.registries, &declared.apt_sources)?;
        token.check()?;

        let id = &entry.environment_id;
        let live = if dry_run {
            require_running(self.runtime(), id)?;
            capture_snapshot(
                self.runtime(),
                id,
                &declared.base_image.name,
                &declared.setup_commands,
                token,
            )?
        } else {
            self.capture_live(id, &declared.base_image.name, &declared.setup_commands, token)?
        };

        let warnings = container_warnings(&declared.container, &live.container);
        for warning in &warnings {
            warn!("{project}: {warning}");
        }
        config_commands.retain(|c| config_drifted(c.target, declared, &live));
        let actions = plan(&declared.packages, &live.packages);

        let mut result = ApplyResult {
            project: entry.name.clone(),
            dry_run,
            warnings,
            config_commands,
            actions,
            executed: 0,
            rollback_tag: None,
        };
        let config_scripts: Vec<String> = result
            .config_commands
            .iter()
            .map(ConfigCommand::render)
            .collect::<Result<_, _>>()?;
        let action_scripts: Vec<String> = result
            .actions
            .iter()
            .map(ReconcileAction::render)
            .collect::<Result<_, _>>()?;

        if dry_run {
            info!(
                "{project}: dry run, {} command(s) planned",
                config_scripts.len() + action_scripts.len()
            );
            return Ok(result);
        }
        if result.is_noop() {
            info!("{project}: nothing to apply");
            return Ok(result);
        }
        token.check()?;

        let tag = rollback_tag(&entry.name);
        match self.runtime.commit_to_image(id, &tag) {
            Ok(image_id) => {
                info!("{project}: rollback image {tag} ({image_id})");
                record_progress(progress, |p| p.rollback_tag = Some(tag.clone()));
                result.rollback_tag = Some(tag);
            }
            Err(e) => {
                let msg = format!("rollback snapshot failed, rollback will be unavailable: {e}");
                warn!("{project}: {msg}");
                result.warnings.push(msg);
            }
        }

        for (stage, scripts) in [
            (ApplyStage::Configuration, &config_scripts),
            (ApplyStage::Packages, &action_scripts),
        ] {
            record_progress(progress, |p| p.stage = Some(stage));
            self.run_stage(id, stage, scripts, &mut result, token)?;
        }

        if let Some(tag) = result.rollback_tag.take() {
            match self.runtime.remove_image(&tag) {
                Ok(()) => record_progress(progress, |p| p.rollback_tag = None),
                Err(e) => {
                    let msg = format!("could not remove rollback image {tag}: {e}");
                    warn!("{project}: {msg}");
                    result.warnings.push(msg);
                    result.rollback_tag = Some(tag);
                }
            }
        }
        info!("{project}: applied {} command(s)", result.executed);
        Ok(result)
    }

    fn run_stage(
        &self,
        id: &EnvironmentId,
        stage: ApplyStage,
        scripts: &[String],
        result: &mut ApplyResult,
        token: &CancelToken,
    ) -> Result<(), CoreError> {
        for script in scripts {
            let failure = |message: String| {
                warn!(
                    "{}: {stage} stage stopped: {message}",
                    result.project
                );
                CoreError::PartialFailure {
                    stage,
                    rollback_tag: result.rollback_tag.clone(),
                    message,
                }
            };
            if token.is_cancelled() {
                return Err(failure("cancelled before completion".to_owned()));
            }
            if let Err(e) = self.runtime.execute(id, std::slice::from_ref(script), false) {
                return Err(failure(e.to_string()));
            }
            result.executed += 1;
        }
        Ok(())
    }

    /// `apply` on a worker thread, bounded by `timeout`.
    ///
    /// A timeout after the rollback image was committed is reported as a
    /// `PartialFailure` carrying that image's tag.
    pub fn apply_with_timeout(
        &self,
        project: &str,
        dry_run: bool,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<ApplyResult, CoreError> {
        let engine = self.clone();
        let name = project.to_owned();
        let progress = SharedProgress::default();
        let worker_progress = Arc::clone(&progress);
        let outcome = run_with_timeout("apply", timeout, token, move |token| {
            engine.apply_tracked(&name, dry_run, &token, &worker_progress)
        });

        match outcome {
            Err(CoreError::Timeout(limit)) => {
                let (stage, rollback_tag) = progress
                    .lock()
                    .map(|p| (p.stage, p.rollback_tag.clone()))
                    .unwrap_or_default();
                match rollback_tag {
                    Some(tag) => {
                        warn!("{project}: timed out with rollback image {tag} in place");
                        Err(CoreError::PartialFailure {
                            stage: stage.unwrap_or(ApplyStage::Configuration),
                            rollback_tag: Some(tag),
                            message: format!("timed out after {}s", limit.as_secs()),
                        })
                    }
                    None => Err(CoreError::Timeout(limit)),
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn container_warnings_cover_unreconcilable_fields() {
        let declared = ContainerConfig {
            user: "root".to_owned(),
            environment: BTreeMap::from([("APP_ENV".to_owned(), "dev".to_owned())]),
            ..ContainerConfig::default()
        };
        let live = ContainerConfig {
            user: "dev".to_owned(),
            environment: BTreeMap::from([("APP_ENV".to_owned(), "prod".to_owned())]),
            ..ContainerConfig::default()
        };
        let warnings = container_warnings(&declared, &live);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("user"));
        assert!(warnings[1].contains("changed: APP_ENV: dev → prod"));
        assert!(container_warnings(&declared, &declared).is_empty());
    }

    #[test]
    fn rollback_tag_is_lowercase() {
        let tag = rollback_tag("MyApi");
        assert!(tag.starts_with("envlock-rollback-myapi:"));
    }

    #[test]
    fn config_drift_per_target() {
        let mut declared = Snapshot::default();
        declared.registries.npm_registry = "https://npm.internal/".to_owned();
        let mut live = declared.clone();
        assert!(!config_drifted("npm", &declared, &live));
        live.registries.npm_registry = "https://registry.npmjs.org/".to_owned();
        assert!(config_drifted("npm", &declared, &live));
        assert!(!config_drifted("pip", &declared, &live));
    }
}
