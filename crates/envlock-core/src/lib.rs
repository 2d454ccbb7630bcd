//! Lock, diff, verify and apply orchestration for envlock environments.
//!
//! This crate ties the schema, the project registry and a runtime backend into
//! the `Engine`: capturing a live container as a canonical snapshot, comparing it
//! against the recorded lock, planning the minimal reconciliation, and running
//! verify and apply under a cancellable time budget.

pub mod apply;
pub mod capture;
pub mod concurrency;
pub mod config;
pub mod diff;
pub mod engine;
pub mod plan;
pub mod verify;

pub use apply::{ApplyResult, ApplyStage};
pub use capture::{capture_snapshot, ensure_running};
pub use concurrency::{install_signal_handler, run_with_timeout, CancelToken};
pub use config::Config;
pub use diff::{
    diff_field, diff_map, diff_packages, diff_set, DiffEngine, DriftCategory, DriftDetector,
    DriftItem, DriftReport, PackageDiff,
};
pub use engine::{Engine, LockResult};
pub use plan::{plan, render_config_commands, ActionKind, ConfigCommand, ReconcileAction};
pub use verify::VerifyOutcome;

use envlock_runtime::RuntimeError;
use envlock_schema::SchemaError;
use envlock_store::StoreError;
use std::time::Duration;
use thiserror::Error;

fn rollback_hint(tag: Option<&String>) -> String {
    match tag {
        Some(tag) => format!("; rollback image kept as {tag}"),
        None => "; no rollback image is available".to_owned(),
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("drift detected: {} difference(s)", .0.len())]
    DriftDetected(DriftReport),
    #[error("operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("apply failed during {stage} stage: {message}{}", rollback_hint(.rollback_tag.as_ref()))]
    PartialFailure {
        stage: ApplyStage,
        rollback_tag: Option<String>,
        message: String,
    },
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),
}

impl From<SchemaError> for CoreError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::Io(io) => CoreError::Io(io),
            other => CoreError::Parse(other.to_string()),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(io) => CoreError::Io(io),
            StoreError::ProjectNotFound(name) => {
                CoreError::NotFound(format!("project '{name}' is not registered"))
            }
            StoreError::InvalidName(msg) => CoreError::Validation(msg),
            e @ StoreError::ProjectExists(_) => CoreError::Validation(e.to_string()),
            other => CoreError::Parse(other.to_string()),
        }
    }
}

impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(msg) => CoreError::RuntimeUnavailable(msg),
            RuntimeError::EnvironmentNotFound(id) => {
                CoreError::NotFound(format!("environment '{id}' does not exist"))
            }
            RuntimeError::Cancelled => CoreError::Cancelled,
            other => CoreError::Runtime(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_message_names_rollback_tag() {
        let err = CoreError::PartialFailure {
            stage: ApplyStage::Packages,
            rollback_tag: Some("envlock-rollback-api:20240101".to_owned()),
            message: "apt-get install failed".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("packages stage"));
        assert!(msg.contains("envlock-rollback-api:20240101"));
    }

    #[test]
    fn runtime_errors_map_into_taxonomy() {
        assert!(matches!(
            CoreError::from(RuntimeError::Unavailable("docker".to_owned())),
            CoreError::RuntimeUnavailable(_)
        ));
        assert!(matches!(
            CoreError::from(RuntimeError::EnvironmentNotFound("x".to_owned())),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from(RuntimeError::ExecFailed("boom".to_owned())),
            CoreError::Runtime(_)
        ));
    }

    #[test]
    fn store_errors_map_into_taxonomy() {
        assert!(matches!(
            CoreError::from(StoreError::ProjectNotFound("api".to_owned())),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from(StoreError::InvalidName("bad".to_owned())),
            CoreError::Validation(_)
        ));
    }

    #[test]
    fn schema_version_error_is_parse() {
        assert!(matches!(
            CoreError::from(SchemaError::UnsupportedVersion(9)),
            CoreError::Parse(_)
        ));
    }
}
