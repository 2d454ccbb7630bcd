//! Runtime backends for envlock environments.
//!
//! This crate implements the execution layer: the `EnvironmentRuntime` trait with
//! a docker-compatible CLI backend and an in-memory mock, the in-container probes
//! that recover registry and apt-source settings, and the structured
//! `ShellCommand` type whose rendering is the single shell-escaping boundary.

pub mod backend;
pub mod docker;
pub mod mock;
pub mod probe;
pub mod shell;

pub use backend::{
    query_installed_packages, select_backend, ContainerMeta, EnvironmentRuntime, ImageDigest,
    RuntimeStatus,
};
pub use docker::DockerBackend;
pub use mock::{MockBackend, MockEnvironment};
pub use shell::{shell_escape, ShellCommand, HEREDOC_DELIMITER};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available")]
    Unavailable(String),
    #[error("environment '{0}' not found")]
    EnvironmentNotFound(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("failed to parse runtime output: {0}")]
    Parse(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("refusing to render unsafe content: {0}")]
    UnsafeContent(String),
}
