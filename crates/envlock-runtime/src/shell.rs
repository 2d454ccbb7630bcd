//! Structured shell commands and the single escaping boundary.
//!
//! Commands are built as program + argument lists and only turned into shell
//! text by [`ShellCommand::render`], which runs every user-controlled value
//! through [`shell_escape`].

use crate::RuntimeError;
use serde::Serialize;
use std::fmt::Write as _;

/// Delimiter used for heredoc full-file rewrites. Quoted, so the body is literal.
pub const HEREDOC_DELIMITER: &str = "ENVLOCK_EOF";

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
}

/// Escape a value for use as one word in a POSIX shell command line.
///
/// Every character outside `[A-Za-z0-9_@%+=:,./-]` is backslash-escaped, which
/// covers backslash, single and double quotes, backtick and `$`. Newlines cannot
/// be backslash-escaped and are emitted as a single-quoted `'\n'` segment. The
/// empty string renders as `''`.
pub fn shell_escape(value: &str) -> String {
    if value.is_empty() {
        return "''".to_owned();
    }
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\n' => out.push_str("'\n'"),
            c if is_safe_char(c) => out.push(c),
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out
}

/// A command to run inside an environment, before shell serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellCommand {
    Exec {
        env: Vec<(String, String)>,
        program: String,
        args: Vec<String>,
    },
    /// Replace a file's full content (heredoc); repeated runs are idempotent.
    WriteFile { path: String, contents: String },
}

impl ShellCommand {
    pub fn exec(program: &str, args: &[&str]) -> Self {
        ShellCommand::Exec {
            env: Vec::new(),
            program: program.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        if let ShellCommand::Exec { env, .. } = &mut self {
            env.push((key.to_owned(), value.to_owned()));
        }
        self
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let ShellCommand::Exec { args, .. } = &mut self {
            args.extend(extra.into_iter().map(Into::into));
        }
        self
    }

    pub fn write_file(path: &str, contents: impl Into<String>) -> Self {
        ShellCommand::WriteFile {
            path: path.to_owned(),
            contents: contents.into(),
        }
    }

    /// Serialize to a single `sh -c` script.
    pub fn render(&self) -> Result<String, RuntimeError> {
        match self {
            ShellCommand::Exec { env, program, args } => {
                let mut out = String::new();
                for (key, value) in env {
                    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
                    {
                        return Err(RuntimeError::UnsafeContent(format!(
                            "invalid environment variable name '{key}'"
                        )));
                    }
                    let _ = write!(out, "{key}={} ", shell_escape(value));
                }
                out.push_str(&shell_escape(program));
                for arg in args {
                    out.push(' ');
                    out.push_str(&shell_escape(arg));
                }
                Ok(out)
            }
            ShellCommand::WriteFile { path, contents } => {
                if contents.lines().any(|l| l.trim() == HEREDOC_DELIMITER) {
                    return Err(RuntimeError::UnsafeContent(format!(
                        "contents for {path} contain the heredoc delimiter"
                    )));
                }
                let quoted = shell_escape(path);
                let mut body = contents.clone();
                if !body.is_empty() && !body.ends_with('\n') {
                    body.push('\n');
                }
                let parent = match path.rfind('/') {
                    Some(0) | None => "/".to_owned(),
                    Some(i) => path[..i].to_owned(),
                };
                Ok(format!(
                    "mkdir -p {} && cat > {quoted} <<'{HEREDOC_DELIMITER}'\n{body}{HEREDOC_DELIMITER}",
                    shell_escape(&parent)
                ))
            }
        }
    }
}
