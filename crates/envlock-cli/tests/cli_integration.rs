//! CLI subprocess integration tests.
//!
//! These tests invoke the `envlock` binary against the in-memory `mock`
//! backend and verify exit codes, stdout content, and JSON output.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Sandbox {
    home: tempfile::TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        Self::with_config(|store| {
            format!(
                "[runtime]\nbackend = \"mock\"\n\n[store]\nroot = \"{}\"\n",
                store.display()
            )
        })
    }

    fn with_config(render: impl FnOnce(&Path) -> String) -> Self {
        let home = tempfile::tempdir().unwrap();
        let config = home.path().join("config.toml");
        std::fs::write(&config, render(&home.path().join("store"))).unwrap();
        Self { home, config }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_envlock"));
        cmd.env("HOME", self.home.path())
            .env_remove("ENVLOCK_CONFIG")
            .env_remove("ENVLOCK_LOG")
            .arg("--config")
            .arg(&self.config);
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.cmd().args(args).output().unwrap()
    }

    fn project_dir(&self) -> PathBuf {
        self.home.path().join("api")
    }

    fn lock_path(&self) -> PathBuf {
        self.project_dir().join("envlock.lock.json")
    }

    fn register(&self) {
        let dir = self.project_dir();
        let output = self.run(&[
            "register",
            "api",
            "--container",
            "api-dev",
            "--image",
            "python:3.11-slim",
            "--dir",
            dir.to_str().unwrap(),
            "--setup",
            "pip install -r requirements.txt",
        ]);
        assert!(output.status.success(), "register failed: {}", stderr(&output));
    }

    fn register_and_lock(&self) {
        self.register();
        let output = self.run(&["lock", "api"]);
        assert!(output.status.success(), "lock failed: {}", stderr(&output));
    }

    fn edit_lock(&self, edit: impl FnOnce(&mut serde_json::Value)) {
        let content = std::fs::read_to_string(self.lock_path()).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&content).unwrap();
        edit(&mut value);
        std::fs::write(self.lock_path(), serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn json(output: &Output) -> serde_json::Value {
    serde_json::from_str(&stdout(output))
        .unwrap_or_else(|e| panic!("invalid JSON ({e}): {}", stdout(output)))
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_envlock"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("envlock"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_envlock"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["register", "projects", "lock", "verify", "apply", "diff"] {
        assert!(text.contains(command), "help must list '{command}'");
    }
}

#[test]
fn cli_completions_bash() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["completions", "bash"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("envlock"));
}

#[test]
fn cli_register_and_list_projects() {
    let sandbox = Sandbox::new();
    sandbox.register();

    let output = sandbox.run(&["--json", "projects"]);
    assert!(output.status.success());
    let projects = json(&output);
    let projects = projects.as_array().unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["name"], "api");
    assert_eq!(projects[0]["environment_id"], "api-dev");
    assert_eq!(projects[0]["setup_commands"][0], "pip install -r requirements.txt");
}

#[test]
fn cli_register_twice_needs_force() {
    let sandbox = Sandbox::new();
    sandbox.register();
    let dir = sandbox.project_dir();
    let base = [
        "register",
        "api",
        "--container",
        "api-dev2",
        "--image",
        "python:3.12-slim",
        "--dir",
        dir.to_str().unwrap(),
    ];
    let output = sandbox.run(&base);
    assert_eq!(output.status.code(), Some(104), "{}", stderr(&output));

    let mut forced = base.to_vec();
    forced.push("--force");
    assert!(sandbox.run(&forced).status.success());
}

#[test]
fn cli_register_rejects_bad_name() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&[
        "register",
        "bad name!",
        "--container",
        "x",
        "--image",
        "alpine:3.19",
    ]);
    assert_eq!(output.status.code(), Some(104));
    assert!(stderr(&output).contains("validation error"));
}

#[test]
fn cli_lock_then_verify_matches() {
    let sandbox = Sandbox::new();
    sandbox.register_and_lock();
    assert!(sandbox.lock_path().exists());

    let output = sandbox.run(&["--json", "verify", "api"]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let outcome = json(&output);
    assert_eq!(outcome["fast_path"], true);
    assert_eq!(outcome["stored_checksum"], outcome["live_checksum"]);
    assert!(outcome["drift"].as_array().unwrap().is_empty());
}

#[test]
fn cli_lock_output_path() {
    let sandbox = Sandbox::new();
    sandbox.register();
    let out = sandbox.home.path().join("custom.lock.json");
    let output = sandbox.run(&["--json", "lock", "api", "--output", out.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(out.exists());
    assert!(!sandbox.lock_path().exists());
    assert!(json(&output)["checksum"].as_str().unwrap().starts_with("sha256:"));
}

#[test]
fn cli_verify_exit_code_is_drift_count() {
    let sandbox = Sandbox::new();
    sandbox.register_and_lock();
    sandbox.edit_lock(|record| {
        record["packages"]["pip"] = serde_json::json!(["flask==2.3.0"]);
        record["packages"]["npm"] = serde_json::json!(["typescript@5.4.5"]);
    });

    let output = sandbox.run(&["verify", "api"]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("pip packages: 0 added, 1 removed, 0 changed"));
    assert!(text.contains("npm packages"));
}

#[test]
fn cli_diff_reports_but_exits_zero() {
    let sandbox = Sandbox::new();
    sandbox.register_and_lock();
    sandbox.edit_lock(|record| {
        record["packages"]["pip"] = serde_json::json!(["flask==2.3.0"]);
    });

    let output = sandbox.run(&["--json", "diff", "api"]);
    assert_eq!(output.status.code(), Some(0));
    let report = json(&output);
    let items = report.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["category"], "pip");
}

#[test]
fn cli_apply_dry_run_lists_commands() {
    let sandbox = Sandbox::new();
    sandbox.register_and_lock();
    sandbox.edit_lock(|record| {
        record["packages"]["pip"] = serde_json::json!(["flask==2.3.0"]);
    });

    let output = sandbox.run(&["--json", "apply", "api", "--dry-run"]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let result = json(&output);
    assert_eq!(result["dry_run"], true);
    assert_eq!(result["executed"], 0);
    assert_eq!(result["commands"], serde_json::json!(["pip install flask==2.3.0"]));
}

#[test]
fn cli_apply_rejects_unsafe_registry() {
    let sandbox = Sandbox::new();
    sandbox.register_and_lock();
    sandbox.edit_lock(|record| {
        record["registries"]["pip_index_url"] = serde_json::json!("ftp://mirror.example/simple");
    });

    let output = sandbox.run(&["apply", "api"]);
    assert_eq!(output.status.code(), Some(104));
    assert!(stderr(&output).contains("pip_index_url"));
}

#[test]
fn cli_verify_unknown_project_fails() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["verify", "ghost"]);
    assert_eq!(output.status.code(), Some(101));
    assert!(stderr(&output).contains("not found"));
}

#[test]
fn cli_verify_without_lock_fails() {
    let sandbox = Sandbox::new();
    sandbox.register();
    let output = sandbox.run(&["verify", "api"]);
    assert_eq!(output.status.code(), Some(101));
    assert!(stderr(&output).contains("envlock lock api"));
}

#[test]
fn cli_corrupt_lock_is_parse_error() {
    let sandbox = Sandbox::new();
    sandbox.register_and_lock();
    std::fs::write(sandbox.lock_path(), "{ not json").unwrap();
    let output = sandbox.run(&["verify", "api"]);
    assert_eq!(output.status.code(), Some(102));
}

#[test]
fn cli_future_lock_version_is_parse_error() {
    let sandbox = Sandbox::new();
    sandbox.register_and_lock();
    sandbox.edit_lock(|record| record["version"] = serde_json::json!(99));
    let output = sandbox.run(&["verify", "api"]);
    assert_eq!(output.status.code(), Some(102));
}

#[test]
fn cli_invalid_config_is_parse_error() {
    let sandbox = Sandbox::with_config(|_| "[runtime]\nbakend = \"mock\"\n".to_owned());
    let output = sandbox.run(&["projects"]);
    assert_eq!(output.status.code(), Some(102));
    assert!(stderr(&output).contains("invalid config"));
}

#[test]
fn cli_unknown_backend_is_runtime_unavailable() {
    let sandbox = Sandbox::with_config(|store| {
        format!(
            "[runtime]\nbackend = \"lxc\"\n\n[store]\nroot = \"{}\"\n",
            store.display()
        )
    });
    let output = sandbox.run(&["projects"]);
    assert_eq!(output.status.code(), Some(103));
}
