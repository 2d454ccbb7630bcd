mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::exit_code_for;
use envlock_core::{install_signal_handler, CancelToken, Config, Engine};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "envlock",
    version,
    about = "Lock, verify and reconcile container-backed development environments"
)]
struct Cli {
    /// Path to the configuration file (default: ~/.config/envlock/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Record a project and the container backing it.
    Register {
        /// Project name ([a-zA-Z0-9_-], at most 64 characters).
        project: String,
        /// Container name or id of the environment.
        #[arg(long)]
        container: String,
        /// Declared base image reference.
        #[arg(long)]
        image: String,
        /// Directory holding the lock record (default: current directory).
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Setup command that built the environment (repeatable).
        #[arg(long = "setup")]
        setup: Vec<String>,
        /// Replace an existing registration.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// List registered projects.
    Projects,
    /// Capture the environment and write its lock record.
    Lock {
        project: String,
        /// Write the record here instead of the project's canonical path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check the environment against its lock record (exit code = drift count).
    Verify {
        project: String,
        /// Time budget in seconds (default from config).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Reconcile the environment towards its lock record.
    Apply {
        project: String,
        /// Print the planned commands without running anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Time budget in seconds (default from config).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show the drift report without failing on drift.
    Diff { project: String },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ENVLOCK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        return finish(commands::completions::run::<Cli>(shell));
    }

    let config = match Config::resolve(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => return finish(Err(e.to_string())),
    };
    let engine = match Engine::from_config(&config) {
        Ok(e) => e,
        Err(e) => return finish(Err(e.to_string())),
    };
    let token = CancelToken::new();
    install_signal_handler(token.clone());
    let json = cli.json;

    let result = match cli.command {
        Commands::Register {
            project,
            container,
            image,
            dir,
            setup,
            force,
        } => commands::register::run(
            &engine,
            &commands::register::RegisterArgs {
                name: &project,
                container: &container,
                image: &image,
                dir: dir.as_deref(),
                setup: &setup,
                force,
            },
            json,
        ),
        Commands::Projects => commands::projects::run(&engine, json),
        Commands::Lock { project, output } => {
            commands::lock::run(&engine, &project, output.as_deref(), json, &token)
        }
        Commands::Verify { project, timeout } => {
            let timeout = timeout.map_or_else(|| config.verify_timeout(), Duration::from_secs);
            commands::verify::run(&engine, &project, timeout, json, &token)
        }
        Commands::Apply {
            project,
            dry_run,
            timeout,
        } => {
            let timeout = timeout.map_or_else(|| config.apply_timeout(), Duration::from_secs);
            commands::apply::run(&engine, &project, dry_run, timeout, json, &token)
        }
        Commands::Diff { project } => commands::diff::run(&engine, &project, json, &token),
        Commands::Completions { .. } => Ok(commands::EXIT_SUCCESS),
    };

    finish(result)
}

fn finish(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}
