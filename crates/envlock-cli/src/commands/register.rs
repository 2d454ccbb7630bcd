use super::{json_pretty, EXIT_SUCCESS};
use envlock_core::Engine;
use envlock_schema::EnvironmentId;
use envlock_store::ProjectEntry;
use std::path::Path;

pub struct RegisterArgs<'a> {
    pub name: &'a str,
    pub container: &'a str,
    pub image: &'a str,
    pub dir: Option<&'a Path>,
    pub setup: &'a [String],
    pub force: bool,
}

pub fn run(engine: &Engine, args: &RegisterArgs<'_>, json: bool) -> Result<u8, String> {
    let dir = match args.dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().map_err(|e| format!("cannot read current dir: {e}"))?,
    };
    let dir = std::path::absolute(&dir).unwrap_or(dir);
    if args.container.trim().is_empty() {
        return Err("validation error: --container must not be empty".to_owned());
    }
    if args.image.trim().is_empty() {
        return Err("validation error: --image must not be empty".to_owned());
    }

    let entry = ProjectEntry::new(
        args.name,
        EnvironmentId::new(args.container.trim()),
        args.image,
        dir,
        args.setup.to_vec(),
    );
    engine
        .register(entry.clone(), args.force)
        .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&entry)?);
    } else {
        println!(
            "registered {} → {} ({})",
            console::style(&entry.name).bold(),
            entry.environment_id,
            entry.image
        );
        println!("lock record: {}", entry.lock_path().display());
    }
    Ok(EXIT_SUCCESS)
}
