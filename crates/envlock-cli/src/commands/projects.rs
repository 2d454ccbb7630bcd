use super::{json_pretty, EXIT_SUCCESS};
use envlock_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let projects = engine.projects().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&projects)?);
    } else if projects.is_empty() {
        println!("no projects registered");
    } else {
        println!("{:<20} {:<24} {:<10} IMAGE", "PROJECT", "CONTAINER", "LOCKED");
        for p in &projects {
            let locked = if p.lock_path().exists() {
                console::style("yes").green().to_string()
            } else {
                console::style("no").dim().to_string()
            };
            println!(
                "{:<20} {:<24} {:<10} {}",
                p.name, p.environment_id, locked, p.image
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
