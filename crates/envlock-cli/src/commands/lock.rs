use super::{json_pretty, maybe_spinner, spin_fail, spin_ok, EXIT_SUCCESS};
use envlock_core::{CancelToken, Engine};
use std::path::Path;

pub fn run(
    engine: &Engine,
    project: &str,
    output: Option<&Path>,
    json: bool,
    token: &CancelToken,
) -> Result<u8, String> {
    let pb = maybe_spinner(json, &format!("capturing {project}..."));
    let result = match engine.lock(project, output, token) {
        Ok(r) => r,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("lock failed for {project}"));
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!(
            "{}",
            json_pretty(&serde_json::json!({
                "project": result.record.project,
                "path": result.path,
                "checksum": result.record.snapshot.checksum(),
                "packages": result.record.snapshot.packages.total(),
            }))?
        );
    } else if let Some(pb) = &pb {
        spin_ok(
            pb,
            &format!(
                "locked {} ({} package(s)) to {}",
                result.record.project,
                result.record.snapshot.packages.total(),
                result.path.display()
            ),
        );
        if let Some(checksum) = result.record.snapshot.checksum() {
            println!("checksum: {checksum}");
        }
    }
    Ok(EXIT_SUCCESS)
}
