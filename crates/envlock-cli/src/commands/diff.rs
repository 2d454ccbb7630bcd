use super::{json_pretty, maybe_spinner, print_report, EXIT_SUCCESS};
use envlock_core::{CancelToken, Engine};

/// Read-only drift report; drift alone never fails the command.
pub fn run(engine: &Engine, project: &str, json: bool, token: &CancelToken) -> Result<u8, String> {
    let pb = maybe_spinner(json, &format!("comparing {project}..."));
    let report = engine.diff(project, token);
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let report = report.map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else if report.is_empty() {
        println!("no drift detected in {project}");
    } else {
        println!("{} difference(s) in {project}:", report.len());
        print_report(&report);
    }
    Ok(EXIT_SUCCESS)
}
