use super::{json_pretty, maybe_spinner, spin_fail, spin_ok, EXIT_SUCCESS};
use envlock_core::{ApplyResult, CancelToken, Engine};
use std::time::Duration;

pub fn run(
    engine: &Engine,
    project: &str,
    dry_run: bool,
    timeout: Duration,
    json: bool,
    token: &CancelToken,
) -> Result<u8, String> {
    let verb = if dry_run { "planning" } else { "applying" };
    let pb = maybe_spinner(json, &format!("{verb} {project}..."));
    let result = match engine.apply_with_timeout(project, dry_run, timeout, token) {
        Ok(r) => r,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("apply failed for {project}"));
            }
            return Err(e.to_string());
        }
    };
    let commands = result.rendered_commands().map_err(|e| e.to_string())?;

    if json {
        let mut value = serde_json::to_value(&result)
            .map_err(|e| format!("JSON serialization failed: {e}"))?;
        value["commands"] = serde_json::json!(commands);
        println!("{}", json_pretty(&value)?);
        return Ok(EXIT_SUCCESS);
    }

    if let Some(pb) = &pb {
        spin_ok(pb, &summary(&result));
    }
    for warning in &result.warnings {
        eprintln!("{} {warning}", console::style("warning:").yellow().bold());
    }
    if dry_run {
        for command in &commands {
            println!("  {command}");
        }
    }
    if let Some(tag) = &result.rollback_tag {
        println!("rollback image kept as {tag}");
    }
    Ok(EXIT_SUCCESS)
}

fn summary(result: &ApplyResult) -> String {
    if result.is_noop() {
        format!("{} already matches its lock", result.project)
    } else if result.dry_run {
        format!(
            "{}: would run {} command(s)",
            result.project,
            result.config_commands.len() + result.actions.len()
        )
    } else {
        format!("{}: applied {} command(s)", result.project, result.executed)
    }
}
