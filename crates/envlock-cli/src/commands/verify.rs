use super::{drift_exit_code, json_pretty, maybe_spinner, print_report, spin_fail, spin_ok};
use envlock_core::{CancelToken, Engine};
use std::time::Duration;

pub fn run(
    engine: &Engine,
    project: &str,
    timeout: Duration,
    json: bool,
    token: &CancelToken,
) -> Result<u8, String> {
    let pb = maybe_spinner(json, &format!("verifying {project}..."));
    let outcome = match engine.verify_with_timeout(project, timeout, token) {
        Ok(o) => o,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("verify failed for {project}"));
            }
            return Err(e.to_string());
        }
    };
    let code = drift_exit_code(outcome.drift_count());

    if json {
        println!("{}", json_pretty(&outcome)?);
        return Ok(code);
    }
    if let Some(pb) = &pb {
        if outcome.matches() {
            let how = if outcome.fast_path {
                format!("checksum {}", outcome.live_checksum)
            } else {
                "full comparison".to_owned()
            };
            spin_ok(pb, &format!("{project} matches its lock ({how})"));
        } else {
            spin_fail(
                pb,
                &format!("{project}: {} difference(s)", outcome.drift_count()),
            );
        }
    }
    if !outcome.matches() {
        print_report(&outcome.drift);
    }
    Ok(code)
}
