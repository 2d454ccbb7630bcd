use crate::concurrency::{run_with_timeout, CancelToken};
use crate::diff::DriftReport;
use crate::engine::Engine;
use crate::CoreError;
use envlock_schema::{compute_checksum, Checksum};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub project: String,
    /// Whether the checksum comparison alone decided the outcome.
    pub fast_path: bool,
    pub stored_checksum: Option<Checksum>,
    pub live_checksum: Checksum,
    pub drift: DriftReport,
}

impl VerifyOutcome {
    pub fn matches(&self) -> bool {
        self.drift.is_empty()
    }

    pub fn drift_count(&self) -> usize {
        self.drift.len()
    }

    /// `Err(DriftDetected)` when the environment does not match its lock.
    pub fn into_result(self) -> Result<Self, CoreError> {
        if self.matches() {
            Ok(self)
        } else {
            Err(CoreError::DriftDetected(self.drift))
        }
    }
}

impl Engine {
    /// Check the live environment against the project's lock record.
    ///
    /// The live view is hashed with the declared base-image digest (when the
    /// record has one); a checksum match passes without running the diff
    /// engine. Otherwise, or when the record predates checksums or its stored
    /// checksum no longer matches its own contents, the full drift report is
    /// returned.
    pub fn verify(&self, project: &str, token: &CancelToken) -> Result<VerifyOutcome, CoreError> {
        let entry = self.project(project)?;
        let record = self.load_record(&entry)?;
        token.check()?;

        let declared = &record.snapshot;
        let live = self.capture_live(
            &entry.environment_id,
            &declared.base_image.name,
            &declared.setup_commands,
            token,
        )?;

        let mut hashed = live.clone();
        if !declared.base_image.digest.is_empty() {
            hashed.base_image.digest.clone_from(&declared.base_image.digest);
        }
        let live_checksum = compute_checksum(&hashed);
        let stored_checksum = if record.has_checksum() {
            declared.checksum().cloned()
        } else {
            None
        };
        // A record edited after locking no longer vouches for its contents.
        let sealed = stored_checksum.is_some() && declared.verify_checksum();
        if stored_checksum.is_some() && !sealed {
            warn!("{project}: stored checksum no longer matches the record, running full diff");
        }

        if sealed && stored_checksum.as_ref() == Some(&live_checksum) {
            info!("{project}: checksum {live_checksum} matches");
            return Ok(VerifyOutcome {
                project: entry.name,
                fast_path: true,
                stored_checksum,
                live_checksum,
                drift: DriftReport::new(),
            });
        }

        match &stored_checksum {
            Some(stored) => debug!("{project}: checksum mismatch ({stored} != {live_checksum})"),
            None => debug!("{project}: record has no checksum, running full diff"),
        }
        token.check()?;
        let drift = self.detector.detect(declared, &live);
        info!("{project}: {} drift item(s)", drift.len());
        Ok(VerifyOutcome {
            project: entry.name,
            fast_path: false,
            stored_checksum,
            live_checksum,
            drift,
        })
    }

    /// `verify` on a worker thread, bounded by `timeout`.
    pub fn verify_with_timeout(
        &self,
        project: &str,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<VerifyOutcome, CoreError> {
        let engine = self.clone();
        let project = project.to_owned();
        run_with_timeout("verify", timeout, token, move |token| {
            engine.verify(&project, &token)
        })
    }
}
