use crate::CoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Cooperative cancellation flag shared between a caller and its worker.
///
/// Workers check it between phases and before each mutating runtime call; a
/// call already in flight is allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }
}

/// Cancel `token` on Ctrl-C; a second Ctrl-C exits immediately.
pub fn install_signal_handler(token: CancelToken) {
    let _ = ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        token.cancel();
        eprintln!("\ninterrupt received, stopping after the current step...");
    });
}

/// Run `job` on a worker thread and wait at most `timeout` for its result.
///
/// On expiry the token is cancelled and `CoreError::Timeout` is returned
/// without joining the worker, which stops at its next cancellation check.
pub fn run_with_timeout<T, F>(
    label: &str,
    timeout: Duration,
    token: &CancelToken,
    job: F,
) -> Result<T, CoreError>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> Result<T, CoreError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let worker_token = token.clone();
    thread::Builder::new()
        .name(format!("envlock-{label}"))
        .spawn(move || {
            let _ = tx.send(job(worker_token));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            token.cancel();
            warn!("{label} exceeded {}s; worker cancelled", timeout.as_secs());
            Err(CoreError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            debug!("{label} worker exited without a result");
            Err(CoreError::Runtime(envlock_runtime::RuntimeError::ExecFailed(
                format!("{label} worker terminated unexpectedly"),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn token_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn fast_job_returns_its_result() {
        let token = CancelToken::new();
        let value = run_with_timeout("test", Duration::from_secs(5), &token, |_| Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn job_errors_propagate() {
        let token = CancelToken::new();
        let result: Result<(), _> = run_with_timeout("test", Duration::from_secs(5), &token, |_| {
            Err(CoreError::Validation("bad".to_owned()))
        });
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[test]
    fn slow_job_times_out_and_is_cancelled() {
        let token = CancelToken::new();
        let (seen_tx, seen_rx) = mpsc::channel();
        let start = Instant::now();
        let result: Result<(), _> =
            run_with_timeout("slow", Duration::from_millis(50), &token, move |t| {
                while !t.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                let _ = seen_tx.send(());
                t.check()
            });
        assert!(matches!(result, Err(CoreError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(token.is_cancelled());
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn panicking_job_reports_error() {
        let token = CancelToken::new();
        let result: Result<(), _> =
            run_with_timeout("panic", Duration::from_secs(5), &token, |_| panic!("boom"));
        assert!(result.is_err());
    }
}
