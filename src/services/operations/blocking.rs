use super::{OperationError, OperationResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Raised when the request awaiting a blocking job goes away (timeout,
/// client gone). The job polls it between units of work and stops early.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), OperationError> {
        if self.is_cancelled() {
            Err(OperationError::Internal("operation cancelled".to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct CancelOnDrop(Cancellation);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Runs CPU-bound work on the blocking pool.
///
/// A detached `spawn_blocking` task cannot be aborted, so dropping the
/// returned future raises the job's [`Cancellation`] instead. Work that
/// checks it between steps stops within one step of the dispatcher
/// giving up, and never outlives its concurrency permit by more.
pub async fn run_blocking<F>(work: F) -> OperationResult
where
    F: FnOnce(&Cancellation) -> OperationResult + Send + 'static,
{
    let cancellation = Cancellation::default();
    let _guard = CancelOnDrop(cancellation.clone());

    tokio::task::spawn_blocking(move || work(&cancellation))
        .await
        .map_err(|e| OperationError::Internal(format!("blocking task failed: {}", e)))?
}
