use crate::config::ServiceConfig;
use crate::services::operations::{Artifact, Operation, OperationError};
use crate::services::registry::{NotFound, OperationRegistry};
use crate::services::staging::{UploadError, UploadHandle, UploadStager};
use axum::extract::Multipart;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Lifecycle of one request, logged as it advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Received,
    Staging,
    Processing,
    CleaningUp,
    Completed,
    Failed,
}

/// Routes a request to its operation and owns the staged upload until the
/// operation is done with it.
pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    stager: UploadStager,
    timeout: Duration,
    permits: Semaphore,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<OperationRegistry>,
        stager: UploadStager,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            registry,
            stager,
            timeout: config.operation_timeout,
            permits: Semaphore::new(config.max_concurrent_operations.max(1)),
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn stager(&self) -> &UploadStager {
        &self.stager
    }

    /// Fails fast for unknown operations, before any byte of the body is read.
    pub fn resolve(&self, operation: &str) -> Result<Arc<dyn Operation>, DispatchError> {
        trace_phase(operation, DispatchPhase::Received);
        self.registry.lookup(operation).map_err(|e| {
            trace_phase(operation, DispatchPhase::Failed);
            DispatchError::from(e)
        })
    }

    /// Full pipeline for one multipart request.
    pub async fn handle(
        &self,
        operation: &str,
        multipart: &mut Multipart,
    ) -> Result<Artifact, DispatchError> {
        let op = self.resolve(operation)?;

        trace_phase(operation, DispatchPhase::Staging);
        let handle = match self.stager.stage(multipart).await {
            Ok(handle) => handle,
            Err(e) => {
                trace_phase(operation, DispatchPhase::Failed);
                return Err(e.into());
            }
        };

        self.process(op, handle).await
    }

    /// Runs `op` on an already staged upload, then releases it. The handle is
    /// consumed here: cleanup happens exactly once whatever the outcome.
    pub async fn process(
        &self,
        op: Arc<dyn Operation>,
        handle: UploadHandle,
    ) -> Result<Artifact, DispatchError> {
        let name = op.name().to_string();
        tracing::debug!(
            upload_id = %handle.id(),
            operation = %name,
            declared = ?handle.declared_content_type(),
            detected = ?handle.detected_content_type(),
            phase = ?DispatchPhase::Processing
        );

        let outcome = self.run_bounded(op.as_ref(), &handle).await;

        tracing::debug!(upload_id = %handle.id(), operation = %name, phase = ?DispatchPhase::CleaningUp);
        let upload_id = handle.id();
        if let Err(e) = handle.cleanup() {
            // TempPath::close only fails when the file is already gone or unremovable
            tracing::error!(upload_id = %upload_id, "Failed to remove staged upload: {}", e);
        }

        match &outcome {
            Ok(artifact) => tracing::info!(
                upload_id = %upload_id,
                operation = %name,
                phase = ?DispatchPhase::Completed,
                artifact = %artifact.filename,
                size = artifact.size(),
                "Operation completed"
            ),
            Err(e) => tracing::warn!(
                upload_id = %upload_id,
                operation = %name,
                phase = ?DispatchPhase::Failed,
                "Operation failed: {}",
                e
            ),
        }

        outcome
    }

    async fn run_bounded(
        &self,
        op: &dyn Operation,
        handle: &UploadHandle,
    ) -> Result<Artifact, DispatchError> {
        let guarded = async {
            let _permit = match self.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(OperationError::Internal(
                        "operation permits closed".to_string(),
                    ));
                }
            };

            AssertUnwindSafe(op.run(handle))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(OperationError::Internal(format!(
                        "operation '{}' panicked: {}",
                        op.name(),
                        panic_message(panic.as_ref())
                    )))
                })
        };

        match tokio::time::timeout(self.timeout, guarded).await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::Timeout(self.timeout)),
        }
    }
}

fn trace_phase(operation: &str, phase: DispatchPhase) {
    tracing::debug!(operation = %operation, phase = ?phase);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
