use crate::config::ServiceConfig;
use crate::services::operations::{
    CommandExecutor, OfficeConvert, Operation, PdfCompress, PdfPassword, PdfSplit, PdfToJpg,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Operation '{0}' not found")]
pub struct NotFound(pub String);

/// Immutable name -> operation table, built once at startup.
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn builder() -> OperationRegistryBuilder {
        OperationRegistryBuilder::default()
    }

    /// Registry holding every built-in operation, wired to the configured engines
    pub fn with_builtin(config: &ServiceConfig) -> Self {
        let executor = CommandExecutor::new(config.operation_timeout);

        Self::builder()
            .register(OfficeConvert::word(&config.soffice_bin, executor.clone()))
            .register(OfficeConvert::excel(&config.soffice_bin, executor.clone()))
            .register(OfficeConvert::powerpoint(&config.soffice_bin, executor.clone()))
            .register(OfficeConvert::pdf_to_word(&config.soffice_bin, executor.clone()))
            .register(OfficeConvert::pdf_to_excel(&config.soffice_bin, executor.clone()))
            .register(OfficeConvert::pdf_to_powerpoint(&config.soffice_bin, executor.clone()))
            .register(PdfSplit::new())
            .register(PdfSplit::extract())
            .register(PdfCompress::new(&config.ghostscript_bin, executor.clone()))
            .register(PdfToJpg::new(&config.ghostscript_bin, executor.clone()))
            .register(PdfPassword::protect(&config.qpdf_bin, executor.clone()))
            .register(PdfPassword::unlock(&config.qpdf_bin, executor))
            .build()
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Operation>, NotFound> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| NotFound(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Default)]
pub struct OperationRegistryBuilder {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistryBuilder {
    /// Adds an operation under its own name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register<O: Operation + 'static>(self, operation: O) -> Self {
        self.register_arc(Arc::new(operation))
    }

    pub fn register_arc(mut self, operation: Arc<dyn Operation>) -> Self {
        let name = operation.name().to_string();
        if self.operations.insert(name.clone(), operation).is_some() {
            tracing::warn!("Operation '{}' registered twice, keeping the last one", name);
        }
        self
    }

    pub fn build(self) -> OperationRegistry {
        OperationRegistry {
            operations: self.operations,
        }
    }
}
