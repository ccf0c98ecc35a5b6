use crate::services::staging::UploadHandle;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Cursor, Write};
use std::path::Path;
use thiserror::Error;

pub mod blocking;
pub mod executor;
pub mod office;
pub mod pdf_compress;
pub mod pdf_images;
pub mod pdf_security;
pub mod pdf_split;

pub use blocking::{Cancellation, run_blocking};
pub use executor::CommandExecutor;
pub use office::OfficeConvert;
pub use pdf_compress::PdfCompress;
pub use pdf_images::PdfToJpg;
pub use pdf_security::PdfPassword;
pub use pdf_split::PdfSplit;

/// Output of a successful operation
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Bytes,
    pub content_type: String,
    pub filename: String,
}

impl Artifact {
    pub fn new(
        bytes: impl Into<Bytes>,
        content_type: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            filename: filename.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    /// The input is not something this operation can process
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The accompanying form fields are invalid
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The engine ran and failed. The message is shown to the client and
    /// must not contain paths or engine output.
    #[error("{0}")]
    Failed(String),

    /// Unexpected failure. Logged, never shown to the client.
    #[error("Internal operation error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        OperationError::Internal(err.to_string())
    }
}

pub type OperationResult = Result<Artifact, OperationError>;

/// A named document transformation applied to one staged upload.
///
/// Implementations must be stateless across invocations; the dispatcher
/// shares one instance between concurrent requests.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Registry key and the `{operation}` segment of `/api/{operation}`
    fn name(&self) -> &str;

    async fn run(&self, input: &UploadHandle) -> OperationResult;
}

/// Rejects inputs whose magic bytes are not PDF.
pub(crate) fn require_pdf(input: &UploadHandle, operation: &str) -> Result<(), OperationError> {
    if input.detected_content_type() == Some("application/pdf") {
        Ok(())
    } else {
        Err(OperationError::UnsupportedFormat(format!(
            "{} accepts PDF files",
            operation
        )))
    }
}

/// Scratch directory for an engine run, next to the staged file so it
/// shares the staging area's permissions and disk. Removed on drop.
pub(crate) fn scratch_dir(input: &UploadHandle, prefix: &str) -> std::io::Result<tempfile::TempDir> {
    let staging_dir = input.path().parent().unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new().prefix(prefix).tempdir_in(staging_dir)
}

/// Deflated zip of `(entry name, bytes)` pairs, in order.
pub(crate) fn zip_entries(entries: &[(String, Vec<u8>)]) -> zip::result::ZipResult<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(bytes)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// One entry as-is, several zipped under `archive_name`.
pub(crate) fn single_or_zip(
    mut entries: Vec<(String, Vec<u8>)>,
    content_type: &str,
    archive_name: &str,
) -> OperationResult {
    if entries.len() == 1 {
        let (filename, bytes) = entries.remove(0);
        return Ok(Artifact::new(bytes, content_type, filename));
    }

    let archive = zip_entries(&entries)
        .map_err(|e| OperationError::Internal(format!("Failed to build archive: {}", e)))?;
    Ok(Artifact::new(archive, "application/zip", archive_name))
}
