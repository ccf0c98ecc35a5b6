use crate::config::ServiceConfig;
use crate::utils::validation::{
    normalize_content_type, sanitize_filename, sniff_mime, staged_extension,
};
use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use axum::http::StatusCode;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Leading bytes kept aside for content sniffing
const SNIFF_LEN: usize = 8 * 1024;

pub const MAX_TEXT_FIELDS: usize = 16;
pub const MAX_TEXT_FIELD_LEN: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File exceeds the maximum allowed size")]
    TooLarge,

    #[error("No file provided")]
    MissingFile,

    #[error("Only one file may be uploaded per request")]
    MultipleFiles,

    #[error("Malformed upload: {0}")]
    Malformed(String),

    #[error("Client disconnected during upload")]
    ClientDisconnected,

    #[error("Failed to stage upload: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MultipartError> for UploadError {
    fn from(err: MultipartError) -> Self {
        match err.status() {
            StatusCode::PAYLOAD_TOO_LARGE => UploadError::TooLarge,
            // axum reports transport failures of the body stream as 500
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::debug!("Upload body stream failed: {}", err.body_text());
                UploadError::ClientDisconnected
            }
            _ => UploadError::Malformed(err.body_text()),
        }
    }
}

/// One staged upload.
///
/// The backing file is removed by [`UploadHandle::cleanup`] or, failing
/// that, when the handle is dropped. `cleanup` consumes the handle, so there
/// is no way to reach the path afterwards.
#[derive(Debug)]
pub struct UploadHandle {
    id: Uuid,
    original_filename: String,
    declared_content_type: Option<String>,
    detected_content_type: Option<&'static str>,
    size: u64,
    fields: BTreeMap<String, String>,
    path: TempPath,
}

impl UploadHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Sanitized client filename. Display only.
    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    /// Content type claimed by the client, normalized but not verified.
    pub fn declared_content_type(&self) -> Option<&str> {
        self.declared_content_type.as_deref()
    }

    /// Content type detected from the file's magic bytes.
    pub fn detected_content_type(&self) -> Option<&'static str> {
        self.detected_content_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Text field sent alongside the file, e.g. `pages` for `split`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn set_field(&mut self, name: &str, value: &str) {
        self.fields.insert(name.to_string(), value.to_string());
    }

    /// Location of the staged bytes. Internal: never echo it to a client.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read_all(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.path()).await
    }

    /// Removes the staged file.
    pub fn cleanup(self) -> std::io::Result<()> {
        self.path.close()
    }
}

/// Streams uploads into an isolated staging directory.
#[derive(Debug, Clone)]
pub struct UploadStager {
    temp_dir: PathBuf,
    max_file_size: usize,
}

impl UploadStager {
    pub fn new(config: &ServiceConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.temp_dir)?;
        Ok(Self {
            temp_dir: config.temp_dir.clone(),
            max_file_size: config.max_file_size,
        })
    }

    /// Stages the single file part of a multipart request.
    ///
    /// Text parts are collected into the handle's fields. A second file part
    /// fails the request and the first staged file is dropped with it.
    /// A file part with an empty filename is what browsers send for an
    /// unselected file input; it is discarded and does not count as a file.
    pub async fn stage(&self, multipart: &mut Multipart) -> Result<UploadHandle, UploadError> {
        let mut staged: Option<UploadHandle> = None;
        let mut fields = BTreeMap::new();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();

            if let Some(filename) = field.file_name().map(str::to_string) {
                if filename.is_empty() {
                    discard_field(field).await?;
                    continue;
                }
                if staged.is_some() {
                    tracing::warn!("Rejecting request with more than one file part");
                    return Err(UploadError::MultipleFiles);
                }

                let content_type = field.content_type().map(str::to_string);
                let chunks = field.map(|chunk| chunk.map_err(UploadError::from));
                staged = Some(
                    self.stage_stream(&filename, content_type.as_deref(), chunks)
                        .await?,
                );
            } else {
                if fields.len() >= MAX_TEXT_FIELDS {
                    return Err(UploadError::Malformed("Too many form fields".to_string()));
                }
                let value = read_text_field(&name, field).await?;
                fields.insert(name, value);
            }
        }

        let mut handle = staged.ok_or(UploadError::MissingFile)?;
        handle.fields = fields;
        Ok(handle)
    }

    /// Writes a byte stream to a fresh staging file, enforcing the size
    /// ceiling chunk by chunk.
    pub async fn stage_stream<S>(
        &self,
        filename: &str,
        content_type: Option<&str>,
        stream: S,
    ) -> Result<UploadHandle, UploadError>
    where
        S: Stream<Item = Result<Bytes, UploadError>>,
    {
        let original_filename = sanitize_filename(filename);
        let suffix = staged_extension(&original_filename)
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();

        // The staged name never depends on the client beyond the extension
        let (file, path) = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&suffix)
            .tempfile_in(&self.temp_dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        futures::pin_mut!(stream);
        let mut size: u64 = 0;
        let mut header = Vec::with_capacity(SNIFF_LEN);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            if size > self.max_file_size as u64 {
                tracing::warn!(
                    "Upload '{}' exceeded the {} byte limit",
                    original_filename,
                    self.max_file_size
                );
                return Err(UploadError::TooLarge);
            }

            if header.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - header.len()).min(chunk.len());
                header.extend_from_slice(&chunk[..take]);
            }

            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        drop(file);

        let handle = UploadHandle {
            id: Uuid::new_v4(),
            declared_content_type: content_type
                .map(normalize_content_type)
                .filter(|ct| !ct.is_empty()),
            detected_content_type: sniff_mime(&header),
            original_filename,
            size,
            fields: BTreeMap::new(),
            path,
        };

        tracing::debug!(
            upload_id = %handle.id,
            size = handle.size,
            detected = ?handle.detected_content_type,
            "Upload staged"
        );

        Ok(handle)
    }
}

async fn discard_field(mut field: Field<'_>) -> Result<(), UploadError> {
    while field.chunk().await?.is_some() {}
    Ok(())
}

async fn read_text_field(name: &str, mut field: Field<'_>) -> Result<String, UploadError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if buf.len() + chunk.len() > MAX_TEXT_FIELD_LEN {
            return Err(UploadError::Malformed(format!(
                "Form field '{}' is too long",
                name
            )));
        }
        buf.extend_from_slice(&chunk);
    }

    String::from_utf8(buf)
        .map_err(|_| UploadError::Malformed(format!("Form field '{}' is not UTF-8", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn stager(dir: &Path, max_file_size: usize) -> UploadStager {
        UploadStager::new(&ServiceConfig {
            temp_dir: dir.to_path_buf(),
            max_file_size,
            ..ServiceConfig::default()
        })
        .unwrap()
    }

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, UploadError>> {
        let items: Vec<Result<Bytes, UploadError>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items)
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_stage_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(dir.path(), 1024);

        let handle = stager
            .stage_stream(
                "a.pdf",
                Some("Application/PDF"),
                chunks(&[b"%PDF-1.4\n", b"rest"]),
            )
            .await
            .unwrap();

        assert_eq!(handle.size(), 13);
        assert_eq!(handle.original_filename(), "a.pdf");
        assert_eq!(handle.declared_content_type(), Some("application/pdf"));
        assert_eq!(handle.detected_content_type(), Some("application/pdf"));
        assert_eq!(handle.read_all().await.unwrap(), b"%PDF-1.4\nrest");

        let path = handle.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("pdf"));

        handle.cleanup().unwrap();
        assert!(!path.exists());
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_staged_name_ignores_client_path() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(dir.path(), 1024);

        let handle = stager
            .stage_stream("../../etc/evil.sh", None, chunks(&[b"echo"]))
            .await
            .unwrap();

        assert_eq!(handle.path().parent(), Some(dir.path()));
        let name = handle.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("upload-"));
        assert!(!name.contains("evil"));
        assert_eq!(handle.original_filename(), "evil.sh");
        assert_eq!(handle.declared_content_type(), None);
    }

    #[tokio::test]
    async fn test_too_large_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(dir.path(), 8);

        let err = stager
            .stage_stream("big.pdf", None, chunks(&[b"12345", b"67890"]))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::TooLarge));
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_exact_limit_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(dir.path(), 10);

        let handle = stager
            .stage_stream("ok.txt", None, chunks(&[b"12345", b"67890"]))
            .await
            .unwrap();
        assert_eq!(handle.size(), 10);
    }

    #[tokio::test]
    async fn test_stream_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(dir.path(), 1024);

        let items: Vec<Result<Bytes, UploadError>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(UploadError::ClientDisconnected),
        ];
        let err = stager
            .stage_stream("a.docx", None, stream::iter(items))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::ClientDisconnected));
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_drop_removes_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(dir.path(), 1024);

        let handle = stager
            .stage_stream("a.txt", None, chunks(&[b"hello"]))
            .await
            .unwrap();
        assert_eq!(entries(dir.path()), 1);

        drop(handle);
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_empty_file_is_staged() {
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(dir.path(), 1024);

        let handle = stager.stage_stream("empty", None, chunks(&[])).await.unwrap();
        assert_eq!(handle.size(), 0);
        assert_eq!(handle.detected_content_type(), None);
        assert_eq!(handle.path().extension(), None);
    }
}
