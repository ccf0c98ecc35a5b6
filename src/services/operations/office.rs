use super::{Artifact, CommandExecutor, Operation, OperationError, OperationResult, scratch_dir};
use crate::services::staging::UploadHandle;
use crate::utils::validation::file_stem;
use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::path::Path;

pub const WORD_EXTENSIONS: &[&str] = &["doc", "docx", "odt", "rtf", "txt"];
pub const EXCEL_EXTENSIONS: &[&str] = &["xls", "xlsx", "ods", "csv"];
pub const POWERPOINT_EXTENSIONS: &[&str] = &["ppt", "pptx", "odp"];
pub const PDF_EXTENSIONS: &[&str] = &["pdf"];

const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Characters that cannot appear raw in the path of a `file://` URL
const FILE_URL_PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Document conversion through headless LibreOffice.
pub struct OfficeConvert {
    name: String,
    extensions: &'static [&'static str],
    /// `--infilter` needed to open the input in the right component
    import_filter: Option<&'static str>,
    /// Target passed to `--convert-to`, also the artifact extension
    target: &'static str,
    content_type: &'static str,
    soffice_bin: String,
    executor: CommandExecutor,
}

impl OfficeConvert {
    pub fn new(
        name: impl Into<String>,
        extensions: &'static [&'static str],
        target: &'static str,
        content_type: &'static str,
        soffice_bin: impl Into<String>,
        executor: CommandExecutor,
    ) -> Self {
        Self {
            name: name.into(),
            extensions,
            import_filter: None,
            target,
            content_type,
            soffice_bin: soffice_bin.into(),
            executor,
        }
    }

    pub fn with_import_filter(mut self, filter: &'static str) -> Self {
        self.import_filter = Some(filter);
        self
    }

    pub fn word(soffice_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self::new("word2pdf", WORD_EXTENSIONS, "pdf", "application/pdf", soffice_bin, executor)
    }

    pub fn excel(soffice_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self::new("excel2pdf", EXCEL_EXTENSIONS, "pdf", "application/pdf", soffice_bin, executor)
    }

    pub fn powerpoint(soffice_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self::new("ppt2pdf", POWERPOINT_EXTENSIONS, "pdf", "application/pdf", soffice_bin, executor)
    }

    pub fn pdf_to_word(soffice_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self::new("pdf2word", PDF_EXTENSIONS, "docx", DOCX, soffice_bin, executor)
            .with_import_filter("writer_pdf_import")
    }

    pub fn pdf_to_excel(soffice_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self::new("pdf2excel", PDF_EXTENSIONS, "xlsx", XLSX, soffice_bin, executor)
    }

    pub fn pdf_to_powerpoint(soffice_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self::new("pdf2ppt", PDF_EXTENSIONS, "pptx", PPTX, soffice_bin, executor)
            .with_import_filter("impress_pdf_import")
    }

    fn check_extension(&self, input: &Path) -> Result<(), OperationError> {
        let ext = input
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        if self.extensions.contains(&ext) {
            Ok(())
        } else {
            Err(OperationError::UnsupportedFormat(format!(
                "{} accepts {} files",
                self.name,
                self.extensions.join(", ")
            )))
        }
    }

    fn arguments(&self, profile: &Path, outdir: &Path, input: &Path) -> Vec<String> {
        let mut args = vec![
            "--headless".to_string(),
            "--norestore".to_string(),
            format!("-env:UserInstallation={}", file_url(profile)),
        ];
        if let Some(filter) = self.import_filter {
            args.push(format!("--infilter={}", filter));
        }
        args.extend([
            "--convert-to".to_string(),
            self.target.to_string(),
            "--outdir".to_string(),
            outdir.to_string_lossy().into_owned(),
            input.to_string_lossy().into_owned(),
        ]);
        args
    }
}

/// `file://` URL for an absolute path
fn file_url(path: &Path) -> String {
    format!(
        "file://{}",
        utf8_percent_encode(&path.to_string_lossy(), FILE_URL_PATH)
    )
}

#[async_trait]
impl Operation for OfficeConvert {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &UploadHandle) -> OperationResult {
        self.check_extension(input.path())?;

        let workdir = scratch_dir(input, "soffice-")?;
        let outdir = workdir.path().join("out");
        tokio::fs::create_dir_all(&outdir).await?;

        // A private profile per run; LibreOffice refuses to share one
        let profile = std::path::absolute(workdir.path().join("profile"))?;
        let args = self.arguments(&profile, &outdir, input.path());

        self.executor
            .execute(&self.soffice_bin, args.as_slice(), Some(workdir.path()))
            .await?;

        let staged_stem = input
            .path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let converted = outdir.join(format!("{}.{}", staged_stem, self.target));

        let bytes = match tokio::fs::read(&converted).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(upload_id = %input.id(), "LibreOffice produced no output");
                return Err(OperationError::Failed(
                    "Conversion failed: output not found".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            upload_id = %input.id(),
            operation = %self.name,
            output_size = bytes.len(),
            "Document converted"
        );

        Ok(Artifact::new(
            bytes,
            self.content_type,
            format!("{}.{}", file_stem(input.original_filename()), self.target),
        ))
    }
}
