use super::{
    Artifact, CommandExecutor, Operation, OperationError, OperationResult, require_pdf, scratch_dir,
};
use crate::services::staging::UploadHandle;
use async_trait::async_trait;

/// Re-renders a PDF with Ghostscript's `/ebook` preset.
pub struct PdfCompress {
    ghostscript_bin: String,
    executor: CommandExecutor,
}

impl PdfCompress {
    pub fn new(ghostscript_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self {
            ghostscript_bin: ghostscript_bin.into(),
            executor,
        }
    }
}

#[async_trait]
impl Operation for PdfCompress {
    fn name(&self) -> &str {
        "compress"
    }

    async fn run(&self, input: &UploadHandle) -> OperationResult {
        require_pdf(input, "compress")?;

        let workdir = scratch_dir(input, "gs-")?;
        let output = workdir.path().join("compressed.pdf");

        let args = vec![
            "-sDEVICE=pdfwrite".to_string(),
            "-dCompatibilityLevel=1.4".to_string(),
            "-dPDFSETTINGS=/ebook".to_string(),
            "-dNOPAUSE".to_string(),
            "-dQUIET".to_string(),
            "-dBATCH".to_string(),
            "-dSAFER".to_string(),
            format!("-sOutputFile={}", output.display()),
            input.path().to_string_lossy().into_owned(),
        ];

        self.executor
            .execute(&self.ghostscript_bin, args.as_slice(), Some(workdir.path()))
            .await
            .map_err(|e| match e {
                OperationError::Failed(_) => {
                    OperationError::Failed("Compression failed".to_string())
                }
                other => other,
            })?;

        let bytes = tokio::fs::read(&output).await?;

        tracing::info!(
            upload_id = %input.id(),
            input_size = input.size(),
            output_size = bytes.len(),
            "PDF compressed"
        );

        Ok(Artifact::new(
            bytes,
            mime::APPLICATION_PDF.as_ref(),
            "compressed.pdf",
        ))
    }
}
