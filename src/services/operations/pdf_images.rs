use super::{
    CommandExecutor, Operation, OperationError, OperationResult, require_pdf, scratch_dir,
    single_or_zip,
};
use crate::services::staging::UploadHandle;
use async_trait::async_trait;
use std::path::Path;

const RESOLUTION_DPI: u32 = 150;

/// Renders every page of a PDF to JPEG with Ghostscript.
///
/// A single page comes back as `page_1.jpg`, several as `pages_images.zip`.
pub struct PdfToJpg {
    ghostscript_bin: String,
    executor: CommandExecutor,
}

impl PdfToJpg {
    pub fn new(ghostscript_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self {
            ghostscript_bin: ghostscript_bin.into(),
            executor,
        }
    }
}

#[async_trait]
impl Operation for PdfToJpg {
    fn name(&self) -> &str {
        "pdf2jpg"
    }

    async fn run(&self, input: &UploadHandle) -> OperationResult {
        require_pdf(input, "pdf2jpg")?;

        let workdir = scratch_dir(input, "gs-")?;
        let pattern = workdir.path().join("page_%d.jpg");

        let args = vec![
            "-sDEVICE=jpeg".to_string(),
            format!("-r{}", RESOLUTION_DPI),
            "-dJPEGQ=85".to_string(),
            "-dNOPAUSE".to_string(),
            "-dQUIET".to_string(),
            "-dBATCH".to_string(),
            "-dSAFER".to_string(),
            format!("-sOutputFile={}", pattern.display()),
            input.path().to_string_lossy().into_owned(),
        ];

        self.executor
            .execute(&self.ghostscript_bin, args.as_slice(), Some(workdir.path()))
            .await
            .map_err(|e| match e {
                OperationError::Failed(_) => {
                    OperationError::Failed("Image conversion failed".to_string())
                }
                other => other,
            })?;

        let pages = rendered_pages(workdir.path()).await?;
        if pages.is_empty() {
            tracing::error!(upload_id = %input.id(), "Ghostscript rendered no pages");
            return Err(OperationError::Failed(
                "Conversion failed: output not found".to_string(),
            ));
        }

        tracing::info!(
            upload_id = %input.id(),
            pages = pages.len(),
            "PDF rendered to images"
        );

        single_or_zip(pages, mime::IMAGE_JPEG.as_ref(), "pages_images.zip")
    }
}

/// `page_N.jpg` files in page order
async fn rendered_pages(dir: &Path) -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut numbered = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let page = name
            .strip_prefix("page_")
            .and_then(|rest| rest.strip_suffix(".jpg"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(page) = page {
            numbered.push((page, name, entry.path()));
        }
    }
    numbered.sort_by_key(|(page, _, _)| *page);

    let mut pages = Vec::with_capacity(numbered.len());
    for (_, name, path) in numbered {
        pages.push((name, tokio::fs::read(path).await?));
    }
    Ok(pages)
}
