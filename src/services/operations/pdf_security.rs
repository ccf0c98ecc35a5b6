use super::{
    Artifact, CommandExecutor, Operation, OperationError, OperationResult, require_pdf,
    scratch_dir,
};
use crate::services::staging::UploadHandle;
use async_trait::async_trait;
use std::path::Path;

/// Form field carrying the password
pub const PASSWORD_FIELD: &str = "password";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Protect,
    Unlock,
}

/// Adds or removes PDF password protection with qpdf.
///
/// qpdf reads its arguments from an `@file` inside the private scratch
/// directory, so the password never appears on a process command line.
pub struct PdfPassword {
    mode: Mode,
    qpdf_bin: String,
    executor: CommandExecutor,
}

impl PdfPassword {
    /// `protect`: AES-256 encryption, same user and owner password.
    pub fn protect(qpdf_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self {
            mode: Mode::Protect,
            qpdf_bin: qpdf_bin.into(),
            executor,
        }
    }

    /// `unlock`: decrypts with the supplied password.
    pub fn unlock(qpdf_bin: impl Into<String>, executor: CommandExecutor) -> Self {
        Self {
            mode: Mode::Unlock,
            qpdf_bin: qpdf_bin.into(),
            executor,
        }
    }

    fn output_name(&self) -> &'static str {
        match self.mode {
            Mode::Protect => "protected.pdf",
            Mode::Unlock => "unlocked.pdf",
        }
    }

    fn failure_message(&self) -> &'static str {
        match self.mode {
            Mode::Protect => "Could not protect PDF",
            Mode::Unlock => "Could not unlock PDF: wrong password or damaged file",
        }
    }

    /// One argument per line, as qpdf expects in an `@file`.
    fn argfile(&self, password: &str, input: &Path, output: &Path) -> String {
        let mut args = vec!["--warning-exit-0".to_string()];
        match self.mode {
            Mode::Protect => {
                args.extend([
                    "--encrypt".to_string(),
                    password.to_string(),
                    password.to_string(),
                    "256".to_string(),
                    "--".to_string(),
                ]);
            }
            Mode::Unlock => {
                args.push(format!("--password={}", password));
                args.push("--decrypt".to_string());
            }
        }
        args.push(input.to_string_lossy().into_owned());
        args.push(output.to_string_lossy().into_owned());

        let mut contents = args.join("\n");
        contents.push('\n');
        contents
    }
}

fn password(input: &UploadHandle, operation: &str) -> Result<String, OperationError> {
    let password = input.field(PASSWORD_FIELD).unwrap_or_default();
    if password.is_empty() {
        return Err(OperationError::InvalidInput(format!(
            "{} requires a '{}' field",
            operation, PASSWORD_FIELD
        )));
    }
    if password.contains(['\n', '\r', '\0']) {
        return Err(OperationError::InvalidInput(
            "Password contains unsupported characters".to_string(),
        ));
    }
    Ok(password.to_string())
}

#[async_trait]
impl Operation for PdfPassword {
    fn name(&self) -> &str {
        match self.mode {
            Mode::Protect => "protect",
            Mode::Unlock => "unlock",
        }
    }

    async fn run(&self, input: &UploadHandle) -> OperationResult {
        require_pdf(input, self.name())?;
        let password = password(input, self.name())?;

        let workdir = scratch_dir(input, "qpdf-")?;
        let output = workdir.path().join("out.pdf");
        let argfile = workdir.path().join("args");
        tokio::fs::write(&argfile, self.argfile(&password, input.path(), &output)).await?;

        let arg = format!("@{}", argfile.display());
        self.executor
            .execute(&self.qpdf_bin, &[arg], Some(workdir.path()))
            .await
            .map_err(|e| match e {
                OperationError::Failed(_) => OperationError::Failed(self.failure_message().to_string()),
                other => other,
            })?;

        let bytes = tokio::fs::read(&output).await.map_err(|_| {
            tracing::error!(upload_id = %input.id(), "qpdf produced no output");
            OperationError::Failed(self.failure_message().to_string())
        })?;

        tracing::info!(
            upload_id = %input.id(),
            operation = self.name(),
            output_size = bytes.len(),
            "PDF password operation complete"
        );

        Ok(Artifact::new(bytes, mime::APPLICATION_PDF.as_ref(), self.output_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::operations::test_support::stage;
    use crate::services::staging::UploadStager;
    use crate::config::ServiceConfig;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    async fn stage_with_password(dir: &Path, password: Option<&str>) -> UploadHandle {
        let mut handle = stage(dir, "doc.pdf", b"%PDF-1.4 secret").await;
        if let Some(password) = password {
            handle.set_field(PASSWORD_FIELD, password);
        }
        handle
    }

    #[test]
    fn test_argfile_layout() {
        let op = PdfPassword::protect("qpdf", CommandExecutor::new(Duration::from_secs(1)));
        let args = op.argfile("s3cret", Path::new("/s/in.pdf"), Path::new("/s/out.pdf"));
        assert_eq!(
            args,
            "--warning-exit-0\n--encrypt\ns3cret\ns3cret\n256\n--\n/s/in.pdf\n/s/out.pdf\n"
        );

        let op = PdfPassword::unlock("qpdf", CommandExecutor::new(Duration::from_secs(1)));
        let args = op.argfile("s3cret", Path::new("/s/in.pdf"), Path::new("/s/out.pdf"));
        assert_eq!(
            args,
            "--warning-exit-0\n--password=s3cret\n--decrypt\n/s/in.pdf\n/s/out.pdf\n"
        );
    }

    #[tokio::test]
    async fn test_password_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let op = PdfPassword::protect("qpdf", CommandExecutor::new(Duration::from_secs(1)));

        let handle = stage_with_password(dir.path(), None).await;
        let err = op.run(&handle).await.unwrap_err();
        assert!(matches!(err, OperationError::InvalidInput(ref m) if m.contains("password")));

        let handle = stage_with_password(dir.path(), Some("")).await;
        assert!(matches!(
            op.run(&handle).await.unwrap_err(),
            OperationError::InvalidInput(_)
        ));

        let handle = stage_with_password(dir.path(), Some("a\nb")).await;
        assert!(matches!(
            op.run(&handle).await.unwrap_err(),
            OperationError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let stager = UploadStager::new(&ServiceConfig {
            temp_dir: dir.path().to_path_buf(),
            ..ServiceConfig::default()
        })
        .unwrap();
        let items: Vec<Result<Bytes, _>> = vec![Ok(Bytes::from_static(b"PK\x03\x04 zip"))];
        let mut handle = stager
            .stage_stream("doc.pdf", None, stream::iter(items))
            .await
            .unwrap();
        handle.set_field(PASSWORD_FIELD, "pw");

        let op = PdfPassword::unlock("qpdf", CommandExecutor::new(Duration::from_secs(1)));
        let err = op.run(&handle).await.unwrap_err();
        assert!(matches!(err, OperationError::UnsupportedFormat(_)));
    }

    /// Writes its argv and the argfile contents into the output path.
    #[cfg(unix)]
    fn fake_qpdf(bin_dir: &Path) -> std::path::PathBuf {
        crate::services::operations::test_support::fake_engine(
            bin_dir,
            "fake-qpdf",
            "argfile=\"${1#@}\"\n\
             out=$(tail -n 1 \"$argfile\")\n\
             printf 'argv: %s\\n' \"$*\" > \"$out\"\n\
             cat \"$argfile\" >> \"$out\"\n",
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_protect_keeps_password_off_the_command_line() {
        let bin_dir = tempfile::tempdir().unwrap();
        let qpdf = fake_qpdf(bin_dir.path());

        let dir = tempfile::tempdir().unwrap();
        let handle = stage_with_password(dir.path(), Some("hunter2")).await;

        let op = PdfPassword::protect(qpdf.to_string_lossy(), CommandExecutor::new(Duration::from_secs(10)));
        let artifact = op.run(&handle).await.unwrap();

        assert_eq!(artifact.filename, "protected.pdf");
        assert_eq!(artifact.content_type, "application/pdf");

        let text = String::from_utf8(artifact.bytes.to_vec()).unwrap();
        let mut lines = text.lines();
        let argv = lines.next().unwrap();
        assert!(argv.starts_with("argv: @"));
        assert!(!argv.contains("hunter2"));

        let args: Vec<&str> = lines.collect();
        assert_eq!(&args[..5], &["--warning-exit-0", "--encrypt", "hunter2", "hunter2", "256"]);
        assert_eq!(args[6], handle.path().to_str().unwrap());

        // scratch directory and argfile are gone, only the upload remains
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unlock_failure_is_reported_generically() {
        let bin_dir = tempfile::tempdir().unwrap();
        let qpdf = crate::services::operations::test_support::fake_engine(
            bin_dir.path(),
            "fake-qpdf",
            "echo 'invalid password for /srv/staging/upload-x.pdf' >&2\nexit 2\n",
        );

        let dir = tempfile::tempdir().unwrap();
        let handle = stage_with_password(dir.path(), Some("wrong")).await;

        let op = PdfPassword::unlock(qpdf.to_string_lossy(), CommandExecutor::new(Duration::from_secs(10)));
        let err = op.run(&handle).await.unwrap_err();
        match err {
            OperationError::Failed(msg) => {
                assert_eq!(msg, "Could not unlock PDF: wrong password or damaged file");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
