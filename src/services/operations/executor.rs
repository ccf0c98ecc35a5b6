use super::OperationError;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Runs external document engines with a deadline.
///
/// Children are spawned with `kill_on_drop`, so a caller that gives up on
/// the future (dispatcher timeout, client gone) also stops the process.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn execute<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        working_dir: Option<&Path>,
    ) -> Result<Output, OperationError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            program = %program,
            timeout_secs = %self.timeout.as_secs(),
            "Executing command"
        );

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(program = %program, "Command not found on server");
                return Err(OperationError::Failed(
                    "Document engine is not available".to_string(),
                ));
            }
            Ok(Err(e)) => return Err(OperationError::Internal(e.to_string())),
            Err(_) => {
                tracing::error!(
                    program = %program,
                    "Command timed out after {} seconds",
                    self.timeout.as_secs()
                );
                return Err(OperationError::Failed(
                    "Document engine timed out".to_string(),
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                program = %program,
                status = %output.status,
                stderr = %stderr,
                "Command failed"
            );
            return Err(OperationError::Failed(format!("{} failed", program_label(program))));
        }

        tracing::debug!(
            program = %program,
            output_size = output.stdout.len(),
            "Command succeeded"
        );

        Ok(output)
    }
}

/// File name of the program, so configured absolute paths stay out of
/// client-facing messages.
fn program_label(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("command")
}
