//! Sequential step runner.

use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Action, Step, Workflow};
use crate::error::{ExecError, WorkflowError};
use crate::remote::{LogSink, RemoteExecutor};

pub struct Engine {
    scratch_dir: PathBuf,
}

impl Engine {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }

    /// Run every step in order. Cancellation is observed between steps.
    pub async fn run(
        &self,
        workflow: &Workflow,
        executor: &dyn RemoteExecutor,
        sink: &dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        let total = workflow.steps().len();
        sink.line(&format!("==> workflow '{}' ({total} steps)", workflow.name()));
        info!(workflow = %workflow.name(), steps = total, "workflow started");

        for (i, step) in workflow.steps().iter().enumerate() {
            if cancel.is_cancelled() {
                sink.line(&format!("!! workflow '{}' cancelled", workflow.name()));
                return Err(WorkflowError::Cancelled(workflow.name().to_string()));
            }

            if let Some(ref condition) = step.condition {
                match executor.run(condition).await {
                    Ok(output) if output.success() => {}
                    Ok(_) => {
                        sink.line(&format!("-- [{}/{total}] {}: skipped", i + 1, step.name));
                        debug!(step = %step.name, "condition not met, skipping");
                        continue;
                    }
                    Err(e) => {
                        sink.line(&format!(
                            "-- [{}/{total}] {}: skipped (condition check failed: {e})",
                            i + 1,
                            step.name
                        ));
                        debug!(step = %step.name, error = %e, "condition check failed, skipping");
                        continue;
                    }
                }
            }

            sink.line(&format!(">> [{}/{total}] {}", i + 1, step.name));
            match self.execute(step, executor, sink).await {
                Ok(()) => sink.line(&format!("ok [{}/{total}] {}", i + 1, step.name)),
                Err(e) if step.ignore_failure => {
                    sink.line(&format!("!! {e} (ignored)"));
                    warn!(step = %step.name, error = %e, "step failed, continuing");
                }
                Err(e) => {
                    sink.line(&format!("!! {e}"));
                    warn!(workflow = %workflow.name(), step = %step.name, error = %e, "workflow halted");
                    return Err(e);
                }
            }
        }

        sink.line(&format!("ok workflow '{}' completed", workflow.name()));
        info!(workflow = %workflow.name(), "workflow completed");
        Ok(())
    }

    async fn execute(
        &self,
        step: &Step,
        executor: &dyn RemoteExecutor,
        sink: &dyn LogSink,
    ) -> Result<(), WorkflowError> {
        let failed = |source: ExecError| WorkflowError::StepFailed {
            step: step.name.clone(),
            source,
        };

        match step.action {
            Action::RunCommand { ref command } => {
                let output = executor
                    .run_streaming(command, sink)
                    .await
                    .map_err(failed)?;
                if !output.success() {
                    return Err(failed(ExecError::Command {
                        command: command.clone(),
                        status: output.status,
                        stderr: output.stderr.trim().to_string(),
                    }));
                }
            }
            Action::WriteFile {
                ref content,
                ref dest,
                mode,
            } => {
                let scratch = |source: std::io::Error| WorkflowError::Scratch {
                    step: step.name.clone(),
                    source,
                };
                // Removed on drop, whichever way this arm exits.
                let staged = self.stage(content.as_bytes()).map_err(scratch)?;
                let bytes = tokio::fs::read(staged.path()).await.map_err(scratch)?;
                executor
                    .write_file(dest, &bytes, mode)
                    .await
                    .map_err(failed)?;
            }
            Action::CopyFile {
                ref source,
                ref dest,
                mode,
            } => {
                let bytes = tokio::fs::read(source)
                    .await
                    .map_err(|e| failed(ExecError::Io(e)))?;
                executor
                    .write_file(dest, &bytes, mode)
                    .await
                    .map_err(failed)?;
            }
        }
        Ok(())
    }

    fn stage(&self, content: &[u8]) -> std::io::Result<NamedTempFile> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("trellis-step-")
            .tempfile_in(&self.scratch_dir)?;
        file.write_all(content)?;
        file.flush()?;
        Ok(file)
    }
}
