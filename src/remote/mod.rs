//! Remote execution: the executor contract used by workflows, provisioning,
//! mesh sync and probes.

pub mod ssh;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;

use crate::domain::node::Node;
use crate::error::ExecError;

pub use ssh::SshConnector;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Receives progress lines of a long-running operation.
pub trait LogSink: Send + Sync {
    fn line(&self, line: &str);
}

/// Discards everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn line(&self, _line: &str) {}
}

/// An open session to one node.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command and capture its output. A non-zero exit is not an error.
    async fn run(&self, command: &str) -> Result<CommandOutput, ExecError>;

    /// Run a command, forwarding stdout and stderr lines to `sink` as they
    /// arrive. Only stderr is captured in the returned output.
    async fn run_streaming(
        &self,
        command: &str,
        sink: &dyn LogSink,
    ) -> Result<CommandOutput, ExecError>;

    /// Write `content` to `dest` on the node with the given permission bits.
    async fn write_file(&self, dest: &str, content: &[u8], mode: u32) -> Result<(), ExecError>;

    /// Release the session. Further calls may fail.
    async fn close(&self);

    /// Run a command and fail on non-zero exit, returning trimmed stdout.
    async fn run_checked(&self, command: &str) -> Result<String, ExecError> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(ExecError::Command {
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }
}

/// Opens executors for nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session and verify that the node accepts commands.
    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteExecutor>, ExecError>;
}

/// Quote a value for a POSIX shell.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
