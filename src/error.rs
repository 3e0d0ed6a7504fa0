//! Error types for remote execution, workflows, storage and provisioning.
//!
//! Subsystems return these typed errors; the CLI and daemon wiring wrap them
//! in `anyhow` with context.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a remote executor.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Connection establishment or authentication failed
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    /// The remote command exited non-zero
    #[error("command `{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    /// Writing bytes to a remote path failed
    #[error("failed to transfer to {dest}: {reason}")]
    Transfer { dest: String, reason: String },

    /// The operation did not finish in time
    #[error("remote operation timed out after {0:?}")]
    Timeout(Duration),

    /// Local I/O while driving the connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Whether this is a connection-level failure (dial or auth).
    pub fn is_connect(&self) -> bool {
        matches!(self, ExecError::Connect { .. })
    }
}

/// Errors surfaced by the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Cancellation was requested before a step started
    #[error("workflow '{0}' cancelled")]
    Cancelled(String),

    /// A step without `ignore_failure` failed
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: ExecError,
    },

    /// The local scratch file for a write-file step could not be prepared
    #[error("step '{step}' could not prepare local file: {source}")]
    Scratch {
        step: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the node and monitoring repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("accident not found: {0}")]
    AccidentNotFound(String),

    /// Revision compare-and-swap failed
    #[error("node {id} was modified concurrently (expected revision {expected}, found {found})")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("no free address left in {0}")]
    AddressPoolExhausted(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("failed to persist snapshot: {0}")]
    Persist(String),
}

/// Errors from the node provisioning pipeline.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("node {0} is already being provisioned")]
    AlreadyRunning(String),

    #[error("node {0} is not connected")]
    NotConnected(String),

    #[error("provisioning cancelled")]
    Cancelled,

    #[error("provisioning exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid overlay key: {0}")]
    Key(String),

    #[error("invalid agent release: {0}")]
    Release(String),

    #[error("cluster join failed: {0}")]
    Cluster(String),

    #[error("failed to render {0}")]
    Render(String),
}

/// Errors returned by the fleet service to the API layer.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("failed to read node log: {0}")]
    Log(#[from] std::io::Error),
}

/// Errors raised while probing a node.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("agent rpc failed: {0}")]
    Rpc(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_names_the_step() {
        let err = WorkflowError::StepFailed {
            step: "Install deps".to_string(),
            source: ExecError::Command {
                command: "apt-get install -y curl".to_string(),
                status: 100,
                stderr: "E: unable to locate package".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.starts_with("step 'Install deps' failed"));
        assert!(msg.contains("status 100"));
    }

    #[test]
    fn connect_errors_are_classified() {
        let err = ExecError::Connect {
            target: "root@203.0.113.7:22".to_string(),
            reason: "Connection refused".to_string(),
        };
        assert!(err.is_connect());
        assert!(!ExecError::Timeout(Duration::from_secs(5)).is_connect());
    }
}
