//! Scripted in-process executor for tests.
//!
//! Responses are matched by command substring; the most recently added rule
//! wins. Every command and written file is recorded per node.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandOutput, Connector, LogSink, RemoteExecutor};
use crate::domain::node::Node;
use crate::error::ExecError;

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub node_id: String,
    pub dest: String,
    pub content: String,
    pub mode: u32,
}

#[derive(Clone)]
struct Rule {
    pattern: String,
    node_id: Option<String>,
    output: CommandOutput,
    delay: Option<Duration>,
}

#[derive(Default)]
pub struct FakeState {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, String)>>,
    files: Mutex<Vec<WrittenFile>>,
    unreachable: Mutex<HashSet<String>>,
    failing_writes: Mutex<Vec<String>>,
    closed: Mutex<usize>,
}

impl FakeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add(&self, rule: Rule) {
        self.rules.lock().unwrap().push(rule);
    }

    /// Answer commands containing `pattern` on any node.
    pub fn on(&self, pattern: &str, status: i32, stdout: &str) {
        self.add(Rule {
            pattern: pattern.to_string(),
            node_id: None,
            output: CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: if status == 0 { String::new() } else { format!("{pattern} failed") },
            },
            delay: None,
        });
    }

    /// Answer commands containing `pattern` on one node.
    pub fn on_node(&self, node_id: &str, pattern: &str, status: i32, stdout: &str) {
        self.add(Rule {
            pattern: pattern.to_string(),
            node_id: Some(node_id.to_string()),
            output: CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
            delay: None,
        });
    }

    /// Succeed after sleeping for `delay`.
    pub fn delay(&self, pattern: &str, delay: Duration) {
        self.add(Rule {
            pattern: pattern.to_string(),
            node_id: None,
            output: CommandOutput::default(),
            delay: Some(delay),
        });
    }

    /// Refuse connections to the node.
    pub fn unreachable(&self, node_id: &str) {
        self.unreachable.lock().unwrap().insert(node_id.to_string());
    }

    /// Make writes to `dest` fail.
    pub fn fail_writes_to(&self, dest: &str) {
        self.failing_writes.lock().unwrap().push(dest.to_string());
    }

    pub fn commands(&self, node_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(node, _)| node == node_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub fn ran(&self, node_id: &str, pattern: &str) -> bool {
        self.commands(node_id).iter().any(|c| c.contains(pattern))
    }

    pub fn files(&self, node_id: &str) -> Vec<WrittenFile> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Latest content written to `dest` on the node.
    pub fn file(&self, node_id: &str, dest: &str) -> Option<String> {
        self.files(node_id)
            .into_iter()
            .rev()
            .find(|f| f.dest == dest)
            .map(|f| f.content)
    }

    pub fn closed(&self) -> usize {
        *self.closed.lock().unwrap()
    }

    fn respond(&self, node_id: &str, command: &str) -> Rule {
        self.calls
            .lock()
            .unwrap()
            .push((node_id.to_string(), command.to_string()));
        self.rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| {
                command.contains(&r.pattern)
                    && r.node_id.as_deref().map_or(true, |n| n == node_id)
            })
            .cloned()
            .unwrap_or(Rule {
                pattern: String::new(),
                node_id: None,
                output: CommandOutput::default(),
                delay: None,
            })
    }
}

pub struct FakeExecutor {
    node_id: String,
    state: Arc<FakeState>,
}

impl FakeExecutor {
    pub fn new(node_id: &str, state: Arc<FakeState>) -> Self {
        Self {
            node_id: node_id.to_string(),
            state,
        }
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(&self, command: &str) -> Result<CommandOutput, ExecError> {
        let rule = self.state.respond(&self.node_id, command);
        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(rule.output)
    }

    async fn run_streaming(
        &self,
        command: &str,
        sink: &dyn LogSink,
    ) -> Result<CommandOutput, ExecError> {
        let output = self.run(command).await?;
        for line in output.stdout.lines().chain(output.stderr.lines()) {
            sink.line(line);
        }
        Ok(output)
    }

    async fn write_file(&self, dest: &str, content: &[u8], mode: u32) -> Result<(), ExecError> {
        if self.state.failing_writes.lock().unwrap().iter().any(|d| d == dest) {
            return Err(ExecError::Transfer {
                dest: dest.to_string(),
                reason: "permission denied".to_string(),
            });
        }
        self.state.files.lock().unwrap().push(WrittenFile {
            node_id: self.node_id.clone(),
            dest: dest.to_string(),
            content: String::from_utf8_lossy(content).into_owned(),
            mode,
        });
        Ok(())
    }

    async fn close(&self) {
        *self.state.closed.lock().unwrap() += 1;
    }
}

pub struct FakeConnector {
    pub state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new(state: Arc<FakeState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteExecutor>, ExecError> {
        if self.state.unreachable.lock().unwrap().contains(&node.id) {
            return Err(ExecError::Connect {
                target: node.ssh_target(),
                reason: "Connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeExecutor::new(&node.id, Arc::clone(&self.state))))
    }
}

/// Collects log lines in memory.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}
