//! Workflows: named, ordered lists of remote steps.

pub mod engine;

use std::path::PathBuf;

pub use engine::Engine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RunCommand {
        command: String,
    },
    /// Write literal content to a remote path.
    WriteFile {
        content: String,
        dest: String,
        mode: u32,
    },
    /// Transfer an existing local file.
    CopyFile {
        source: PathBuf,
        dest: String,
        mode: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub action: Action,
    /// Run only when this command exits zero on the node.
    pub condition: Option<String>,
    pub ignore_failure: bool,
}

impl Step {
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(
            name,
            Action::RunCommand {
                command: command.into(),
            },
        )
    }

    pub fn write_file(
        name: impl Into<String>,
        content: impl Into<String>,
        dest: impl Into<String>,
        mode: u32,
    ) -> Self {
        Self::new(
            name,
            Action::WriteFile {
                content: content.into(),
                dest: dest.into(),
                mode,
            },
        )
    }

    pub fn copy_file(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        dest: impl Into<String>,
        mode: u32,
    ) -> Self {
        Self::new(
            name,
            Action::CopyFile {
                source: source.into(),
                dest: dest.into(),
                mode,
            },
        )
    }

    fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            action,
            condition: None,
            ignore_failure: false,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn ignoring_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    steps: Vec<Step>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}
