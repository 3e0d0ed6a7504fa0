//! Per-node provisioning log under `<data_dir>/logs/nodes/<id>/provision.log`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::monitoring::page_offset;
use crate::remote::LogSink;

pub fn path(data_dir: &Path, node_id: &str) -> PathBuf {
    data_dir
        .join("logs")
        .join("nodes")
        .join(node_id)
        .join("provision.log")
}

/// Appends timestamped lines to a node's log file and mirrors them to tracing.
pub struct NodeLog {
    node_id: String,
    file: Mutex<File>,
}

impl NodeLog {
    pub fn open(data_dir: &Path, node_id: &str) -> std::io::Result<Self> {
        let path = path(data_dir, node_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            node_id: node_id.to_string(),
            file: Mutex::new(file),
        })
    }
}

impl LogSink for NodeLog {
    fn line(&self, line: &str) {
        tracing::debug!(node = %self.node_id, "{line}");
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = writeln!(file, "{stamp} {line}") {
            warn!(node = %self.node_id, error = %e, "failed to append to node log");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub lines: Vec<String>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Read one page of a node's log, 1-based. A missing log is an empty page.
pub async fn read_page(
    data_dir: &Path,
    node_id: &str,
    page: Option<usize>,
    page_size: Option<usize>,
) -> std::io::Result<LogPage> {
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size.filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE);

    let content = match tokio::fs::read_to_string(path(data_dir, node_id)).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let all: Vec<&str> = content.lines().collect();
    let lines = all
        .iter()
        .skip(page_offset(page, page_size))
        .take(page_size)
        .map(|l| l.to_string())
        .collect();

    Ok(LogPage {
        lines,
        page,
        page_size,
        total: all.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_are_timestamped_and_paged() {
        let dir = tempfile::tempdir().unwrap();
        let log = NodeLog::open(dir.path(), "n1").unwrap();
        for i in 0..5 {
            log.line(&format!("step {i}"));
        }

        let page = read_page(dir.path(), "n1", Some(2), Some(2)).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.lines.len(), 2);
        assert!(page.lines[0].ends_with(" step 2"));
        assert!(page.lines[0].contains('T'));
    }

    #[tokio::test]
    async fn huge_page_is_empty_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let log = NodeLog::open(dir.path(), "n1").unwrap();
        log.line("step 0");

        let page = read_page(dir.path(), "n1", Some(usize::MAX), Some(2)).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.lines.is_empty());
    }

    #[tokio::test]
    async fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let page = read_page(dir.path(), "ghost", None, None).await.unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(page.page_size, DEFAULT_PAGE_SIZE);
    }
}
