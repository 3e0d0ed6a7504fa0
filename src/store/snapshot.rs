//! On-disk snapshot of the persisted tables.
//!
//! Layout: one header line `sha256:<hex> <saved-at>` followed by the JSON of
//! the tables. The digest covers the JSON bytes exactly as written. The file
//! holds SSH and WireGuard secrets, so it is created owner-only and swapped
//! into place by rename.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::memory::Tables;

fn digest(body: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(body))
}

fn encode(tables: &Tables) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(tables).context("serializing tables")?;
    let mut content = format!("{} {}\n", digest(&body), Utc::now().to_rfc3339()).into_bytes();
    content.extend_from_slice(&body);
    Ok(content)
}

fn decode(content: &[u8]) -> Result<Tables> {
    let newline = content
        .iter()
        .position(|b| *b == b'\n')
        .context("snapshot has no header line")?;
    let (header, body) = (&content[..newline], &content[newline + 1..]);
    let header = std::str::from_utf8(header).context("snapshot header is not UTF-8")?;
    let recorded = header.split_whitespace().next().unwrap_or_default();

    let actual = digest(body);
    if recorded != actual {
        warn!(recorded = %recorded, actual = %actual, "snapshot checksum mismatch");
        bail!("checksum mismatch: header says {recorded}, content is {actual}");
    }
    serde_json::from_slice(body).context("parsing snapshot tables")
}

/// Open `path` for writing with owner-only permissions, tightening a file
/// left behind by an earlier run.
async fn create_private(path: &Path) -> Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let file = options
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("restricting {}", path.display()))?;
    }
    Ok(file)
}

pub struct SnapshotFile {
    path: PathBuf,
    /// Serializes writers so renames land in call order.
    writing: Mutex<()>,
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writing: Mutex::new(()),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn write(&self, tables: &Tables) -> Result<()> {
        let content = encode(tables)?;
        let _writing = self.writing.lock().await;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let staged = self.path.with_extension("json.tmp");
        let mut file = create_private(&staged).await?;
        file.write_all(&content)
            .await
            .with_context(|| format!("writing {}", staged.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing {}", staged.display()))?;
        drop(file);

        tokio::fs::rename(&staged, &self.path)
            .await
            .with_context(|| format!("moving {} into place", staged.display()))
    }

    pub async fn read(&self) -> Result<Tables> {
        let content = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        decode(&content).with_context(|| format!("loading {}", self.path.display()))
    }
}
