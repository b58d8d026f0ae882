// SPDX-License-Identifier: GPL-3.0-only

//! On-disk spool for events that were queued but never delivered at shutdown.
//!
//! One JSON document per line; replayed and emptied on the next start.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use zshare_types::ConfigEvent;

#[derive(Debug, Clone)]
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append events after anything already spooled.
    pub async fn append(&self, events: &[ConfigEvent]) -> std::io::Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut contents = String::new();
        for event in events {
            contents.push_str(&serde_json::to_string(event)?);
            contents.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read every spooled event and empty the spool.
    ///
    /// Lines that do not parse are logged and skipped.
    pub async fn take(&self) -> std::io::Result<Vec<ConfigEvent>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let mut events = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ConfigEvent>(line) {
                Ok(event) => events.push(event),
                Err(error) => tracing::warn!(
                    "Skipping unreadable spool entry {}:{}: {}",
                    self.path.display(),
                    index + 1,
                    error
                ),
            }
        }

        tokio::fs::remove_file(&self.path).await?;
        Ok(events)
    }
}
