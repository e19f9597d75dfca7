//! Append-only JSON-lines sink: one serialized anomaly record per line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::detect::AnomalyRecord;
use crate::sink::AnomalySink;

pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    /// Open (or create) `path` in append mode, creating parent directories.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create sink directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open anomaly log: {}", path.display()))?;

        debug!(path = %path.display(), "anomaly log opened");
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AnomalySink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn deliver(&self, record: &AnomalyRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to serialize anomaly record")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write anomaly log: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush anomaly log: {}", self.path.display()))?;
        Ok(())
    }
}
