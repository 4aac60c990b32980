//! Metrics exporters
//!
//! Exporters receive every [`LogRecord`] the trainer emits. Two are built in:
//! structured `tracing` events and an append-only JSONL file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::LogRecord;
use crate::error::Result;

/// Trait for metrics exporters
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Exporter name
    fn name(&self) -> &str;

    /// Export one record
    async fn export(&mut self, record: &LogRecord) -> Result<()>;

    /// Flush buffered output
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits each record as an `info!` event
#[derive(Debug, Default)]
pub struct TracingExporter;

#[async_trait]
impl MetricsExporter for TracingExporter {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn export(&mut self, record: &LogRecord) -> Result<()> {
        let rendered = record
            .metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(step = record.step, epoch = format!("{:.2}", record.epoch), "{}", rendered);
        Ok(())
    }
}

/// Appends one JSON object per record to a file
#[derive(Debug)]
pub struct JsonlExporter {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl JsonlExporter {
    /// Export to `path`, created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn file(&mut self) -> Result<&mut tokio::fs::File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?
            }
        };
        Ok(self.file.insert(file))
    }
}

#[async_trait]
impl MetricsExporter for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export(&mut self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file().await?.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_jsonl_exporter_appends_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join("metrics.jsonl");
        let mut exporter = JsonlExporter::new(&path);

        for step in [5, 10] {
            let record = LogRecord {
                step,
                epoch: 0.5,
                metrics: BTreeMap::from([("loss".to_string(), 0.5)]),
                timestamp: Utc::now(),
            };
            exporter.export(&record).await.unwrap();
        }
        exporter.flush().await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<LogRecord> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].step, 10);
    }
}
