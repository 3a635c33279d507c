//! CSV Logger
//!
//! Appends one line per processed packet to a file.
use super::line_logger::{LineLogger, LineSink};
use crate::model::config::CsvLoggerConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub struct CsvSink {
    path: PathBuf,
    file: Option<File>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

#[async_trait]
impl LineSink for CsvSink {
    async fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        debug!("CSV logger appending to {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| anyhow!("CSV file not open"))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

pub type CsvLogger = LineLogger<CsvSink>;

impl CsvLogger {
    pub fn new(config: &CsvLoggerConfig) -> Self {
        Self::with_sink(CsvSink::new(config.path.clone()), config.delimiter.clone())
    }
}
