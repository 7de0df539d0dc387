//! Local sink: one JSON object per line.

use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SinkError;
use crate::pipeline::types::{RowReader, RowRef, SheetRow, Sink};

/// Appends each row as a JSON line and fsyncs before reporting success.
///
/// A failed append is truncated away, so the file only ever holds whole lines.
pub struct JsonlSink {
    path: PathBuf,
    /// Lines in the file, counted on first use.
    lines: Mutex<Option<usize>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lines: Mutex::new(None),
        }
    }

    async fn count_lines(&self) -> Result<usize, SinkError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes.iter().filter(|b| **b == b'\n').count()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Open for appending and return the length of the whole-line prefix.
    ///
    /// A trailing fragment left by an interrupted append is cut off first.
    async fn open_clean(&self) -> Result<(File, u64), SinkError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok((file, 0));
        }

        file.seek(SeekFrom::End(-1)).await?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok((file, len));
        }

        let bytes = fs::read(&self.path).await?;
        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1) as u64;
        warn!(
            path = %self.path.display(),
            dropped = len - keep,
            "Truncating partial trailing line"
        );
        file.set_len(keep).await?;
        Ok((file, keep))
    }
}

#[async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    /// Rows carry their own field names, so there is no header line. This
    /// only makes sure the file can be created.
    async fn ensure_header_row(&self, _schema: &[&str]) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        debug!(path = %self.path.display(), "JSONL sink ready");
        Ok(())
    }

    async fn append_row(&self, row: &SheetRow) -> Result<RowRef, SinkError> {
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');

        let mut lines = self.lines.lock().await;
        let (mut file, clean_len) = self.open_clean().await?;
        let before = match *lines {
            Some(n) => n,
            None => self.count_lines().await?,
        };

        let written = async {
            file.write_all(&line).await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(clean_len).await {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "Could not roll back failed append"
                );
            }
            *lines = None;
            return Err(e.into());
        }

        let number = before + 1;
        *lines = Some(number);
        info!(path = %self.path.display(), line = number, id = %row.message_id, "Row appended");
        Ok(RowRef(format!("{}#L{number}", self.path.display())))
    }
}

#[async_trait]
impl RowReader for JsonlSink {
    /// Lines that do not parse are skipped with a warning.
    async fn read_rows(&self) -> Result<Vec<SheetRow>, SinkError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable row"
                ),
            }
        }
        Ok(rows)
    }
}
