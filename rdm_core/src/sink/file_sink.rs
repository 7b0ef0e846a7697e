use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::Sink;
use crate::error::{DownloadError, Result};

/// A user-chosen persistent file location.
///
/// Uses a 256 KB buffered async writer to keep syscall overhead low on
/// the common case of many small segment writes.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
    aborted: bool,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None, aborted: false }
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn start(
        &mut self,
        _file_name: &str,
        _size_hint: Option<u64>,
        _mime: Option<&str>,
        _existing_handle: Option<&str>,
    ) -> Result<String> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(DownloadError::Disk)?;
            }
        }
        let file = tokio::fs::File::create(&self.path).await.map_err(DownloadError::Disk)?;
        self.writer = Some(BufWriter::with_capacity(256 * 1024, file));
        Ok(self.path.to_string_lossy().into_owned())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.aborted {
            return Err(DownloadError::SinkError("write after abort".into()));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DownloadError::SinkError("write before start".into()))?;
        writer.write_all(chunk).await.map_err(DownloadError::Disk)
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.aborted {
            return Err(DownloadError::SinkError("finalize after abort".into()));
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await.map_err(DownloadError::Disk)?;
        }
        Ok(())
    }

    async fn abort(&mut self, _reason: &str) -> Result<()> {
        if self.aborted {
            return Ok(()); // idempotent
        }
        self.aborted = true;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush().await;
        }
        let _ = tokio::fs::remove_file(&self.path).await;
        Ok(())
    }
}
