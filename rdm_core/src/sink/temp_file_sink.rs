use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::{sanitize_for_filename, Sink};
use crate::error::{DownloadError, Result};

/// An app-managed temporary file under a per-process namespace directory,
/// named `tmp_<prefix>_<sanitized>_<uuid>.bin`.
/// On `finalize` the caller is expected to re-open `final_path()` and
/// present it as a download; this sink itself just guarantees the bytes
/// are flushed to disk.
pub struct TempFileSink {
    dir: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
    aborted: bool,
}

impl TempFileSink {
    pub fn new(dir: PathBuf, prefix: &str, file_name: &str) -> Self {
        let name = format!(
            "tmp_{}_{}_{}.bin",
            prefix,
            sanitize_for_filename(file_name),
            Uuid::new_v4()
        );
        Self {
            temp_path: dir.join(&name),
            dir,
            writer: None,
            aborted: false,
        }
    }

    pub fn final_path(&self) -> &PathBuf {
        &self.temp_path
    }
}

#[async_trait]
impl Sink for TempFileSink {
    /// `existing_handle`, when present, is a path this sink previously
    /// returned from `start` — reopening it (rather than the freshly
    /// generated `temp_path`) avoids orphaning the earlier file on a
    /// resumed session, which rewrites the plaintext stream from scratch.
    async fn start(
        &mut self,
        _file_name: &str,
        _size_hint: Option<u64>,
        _mime: Option<&str>,
        existing_handle: Option<&str>,
    ) -> Result<String> {
        if let Some(handle) = existing_handle {
            self.temp_path = PathBuf::from(handle);
        }
        tokio::fs::create_dir_all(&self.dir).await.map_err(DownloadError::Disk)?;
        let file = tokio::fs::File::create(&self.temp_path).await.map_err(DownloadError::Disk)?;
        self.writer = Some(BufWriter::with_capacity(256 * 1024, file));
        Ok(self.temp_path.to_string_lossy().into_owned())
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
            return Ok(());
        }
        self.aborted = true;
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush().await;
        }
        let _ = tokio::fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}

impl Drop for TempFileSink {
    /// App-managed temp files are released on process teardown if never
    /// explicitly finalized/collected.
    fn drop(&mut self) {
        if self.writer.is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn name_follows_tmp_prefix_sanitized_uuid_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TempFileSink::new(dir.path().to_path_buf(), "rdmv", "My File?.bin");
        let name = sink.final_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tmp_rdmv_My_File_.bin_"));
        assert!(name.ends_with(".bin"));
    }

    #[tokio::test]
    async fn writes_survive_to_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TempFileSink::new(dir.path().to_path_buf(), "rdmv", "video.mp4");
        let path = sink.final_path().clone();
        sink.start("video.mp4", None, None, None).await.unwrap();
        sink.write(b"hello").await.unwrap();
        sink.finalize().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn existing_handle_reopens_the_same_path_instead_of_a_fresh_one() {
        let dir = tempfile::tempdir().unwrap();
        let reused_path = dir.path().join("tmp_rdmv_earlier_session.bin");

        let mut sink = TempFileSink::new(dir.path().to_path_buf(), "rdmv", "video.mp4");
        let handle = sink.start("video.mp4", None, None, Some(reused_path.to_str().unwrap())).await.unwrap();

        assert_eq!(handle, reused_path.to_string_lossy());
        assert_eq!(sink.final_path(), &reused_path);
        sink.write(b"resumed").await.unwrap();
        sink.finalize().await.unwrap();
        assert_eq!(std::fs::read(&reused_path).unwrap(), b"resumed");
    }
}
