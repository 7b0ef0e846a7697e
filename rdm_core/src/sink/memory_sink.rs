use async_trait::async_trait;

use super::Sink;
use crate::error::{DownloadError, Result};

/// Last-resort fallback — accumulates the whole plaintext in memory and
/// exposes it as a single blob on finalize.
pub struct MemorySink {
    buffer: Option<Vec<u8>>,
    aborted: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self { buffer: Some(Vec::new()), aborted: false }
    }

    /// Returns the assembled bytes. Only meaningful after `finalize`.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        self.buffer
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn start(
        &mut self,
        _file_name: &str,
        size_hint: Option<u64>,
        _mime: Option<&str>,
        _existing_handle: Option<&str>,
    ) -> Result<String> {
        if let (Some(buf), Some(hint)) = (self.buffer.as_mut(), size_hint) {
            buf.reserve(hint as usize);
        }
        Ok(String::new())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.aborted {
            return Err(DownloadError::SinkError("write after abort".into()));
        }
        let buf = self
            .buffer
            .as_mut()
            .ok_or_else(|| DownloadError::SinkError("write after finalize".into()))?;
        buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.aborted {
            return Err(DownloadError::SinkError("finalize after abort".into()));
        }
        Ok(())
    }

    async fn abort(&mut self, _reason: &str) -> Result<()> {
        if self.aborted {
            return Ok(());
        }
        self.aborted = true;
        self.buffer = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concatenates_chunks_in_write_order() {
        let mut sink = MemorySink::new();
        sink.start("f.bin", Some(6), None, None).await.unwrap();
        sink.write(b"ab").await.unwrap();
        sink.write(b"cd").await.unwrap();
        sink.write(b"ef").await.unwrap();
        sink.finalize().await.unwrap();
        assert_eq!(sink.into_bytes().unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn abort_discards_buffer() {
        let mut sink = MemorySink::new();
        sink.start("f.bin", None, None, None).await.unwrap();
        sink.write(b"data").await.unwrap();
        sink.abort("x").await.unwrap();
        assert!(sink.into_bytes().is_none());
    }
}
