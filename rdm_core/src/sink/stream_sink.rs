use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Sink;
use crate::error::{DownloadError, Result};

/// A streaming writer that produces bytes into a channel instead of a
/// file. The receiving half is handed to whatever surface drains it (e.g.
/// an HTTP response body).
pub struct StreamSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl StreamSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx: Some(tx), rx: Some(rx) }
    }

    /// Takes the receiver half. Must be called before/after `start` but
    /// only once — later callers get `None`.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.rx.take()
    }
}

#[async_trait]
impl Sink for StreamSink {
    async fn start(
        &mut self,
        _file_name: &str,
        _size_hint: Option<u64>,
        _mime: Option<&str>,
        _existing_handle: Option<&str>,
    ) -> Result<String> {
        if self.tx.is_none() {
            return Err(DownloadError::SinkError("stream sink already finalized/aborted".into()));
        }
        Ok(String::new())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| DownloadError::SinkError("write after finalize/abort".into()))?;
        tx.send(chunk.to_vec())
            .await
            .map_err(|_| DownloadError::SinkError("stream receiver dropped".into()))
    }

    async fn finalize(&mut self) -> Result<()> {
        self.tx.take(); // closes the channel — receiver observes end-of-stream
        Ok(())
    }

    async fn abort(&mut self, _reason: &str) -> Result<()> {
        self.tx.take(); // idempotent: dropping `None` again is a no-op
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_arrive_in_order_and_channel_closes_on_finalize() {
        let mut sink = StreamSink::new(4);
        let mut rx = sink.take_receiver().unwrap();
        sink.start("f.bin", None, None, None).await.unwrap();
        sink.write(b"one").await.unwrap();
        sink.write(b"two").await.unwrap();
        sink.finalize().await.unwrap();

        assert_eq!(rx.recv().await, Some(b"one".to_vec()));
        assert_eq!(rx.recv().await, Some(b"two".to_vec()));
        assert_eq!(rx.recv().await, None);
    }
}
