//! Polymorphic append-only writer for the final plaintext output. Uses a
//! boxed trait-object pattern so the orchestrator can pick among file,
//! in-memory, and streaming destinations without knowing which one it got.

mod file_sink;
mod memory_sink;
mod stream_sink;
mod temp_file_sink;

pub use file_sink::FileSink;
pub use memory_sink::MemorySink;
pub use stream_sink::StreamSink;
pub use temp_file_sink::TempFileSink;

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;

/// An append-only writer: `start` is called once, `write` zero or more
/// times in strictly ascending plaintext order, then exactly one of
/// `finalize`/`abort`. `abort` must be idempotent; `finalize` must never be
/// called after `abort`.
///
/// `start` returns an opaque handle string identifying whatever resource it
/// acquired (a temp file path, for variants that have one); the empty string
/// means the variant has nothing worth persisting across sessions.
/// `existing_handle`, when present, asks the sink to re-acquire a
/// previously-returned handle instead of allocating a fresh one — the resume
/// store's `writerHandles` table is what supplies it.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn start(
        &mut self,
        file_name: &str,
        size_hint: Option<u64>,
        mime: Option<&str>,
        existing_handle: Option<&str>,
    ) -> Result<String>;
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;
    async fn finalize(&mut self) -> Result<()>;
    async fn abort(&mut self, reason: &str) -> Result<()>;
}

/// Selection policy for acquiring a `Sink`, tried in order and fallen
/// through on error.
pub struct SinkFactory {
    pub disable_fs: bool,
    pub disable_opfs: bool,
    pub disable_stream: bool,
    /// User-chosen output path, when the caller wants variant 1.
    pub user_path: Option<PathBuf>,
    /// Directory app-managed temp files are created under.
    pub temp_dir: PathBuf,
}

/// Which concrete sink variant was actually selected (for status reporting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    File,
    TempFile,
    Stream,
    Memory,
}

impl SinkFactory {
    /// Tries each variant in fallback order: user-chosen file, app-managed
    /// temp file, streaming channel, in-memory buffer.
    pub fn acquire(&self, prefix: &str, file_name: &str) -> (SinkKind, Box<dyn Sink>) {
        if !self.disable_fs {
            if let Some(path) = &self.user_path {
                return (SinkKind::File, Box::new(FileSink::new(path.clone())));
            }
        }
        if !self.disable_opfs {
            return (
                SinkKind::TempFile,
                Box::new(TempFileSink::new(self.temp_dir.clone(), prefix, file_name)),
            );
        }
        if !self.disable_stream {
            return (SinkKind::Stream, Box::new(StreamSink::new(256)));
        }
        (SinkKind::Memory, Box::new(MemorySink::new()))
    }
}

/// Sanitizes a user-supplied file name for embedding into a temp file name,
/// matching the `tmp_<prefix>_<sanitized>_<uuid>.bin` scheme.
pub fn sanitize_for_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_for_filename("my file/name?.mp4"), "my_file_name_.mp4");
    }
}
