//! Bounded CPU worker pool plus in-order flush buffer. Decryption runs on
//! `spawn_blocking` (AEAD open is CPU-bound, not async) gated by a
//! `Semaphore`, keeping the async runtime free of blocking work.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use zeroize::Zeroize;

use crate::codec::decrypt_segment;
use crate::error::{DownloadError, Result};
use crate::sink::Sink;
use crate::types::{PlanMeta, RangeMapping, KEY_LEN, NONCE_LEN};

pub struct DecryptJob {
    pub segment_index: u64,
    pub ciphertext: Vec<u8>,
    pub plaintext_length: u64,
    pub mapping: RangeMapping,
}

/// N = min(configured parallelism, hardware parallelism, segment count).
pub fn worker_count(configured: usize, segment_count: usize) -> usize {
    let hardware = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    configured.min(hardware).min(segment_count.max(1)).max(1)
}

/// Each worker is initialized once with (data key, base nonce, block
/// dimensions, mode); this struct holds that shared state and a semaphore
/// standing in for "N workers" since the actual work unit is a
/// `spawn_blocking` task rather than a dedicated OS thread.
pub struct DecryptPool {
    meta: PlanMeta,
    data_key: [u8; KEY_LEN],
    base_nonce: [u8; NONCE_LEN],
    permits: Arc<Semaphore>,
}

impl DecryptPool {
    pub fn new(meta: PlanMeta, data_key: [u8; KEY_LEN], base_nonce: [u8; NONCE_LEN], parallelism: usize) -> Self {
        Self { meta, data_key, base_nonce, permits: Arc::new(Semaphore::new(parallelism.max(1))) }
    }

    /// Decrypts one job, moving the ciphertext buffer into the blocking task
    /// rather than copying it. AEAD failure or a length mismatch is fatal —
    /// the caller is expected to abort the whole job, not retry.
    pub async fn submit(&self, job: DecryptJob) -> Result<(u64, Vec<u8>)> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::Cancelled)?;
        let meta = self.meta.clone();
        let mut key = self.data_key;
        let nonce = self.base_nonce;

        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = decrypt_segment(&meta, &key, &nonce, &job.mapping, job.plaintext_length, &job.ciphertext);
            key.zeroize();
            let plaintext = result?;
            Ok::<_, DownloadError>((job.segment_index, plaintext))
        })
        .await
        .map_err(|e| DownloadError::SinkError(format!("decrypt worker panicked: {e}")))?;

        outcome
    }
}

impl Drop for DecryptPool {
    fn drop(&mut self) {
        self.data_key.zeroize();
    }
}

/// Holds out-of-order results until they can be flushed to the Sink in
/// strict ascending segment-index order. Used both for crypt-mode
/// plaintext and, in plain mode, for raw ciphertext written straight
/// through (the decrypt pool itself is bypassed in plain mode).
pub struct ReorderBuffer {
    pending: BTreeMap<u64, Vec<u8>>,
    next_to_write: u64,
    backpressure_limit: usize,
}

impl ReorderBuffer {
    /// `backpressure_limit` should be roughly `2 * N` worker slots.
    pub fn new(backpressure_limit: usize) -> Self {
        Self { pending: BTreeMap::new(), next_to_write: 0, backpressure_limit: backpressure_limit.max(1) }
    }

    pub fn is_over_backpressure(&self) -> bool {
        self.pending.len() >= self.backpressure_limit
    }

    pub fn insert(&mut self, index: u64, data: Vec<u8>) {
        self.pending.insert(index, data);
    }

    /// Drains the contiguous prefix starting at `next_to_write` to `sink`,
    /// returning the number of plaintext bytes flushed and the indices
    /// flushed, in ascending order — callers use the index list to release
    /// whatever per-segment backpressure accounting they're holding.
    pub async fn flush(&mut self, sink: &mut dyn Sink) -> Result<(u64, Vec<u64>)> {
        let mut flushed = 0u64;
        let mut indices = Vec::new();
        while let Some(data) = self.pending.remove(&self.next_to_write) {
            sink.write(&data).await?;
            flushed += data.len() as u64;
            indices.push(self.next_to_write);
            self.next_to_write += 1;
        }
        Ok((flushed, indices))
    }

    pub fn next_to_write(&self) -> u64 {
        self.next_to_write
    }
}
