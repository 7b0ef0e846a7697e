//! Wires the range planner, scheduler, retry policy, decrypt pool, and sink
//! together behind a small set of lifecycle verbs. State transitions are
//! logged through `log::info!` with the exact Chinese status strings listed
//! in `status_text`, and mirrored onto a `watch` channel so a caller (the
//! CLI or otherwise) can observe them without polling logs — the same
//! observer/notifier fan-out shape used for byte progress, applied here to
//! lifecycle status instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::decrypt_pool::{self, DecryptJob, DecryptPool, ReorderBuffer};
use crate::error::{DownloadError, Result};
use crate::progress::ProgressEvent;
use crate::resume_store::{resume_key, ResumeStore};
use crate::scheduler::{HttpSegmentFetcher, Scheduler, SegmentFetcher, SegmentOutcome};
use crate::sink::Sink;
use crate::types::{
    CryptHeader, EncryptionMode, Manifest, NONCE_LEN, PlanMeta, RangeMapping, RequestContext, Segment, SegmentStatus,
};

/// Exact status strings surfaced to callers on exit/completion.
pub mod status_text {
    pub const READY: &str = "准备就绪";
    pub const DOWNLOADING: &str = "开始下载";
    pub const DONE: &str = "下载完成";
    pub const CANCELLED: &str = "下载已取消";
    pub fn failed(msg: &str) -> String {
        format!("下载失败:{msg}")
    }
    pub fn save_failed(msg: &str) -> String {
        format!("解密成功但保存失败:{msg}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorStatus {
    Idle,
    Prepared,
    Running,
    Paused,
    Finalizing,
    Done,
    Cancelled,
    Failed(String),
    SaveFailed(String),
}

impl OrchestratorStatus {
    pub fn status_line(&self) -> String {
        match self {
            OrchestratorStatus::Idle | OrchestratorStatus::Prepared => status_text::READY.to_string(),
            OrchestratorStatus::Running | OrchestratorStatus::Paused => status_text::DOWNLOADING.to_string(),
            OrchestratorStatus::Finalizing => status_text::DOWNLOADING.to_string(),
            OrchestratorStatus::Done => status_text::DONE.to_string(),
            OrchestratorStatus::Cancelled => status_text::CANCELLED.to_string(),
            OrchestratorStatus::Failed(msg) => status_text::failed(msg),
            OrchestratorStatus::SaveFailed(msg) => status_text::save_failed(msg),
        }
    }
}

pub struct PrepareOutcome {
    pub reused_segments: u64,
    pub total_segments: u64,
}

/// Wires the planner, scheduler, decrypt pool and sink together. Generic
/// over the fetcher so tests can substitute a mock HTTP layer; `rdm_cli`
/// uses the default `HttpSegmentFetcher`.
pub struct Orchestrator<F: SegmentFetcher = HttpSegmentFetcher> {
    config: Config,
    store: Arc<ResumeStore>,
    fetcher: Arc<F>,

    key: String,
    manifest: Option<Manifest>,
    plan_meta: Option<PlanMeta>,
    segments: Vec<Segment>,
    total_encrypted: u64,
    failed: Vec<u64>,
    base_nonce: [u8; NONCE_LEN],

    status: OrchestratorStatus,
    status_tx: watch::Sender<OrchestratorStatus>,
    paused_tx: watch::Sender<bool>,
    cancel: CancellationToken,

    progress_tx: Option<mpsc::Sender<std::result::Result<ProgressEvent, String>>>,
}

impl<F: SegmentFetcher + 'static> Orchestrator<F> {
    pub fn new(config: Config, store: Arc<ResumeStore>, fetcher: Arc<F>) -> Self {
        let (status_tx, _) = watch::channel(OrchestratorStatus::Idle);
        let (paused_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            fetcher,
            key: String::new(),
            manifest: None,
            plan_meta: None,
            segments: Vec::new(),
            total_encrypted: 0,
            failed: Vec::new(),
            base_nonce: [0u8; NONCE_LEN],
            status: OrchestratorStatus::Idle,
            status_tx,
            paused_tx,
            cancel: CancellationToken::new(),
            progress_tx: None,
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        self.status.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OrchestratorStatus> {
        self.status_tx.subscribe()
    }

    /// Registers the channel progress events are published to; the caller
    /// is expected to run a `ProgressNotifier` over the receiving half.
    pub fn set_progress_sink(&mut self, tx: mpsc::Sender<std::result::Result<ProgressEvent, String>>) {
        self.progress_tx = Some(tx);
    }

    fn transition(&mut self, status: OrchestratorStatus) {
        log::info!("{}", status.status_line());
        self.status = status.clone();
        let _ = self.status_tx.send(status);
    }

    async fn emit_progress(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(Ok(event)).await;
        }
    }

    /// Validates key material, plans segments, restores from the Resume
    /// Store, and reports the reused-segment count.
    pub async fn prepare_from_info(
        &mut self,
        manifest: Manifest,
        path: &str,
        sign: &str,
    ) -> Result<PrepareOutcome> {
        manifest.validate()?;
        self.base_nonce = self.fetch_base_nonce(&manifest).await?;

        self.key = resume_key("rdmv", path, sign);
        self.store.ensure_session().await?;
        self.store.completion_sweep(&self.key).await?;

        let plan_meta = PlanMeta {
            total_size: manifest.total_size,
            block_data_size: manifest.block_data_size,
            block_header_size: manifest.block_header_size,
            file_header_size: manifest.file_header_size,
            encryption_mode: manifest.encryption_mode,
            segment_size_bytes: self.config.segment_size_bytes(),
        };
        let (mut segments, total_encrypted) = crate::planner::plan_segments(&plan_meta);
        let signature = plan_meta.signature();

        let restored = self.store.restore(&self.key, &signature).await?;
        let reused = restored.len() as u64;
        for r in restored {
            if let Some(seg) = segments.get_mut(r.index as usize) {
                seg.ciphertext = Some(r.ciphertext);
                seg.status = SegmentStatus::Done;
            }
        }

        self.store.put_manifest(&self.key, &manifest).await?;

        let total_segments = segments.len() as u64;
        self.manifest = Some(manifest);
        self.plan_meta = Some(plan_meta);
        self.segments = segments;
        self.total_encrypted = total_encrypted;
        self.failed.clear();
        self.cancel = CancellationToken::new();

        self.transition(OrchestratorStatus::Prepared);
        log::info!("prepared: {total_segments} segments, {reused} reused from resume store");

        Ok(PrepareOutcome { reused_segments: reused, total_segments })
    }

    /// Crypt mode carries no base nonce in the manifest itself — it lives in
    /// the `CryptHeader` at the very start of the origin's byte stream, so it
    /// has to be fetched with its own range request before any segment work
    /// can be dispatched.
    async fn fetch_base_nonce(&self, manifest: &Manifest) -> Result<[u8; NONCE_LEN]> {
        if manifest.encryption_mode == EncryptionMode::Plain {
            return Ok([0u8; NONCE_LEN]);
        }
        let ctx = RequestContext {
            url: manifest.resolved_url()?,
            method: manifest.method.clone(),
            headers: manifest.headers.clone(),
        };
        let header_len = manifest.file_header_size as u64;
        let header_segment = Segment::new(
            0,
            0,
            header_len,
            RangeMapping { underlying_offset: 0, underlying_limit: header_len, discard: 0, starting_block_index: 0 },
        );
        let outcome = self
            .fetcher
            .fetch(&ctx, &header_segment, Duration::from_secs(self.config.ttfb_timeout_secs))
            .await?;
        Ok(CryptHeader::parse(&outcome.bytes)?.base_nonce)
    }

    /// If the refreshed manifest is plan-compatible (same signature and
    /// data key), swaps only the remote URL and headers. Otherwise
    /// re-prepares, unless a download is actively running — in which case
    /// the mismatch is logged and the running task is left alone.
    pub async fn refresh_from_info(&mut self, manifest: Manifest, path: &str, sign: &str) -> Result<()> {
        manifest.validate()?;
        let new_meta = PlanMeta {
            total_size: manifest.total_size,
            block_data_size: manifest.block_data_size,
            block_header_size: manifest.block_header_size,
            file_header_size: manifest.file_header_size,
            encryption_mode: manifest.encryption_mode,
            segment_size_bytes: self.config.segment_size_bytes(),
        };

        let compatible = match (&self.plan_meta, &self.manifest) {
            (Some(current), Some(current_manifest)) => {
                current.signature() == new_meta.signature() && current_manifest.data_key == manifest.data_key
            }
            _ => false,
        };

        if compatible {
            if let Some(current) = self.manifest.as_mut() {
                current.remote_url = manifest.remote_url;
                current.remote_url_base64 = manifest.remote_url_base64;
                current.method = manifest.method;
                current.headers = manifest.headers;
            }
            log::info!("refreshFromInfo: plan-compatible, swapped remote url/headers");
            return Ok(());
        }

        if self.status == OrchestratorStatus::Running {
            log::warn!("refreshFromInfo: incompatible signature while running; leaving the active download alone");
            return Ok(());
        }

        let outcome = self.prepare_from_info(manifest, path, sign).await?;
        log::info!("refreshFromInfo: incompatible signature, re-prepared ({} reused)", outcome.reused_segments);
        Ok(())
    }

    /// Drives the scheduler + decrypt/flush pipeline to completion. Returns
    /// once every segment is `Done`/`Failed` and the sink has been
    /// finalized (or errors out, in which case the sink is aborted).
    pub async fn start(&mut self, sink: &mut dyn Sink, request_headers: HashMap<String, String>) -> Result<()> {
        let manifest = self.manifest.clone().ok_or_else(|| DownloadError::Precondition("not prepared".into()))?;
        let plan_meta = self.plan_meta.clone().ok_or_else(|| DownloadError::Precondition("not prepared".into()))?;

        self.transition(OrchestratorStatus::Running);
        self.emit_progress(ProgressEvent::Init { total_encrypted: self.total_encrypted, total_size: manifest.total_size })
            .await;

        let existing_handle = self.store.get_writer_handle(&self.key).await?;
        let mime = manifest.headers.get("content-type").map(|s| s.as_str());
        let handle =
            sink.start(&manifest.file_name, Some(manifest.total_size), mime, existing_handle.as_deref()).await?;
        if !handle.is_empty() {
            self.store.put_writer_handle(&self.key, &handle).await?;
        }

        let result = self.run_pipeline(&manifest, &plan_meta, sink, request_headers).await;

        match result {
            Ok(()) => {
                self.transition(OrchestratorStatus::Finalizing);
                match sink.finalize().await {
                    Ok(()) => {
                        self.store.completion_sweep(&self.key).await?;
                        self.transition(OrchestratorStatus::Done);
                        Ok(())
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        self.transition(OrchestratorStatus::SaveFailed(msg.clone()));
                        Err(DownloadError::SinkSaveFailed(msg))
                    }
                }
            }
            Err(DownloadError::Cancelled) => {
                let _ = sink.abort("cancelled").await;
                self.transition(OrchestratorStatus::Cancelled);
                Err(DownloadError::Cancelled)
            }
            Err(e) => {
                let _ = sink.abort(&e.to_string()).await;
                self.transition(OrchestratorStatus::Failed(e.to_string()));
                self.emit_progress_error(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn emit_progress_error(&self, message: String) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(Err(message)).await;
        }
    }

    async fn run_pipeline(
        &mut self,
        manifest: &Manifest,
        plan_meta: &PlanMeta,
        sink: &mut dyn Sink,
        mut request_headers: HashMap<String, String>,
    ) -> Result<()> {
        for (k, v) in &manifest.headers {
            request_headers.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let ctx = RequestContext {
            url: manifest.resolved_url()?,
            method: manifest.method.clone(),
            headers: request_headers,
        };

        let already_done: Vec<u64> =
            self.segments.iter().filter(|s| s.status == SegmentStatus::Done).map(|s| s.index).collect();
        let to_schedule: Vec<Segment> =
            self.segments.iter().filter(|s| s.status != SegmentStatus::Done).cloned().collect();

        let worker_count = decrypt_pool::worker_count(self.config.decrypt_parallelism, self.segments.len());
        let pool = Arc::new(DecryptPool::new(
            plan_meta.clone(),
            manifest_data_key(manifest)?,
            self.base_nonce,
            worker_count,
        ));

        let mut reorder = ReorderBuffer::new(2 * worker_count);

        // Segments with ciphertext in hand but not yet handed to the decrypt
        // pool, held back while `reorder` sits at its backpressure limit so
        // decode work never outpaces the sink by more than `2 * worker_count`
        // decoded-but-unflushed segments.
        let mut pending_decode: std::collections::VecDeque<Segment> = std::collections::VecDeque::new();

        // Segments restored from the resume store are already `Done`; feed
        // their ciphertext through the same decode path before dispatching
        // the rest, so `nextToWrite` only blocks on genuinely outstanding
        // work.
        let mut decode_tasks = tokio::task::JoinSet::new();
        for index in already_done {
            pending_decode.push_back(self.segments[index as usize].clone());
        }
        self.dispatch_pending_decode(&mut pending_decode, &mut decode_tasks, &pool, plan_meta, &reorder);

        let (outcome_tx, mut outcome_rx) = mpsc::channel(64);
        let mut segments_mut = to_schedule;
        let cancel = self.cancel.clone();
        let paused_rx = self.paused_tx.subscribe();
        let scheduler = Scheduler::new(
            self.fetcher.clone(),
            self.config.connection_limit,
            Duration::from_secs(self.config.ttfb_timeout_secs),
            self.config.segment_retry_limit,
        );

        let scheduler_handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move { scheduler.run(ctx, &mut segments_mut, outcome_tx, cancel, paused_rx).await })
        };

        let mut scheduler_done = false;
        loop {
            if self.cancel.is_cancelled() {
                scheduler_handle.abort();
                return Err(DownloadError::Cancelled);
            }

            tokio::select! {
                biased;

                outcome = outcome_rx.recv(), if !scheduler_done => {
                    match outcome {
                        Some(SegmentOutcome::Done { index, ciphertext, overrun_discarded }) => {
                            if overrun_discarded > 0 {
                                log::warn!("segment {index}: discarded {overrun_discarded} over-fetched bytes");
                            }
                            self.emit_progress(ProgressEvent::EncryptedDelta(ciphertext.len() as u64)).await;
                            self.store.put_segment(&self.key, index, &plan_meta.signature(), &ciphertext).await?;
                            self.segments[index as usize].status = SegmentStatus::Done;
                            let seg = self.segments[index as usize].clone();
                            pending_decode.push_back(seg.with_ciphertext(ciphertext));
                            self.dispatch_pending_decode(&mut pending_decode, &mut decode_tasks, &pool, plan_meta, &reorder);
                        }
                        Some(SegmentOutcome::Failed { index, error }) => {
                            self.segments[index as usize].status = SegmentStatus::Failed;
                            self.segments[index as usize].error = Some(error.to_string());
                            self.failed.push(index);
                            log::warn!("segment {index} failed permanently: {error}");
                        }
                        None => scheduler_done = true,
                    }
                }

                Some(decoded) = decode_tasks.join_next() => {
                    let (index, plaintext) = decoded.map_err(|e| DownloadError::SinkError(format!("decode task panicked: {e}")))??;
                    reorder.insert(index, plaintext);
                    let (flushed, indices) = reorder.flush(sink).await?;
                    if flushed > 0 {
                        self.emit_progress(ProgressEvent::DecryptedDelta(flushed)).await;
                        for i in indices {
                            self.segments[i as usize].ciphertext = None;
                        }
                    }
                    self.dispatch_pending_decode(&mut pending_decode, &mut decode_tasks, &pool, plan_meta, &reorder);
                }

                else => break,
            }

            // A `pending_decode` entry can only be stuck this way behind a
            // permanently failed predecessor segment that leaves a gap
            // `reorder` will never fill — exactly the case the warning below
            // already accounts for, so it is not waited on here.
            if scheduler_done && decode_tasks.is_empty() {
                break;
            }
        }

        scheduler_handle.await.map_err(|e| DownloadError::SinkError(format!("scheduler task panicked: {e}")))??;

        if !self.failed.is_empty() {
            log::warn!("{} segment(s) permanently failed; sink holds a partial file", self.failed.len());
        }

        Ok(())
    }

    /// Pulls ready segments off `pending` into the decrypt pool one at a
    /// time while `reorder` is under its `2 * worker_count` backpressure
    /// limit; stops as soon as the limit is hit, leaving the remainder
    /// queued for the next flush to make room.
    fn dispatch_pending_decode(
        &self,
        pending: &mut std::collections::VecDeque<Segment>,
        tasks: &mut tokio::task::JoinSet<Result<(u64, Vec<u8>)>>,
        pool: &Arc<DecryptPool>,
        plan_meta: &PlanMeta,
        reorder: &ReorderBuffer,
    ) {
        while !reorder.is_over_backpressure() {
            let Some(segment) = pending.pop_front() else { break };
            self.spawn_decode(tasks, pool, plan_meta, segment);
        }
    }

    fn spawn_decode(
        &self,
        tasks: &mut tokio::task::JoinSet<Result<(u64, Vec<u8>)>>,
        pool: &Arc<DecryptPool>,
        plan_meta: &PlanMeta,
        segment: Segment,
    ) {
        let Some(ciphertext) = segment.ciphertext.clone() else { return };
        if plan_meta.encryption_mode == EncryptionMode::Plain {
            let index = segment.index;
            let length = segment.plaintext_length as usize;
            tasks.spawn(async move {
                let plaintext: Vec<u8> = ciphertext.into_iter().take(length).collect();
                Ok::<_, DownloadError>((index, plaintext))
            });
            return;
        }
        let pool = pool.clone();
        let job = DecryptJob {
            segment_index: segment.index,
            ciphertext,
            plaintext_length: segment.plaintext_length,
            mapping: segment.mapping,
        };
        tasks.spawn(async move { pool.submit(job).await });
    }

    /// Moves every `pending`/`downloading` segment into `paused`; in-flight
    /// requests observe the pause flag and will resume as retries.
    pub fn pause(&mut self) {
        let _ = self.paused_tx.send(true);
        self.transition(OrchestratorStatus::Paused);
    }

    pub fn resume(&mut self) {
        let _ = self.paused_tx.send(false);
        self.transition(OrchestratorStatus::Running);
    }

    /// Aborts everything in flight, clears timers, aborts the sink, wakes
    /// all waiters. The job becomes terminal — a new `prepare_from_info` is
    /// required to run again.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
    }

    /// Clears the `failed` set and resets those segments to `pending` with
    /// priority. Caller must call `start` again.
    pub fn retry_failed(&mut self) {
        for index in self.failed.drain(..) {
            if let Some(seg) = self.segments.get_mut(index as usize) {
                seg.status = SegmentStatus::Pending;
                seg.error = None;
            }
        }
    }

    /// Wipes persisted download state — scoped to the current key if one
    /// has been prepared, else every key — and resets in-memory state to
    /// `Idle`.
    pub async fn clear(&mut self) -> Result<()> {
        if self.key.is_empty() {
            self.store.clear_all().await?;
        } else {
            self.store.clear_key(&self.key).await?;
        }
        self.manifest = None;
        self.plan_meta = None;
        self.segments.clear();
        self.failed.clear();
        self.total_encrypted = 0;
        self.base_nonce = [0u8; NONCE_LEN];
        self.transition(OrchestratorStatus::Idle);
        Ok(())
    }

    pub fn failed_segment_count(&self) -> usize {
        self.failed.len()
    }
}

impl Segment {
    fn with_ciphertext(mut self, ciphertext: Vec<u8>) -> Self {
        self.ciphertext = Some(ciphertext);
        self
    }
}

fn manifest_data_key(manifest: &Manifest) -> Result<[u8; crate::types::KEY_LEN]> {
    if manifest.encryption_mode == EncryptionMode::Plain {
        return Ok([0u8; crate::types::KEY_LEN]);
    }
    manifest
        .data_key
        .as_slice()
        .try_into()
        .map_err(|_| DownloadError::InvalidManifest("data key is not 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryLimit;
    use crate::scheduler::FetchOutcome;
    use crate::sink::MemorySink;
    use async_trait::async_trait;

    struct EchoFetcher;
    #[async_trait]
    impl SegmentFetcher for EchoFetcher {
        async fn fetch(&self, _ctx: &RequestContext, segment: &Segment, _ttfb: Duration) -> Result<FetchOutcome> {
            let byte = (segment.index % 256) as u8;
            Ok(FetchOutcome { bytes: vec![byte; segment.plaintext_length as usize], overrun_discarded: 0 })
        }
    }

    fn plain_manifest(total_size: u64) -> Manifest {
        Manifest {
            remote_url: "https://example.test/f".into(),
            remote_url_base64: false,
            method: "GET".into(),
            headers: Default::default(),
            total_size,
            encryption_mode: EncryptionMode::Plain,
            file_header_size: 0,
            block_header_size: 0,
            block_data_size: 0,
            data_key: vec![],
            file_name: "out.bin".into(),
        }
    }

    fn test_config() -> Config {
        let mut c = Config::default();
        c.segment_size_mb = 2;
        c.connection_limit = 4;
        c.decrypt_parallelism = 4;
        c.segment_retry_limit = RetryLimit::Bounded(2);
        c
    }

    #[tokio::test]
    async fn full_plain_lifecycle_writes_bytes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ResumeStore::new(dir.path().to_path_buf()));
        let fetcher = Arc::new(EchoFetcher);
        let mut orch = Orchestrator::new(test_config(), store, fetcher);

        let total = 5 * 1024 * 1024u64; // 5MB, 2MB segments -> 3 segments
        let outcome = orch.prepare_from_info(plain_manifest(total), "/f", "sig").await.unwrap();
        assert_eq!(outcome.reused_segments, 0);
        assert_eq!(outcome.total_segments, 3);

        let mut sink = MemorySink::new();
        orch.start(&mut sink, Default::default()).await.unwrap();
        assert_eq!(orch.status(), OrchestratorStatus::Done);
        assert_eq!(orch.failed_segment_count(), 0);
    }

    #[tokio::test]
    async fn resume_after_partial_reuses_previously_downloaded_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ResumeStore::new(dir.path().to_path_buf()));
        let total = 3 * 1024 * 1024u64;
        let mut cfg = test_config();
        cfg.segment_size_mb = 2; // 2 segments: 2MB + 1MB

        let manifest = plain_manifest(total);
        let plan_meta = PlanMeta {
            total_size: total,
            block_data_size: 0,
            block_header_size: 0,
            file_header_size: 0,
            encryption_mode: EncryptionMode::Plain,
            segment_size_bytes: cfg.segment_size_bytes(),
        };
        let key = resume_key("rdmv", "/f", "sig");
        store.ensure_session().await.unwrap();
        store.put_segment(&key, 0, &plan_meta.signature(), &vec![9u8; 2 * 1024 * 1024]).await.unwrap();

        let mut orch = Orchestrator::new(cfg, store, Arc::new(EchoFetcher));
        let outcome = orch.prepare_from_info(manifest, "/f", "sig").await.unwrap();
        assert_eq!(outcome.reused_segments, 1);
        assert_eq!(outcome.total_segments, 2);
    }

    #[tokio::test]
    async fn bounded_permanent_failure_is_surfaced_without_aborting_other_segments() {
        struct AlwaysFail;
        #[async_trait]
        impl SegmentFetcher for AlwaysFail {
            async fn fetch(&self, _ctx: &RequestContext, _segment: &Segment, _ttfb: Duration) -> Result<FetchOutcome> {
                Err(DownloadError::HttpStatus { status: 500, url: "x".into() })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ResumeStore::new(dir.path().to_path_buf()));
        let mut cfg = test_config();
        cfg.segment_retry_limit = RetryLimit::Bounded(0);
        let mut orch = Orchestrator::new(cfg, store, Arc::new(AlwaysFail));

        orch.prepare_from_info(plain_manifest(3 * 1024 * 1024), "/f", "sig").await.unwrap();
        let mut sink = MemorySink::new();
        let result = orch.start(&mut sink, Default::default()).await;
        assert!(result.is_ok(), "permanent segment failures do not abort the whole job");
        assert!(orch.failed_segment_count() > 0);
    }

    #[test]
    fn status_lines_match_exact_vocabulary() {
        assert_eq!(OrchestratorStatus::Idle.status_line(), "准备就绪");
        assert_eq!(OrchestratorStatus::Running.status_line(), "开始下载");
        assert_eq!(OrchestratorStatus::Done.status_line(), "下载完成");
        assert_eq!(OrchestratorStatus::Cancelled.status_line(), "下载已取消");
        assert_eq!(OrchestratorStatus::Failed("boom".into()).status_line(), "下载失败:boom");
        assert_eq!(OrchestratorStatus::SaveFailed("disk full".into()).status_line(), "解密成功但保存失败:disk full");
    }
}
