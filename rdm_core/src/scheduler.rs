//! Connection-pooled segment dispatch with retry/backoff.
//! The dispatch loop is a single async task driving a `JoinSet` of in-flight
//! fetches plus a `JoinSet` of retry timers, applying a classification-aware
//! retry policy rather than a single fixed retry count applied uniformly to
//! every failure.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RetryLimit;
use crate::error::{DownloadError, Result};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::types::{RequestContext, Segment, SegmentStatus};

/// Minimum gap enforced between successive dispatches.
pub const MIN_DISPATCH_INTERVAL: Duration = Duration::from_millis(300);

/// The bytes fetched for a segment, plus any trailing bytes discarded
/// because the origin ignored the Range header in plain mode.
pub struct FetchOutcome {
    pub bytes: Vec<u8>,
    pub overrun_discarded: u64,
}

#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(
        &self,
        ctx: &RequestContext,
        segment: &Segment,
        ttfb_timeout: Duration,
    ) -> Result<FetchOutcome>;
}

pub enum SegmentOutcome {
    Done { index: u64, ciphertext: Vec<u8>, overrun_discarded: u64 },
    Failed { index: u64, error: DownloadError },
}

pub struct Scheduler<F: SegmentFetcher> {
    fetcher: Arc<F>,
    connection_limit: usize,
    ttfb_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl<F: SegmentFetcher + 'static> Scheduler<F> {
    pub fn new(
        fetcher: Arc<F>,
        connection_limit: usize,
        ttfb_timeout: Duration,
        retry_limit: RetryLimit,
    ) -> Self {
        Self { fetcher, connection_limit, ttfb_timeout, retry_policy: RetryPolicy::new(retry_limit) }
    }

    /// Drives every segment in `segments` to `Done` or `Failed`, reporting
    /// each settlement on `outcomes`. Returns once `pending`/`inFlight`/
    /// `retryTimers` are all empty, or propagates `Cancelled`.
    pub async fn run(
        &self,
        ctx: RequestContext,
        segments: &mut [Segment],
        outcomes: mpsc::Sender<SegmentOutcome>,
        cancel: CancellationToken,
        mut paused: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut pending: VecDeque<u64> = segments.iter().map(|s| s.index).collect();
        let mut in_flight: JoinSet<(u64, Result<FetchOutcome>)> = JoinSet::new();
        let mut retry_timers: JoinSet<u64> = JoinSet::new();
        let mut failed: HashSet<u64> = HashSet::new();
        let mut last_dispatch: Option<tokio::time::Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            if *paused.borrow() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = paused.changed() => {}
                }
                continue;
            }

            let must_await_in_flight = in_flight.len() >= self.connection_limit
                || (pending.is_empty() && !in_flight.is_empty());

            if must_await_in_flight {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    Some(joined) = in_flight.join_next() => {
                        self.settle(joined, segments, &mut pending, &mut retry_timers, &mut failed, &outcomes).await?;
                    }
                }
                continue;
            }

            if pending.is_empty() && in_flight.is_empty() && retry_timers.is_empty() {
                return Ok(());
            }

            if pending.is_empty() && !retry_timers.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    Some(Ok(index)) = retry_timers.join_next() => {
                        segments[index as usize].status = SegmentStatus::Pending;
                        pending.push_back(index);
                    }
                }
                continue;
            }

            let Some(index) = pending.pop_front() else { continue };

            if let Some(last) = last_dispatch {
                let wait = MIN_DISPATCH_INTERVAL.saturating_sub(last.elapsed());
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }

            segments[index as usize].status = SegmentStatus::Downloading;
            let seg = segments[index as usize].clone();
            let fetcher = self.fetcher.clone();
            let ctx = ctx.clone();
            let ttfb = self.ttfb_timeout;
            in_flight.spawn(async move { (index, fetcher.fetch(&ctx, &seg, ttfb).await) });
            last_dispatch = Some(tokio::time::Instant::now());
        }
    }

    async fn settle(
        &self,
        joined: std::result::Result<(u64, Result<FetchOutcome>), tokio::task::JoinError>,
        segments: &mut [Segment],
        pending: &mut VecDeque<u64>,
        retry_timers: &mut JoinSet<u64>,
        failed: &mut HashSet<u64>,
        outcomes: &mpsc::Sender<SegmentOutcome>,
    ) -> Result<()> {
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(e) => return Err(DownloadError::SinkError(format!("fetch task panicked: {e}"))),
        };

        match result {
            Ok(outcome) => {
                failed.remove(&index);
                segments[index as usize].status = SegmentStatus::Done;
                let _ = outcomes
                    .send(SegmentOutcome::Done {
                        index,
                        ciphertext: outcome.bytes,
                        overrun_discarded: outcome.overrun_discarded,
                    })
                    .await;
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let seg = &mut segments[index as usize];
                match self.retry_policy.decide(&mut seg.retries, &e) {
                    RetryDecision::RequeueImmediately => {
                        seg.status = SegmentStatus::Pending;
                        pending.push_front(index);
                    }
                    RetryDecision::RequeueAfter(delay) => {
                        seg.status = SegmentStatus::WaitingRetry;
                        retry_timers.spawn(async move {
                            tokio::time::sleep(delay).await;
                            index
                        });
                    }
                    RetryDecision::Failed => {
                        seg.status = SegmentStatus::Failed;
                        log::warn!("segment {index}: retry budget exhausted, last error: {e}");
                        let exhausted = DownloadError::MaxRetryExceeded { segment: index };
                        seg.error = Some(exhausted.to_string());
                        failed.insert(index);
                        let _ = outcomes.send(SegmentOutcome::Failed { index, error: exhausted }).await;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Production `SegmentFetcher` backed by `reqwest` Range requests.
pub struct HttpSegmentFetcher {
    client: reqwest::Client,
}

impl HttpSegmentFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SegmentFetcher for HttpSegmentFetcher {
    async fn fetch(
        &self,
        ctx: &RequestContext,
        segment: &Segment,
        ttfb_timeout: Duration,
    ) -> Result<FetchOutcome> {
        let range_end = segment.mapping.underlying_offset + segment.mapping.underlying_limit - 1;
        let range_value = format!("bytes={}-{}", segment.mapping.underlying_offset, range_end);

        let method: reqwest::Method = ctx.method.parse().unwrap_or(reqwest::Method::GET);
        let mut builder = self.client.request(method, &ctx.url);
        for (name, value) in &ctx.headers {
            builder = builder.header(name, value);
        }
        builder = builder.header(reqwest::header::RANGE, range_value);
        let request = builder.build().map_err(DownloadError::Network)?;

        let response = tokio::time::timeout(ttfb_timeout, self.client.execute(request))
            .await
            .map_err(|_| DownloadError::TtfbTimeout)?
            .map_err(DownloadError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DownloadError::RateLimited);
        }
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::HttpStatus { status: status.as_u16(), url: ctx.url.clone() });
        }

        let bytes = response.bytes().await.map_err(DownloadError::Network)?.to_vec();
        Ok(cap_to_expected(bytes, segment.mapping.underlying_limit))
    }
}

/// Caps an origin response to the requested byte count, reporting whatever
/// was discarded so the caller can roll back its speed/progress counters
/// instead of ever counting bytes that didn't belong to this segment.
fn cap_to_expected(mut bytes: Vec<u8>, expected: u64) -> FetchOutcome {
    let len = bytes.len() as u64;
    if len > expected {
        bytes.truncate(expected as usize);
        return FetchOutcome { bytes, overrun_discarded: len - expected };
    }
    FetchOutcome { bytes, overrun_discarded: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RangeMapping;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    fn ctx() -> RequestContext {
        RequestContext { url: "https://example.test/f".into(), method: "GET".into(), headers: Default::default() }
    }

    fn segment(index: u64) -> Segment {
        Segment::new(
            index,
            index * 10,
            10,
            RangeMapping { underlying_offset: index * 10, underlying_limit: 10, discard: 0, starting_block_index: 0 },
        )
    }

    struct AlwaysOk;
    #[async_trait]
    impl SegmentFetcher for AlwaysOk {
        async fn fetch(&self, _ctx: &RequestContext, segment: &Segment, _ttfb: Duration) -> Result<FetchOutcome> {
            Ok(FetchOutcome { bytes: vec![segment.index as u8; 10], overrun_discarded: 0 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_all_segments_and_reports_done() {
        let mut segments: Vec<Segment> = (0..5).map(segment).collect();
        let (tx, mut rx) = mpsc::channel(16);
        let scheduler = Scheduler::new(Arc::new(AlwaysOk), 2, Duration::from_secs(1), RetryLimit::Bounded(3));
        let (_pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        scheduler.run(ctx(), &mut segments, tx, cancel, pause_rx).await.unwrap();

        let mut seen = HashSet::new();
        while let Some(outcome) = rx.recv().await {
            if let SegmentOutcome::Done { index, .. } = outcome {
                seen.insert(index);
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(segments.iter().all(|s| s.status == SegmentStatus::Done));
    }

    struct FailNTimes {
        remaining: AtomicU64,
        kind: StdMutex<fn() -> DownloadError>,
    }

    #[async_trait]
    impl SegmentFetcher for FailNTimes {
        async fn fetch(&self, _ctx: &RequestContext, segment: &Segment, _ttfb: Duration) -> Result<FetchOutcome> {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                let make = *self.kind.lock().unwrap();
                return Err(make());
            }
            Ok(FetchOutcome { bytes: vec![segment.index as u8; 10], overrun_discarded: 0 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ttfb_timeout_retries_without_exhausting_bounded_budget() {
        let mut segments = vec![segment(0)];
        let (tx, mut rx) = mpsc::channel(16);
        let fetcher = Arc::new(FailNTimes {
            remaining: AtomicU64::new(2),
            kind: StdMutex::new(|| DownloadError::TtfbTimeout),
        });
        let scheduler = Scheduler::new(fetcher, 2, Duration::from_secs(1), RetryLimit::Bounded(1));
        let (_pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        scheduler.run(ctx(), &mut segments, tx, cancel, pause_rx).await.unwrap();

        assert_eq!(segments[0].status, SegmentStatus::Done);
        assert_eq!(segments[0].retries, 0, "ttfb-timeout must not consume retry budget");
        match rx.recv().await.unwrap() {
            SegmentOutcome::Done { index, .. } => assert_eq!(index, 0),
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_exhaustion_surfaces_failed_without_aborting_job() {
        let mut segments = vec![segment(0), segment(1)];
        let (tx, mut rx) = mpsc::channel(16);
        let fetcher = Arc::new(FailNTimes {
            remaining: AtomicU64::new(1000),
            kind: StdMutex::new(|| DownloadError::SinkError("boom".into())),
        });
        let scheduler = Scheduler::new(fetcher, 2, Duration::from_millis(50), RetryLimit::Bounded(1));
        let (_pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        // segment(1) always fails its fetcher too since the fetcher is shared
        // and stateless per-segment; both should settle as Failed.
        scheduler.run(ctx(), &mut segments, tx, cancel, pause_rx).await.unwrap();

        let mut failed_count = 0;
        while let Some(outcome) = rx.recv().await {
            if let SegmentOutcome::Failed { .. } = outcome {
                failed_count += 1;
            }
        }
        assert_eq!(failed_count, 2);
        assert!(segments.iter().all(|s| s.status == SegmentStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_dispatch_loop() {
        let mut segments: Vec<Segment> = (0..3).map(segment).collect();
        let (tx, _rx) = mpsc::channel(16);
        let scheduler = Scheduler::new(Arc::new(AlwaysOk), 1, Duration::from_secs(1), RetryLimit::Bounded(3));
        let (_pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scheduler.run(ctx(), &mut segments, tx, cancel, pause_rx).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    proptest::proptest! {
        /// An origin that ignores Range and returns extra bytes must never
        /// inflate `downloaded_encrypted` past what was actually requested:
        /// `cap_to_expected` always returns at most `expected` bytes, and the
        /// two numbers always add back up to what the origin sent.
        #[test]
        fn overrun_is_always_capped_and_accounted_for(body_len in 0usize..500, expected in 0u64..300) {
            let body = vec![0u8; body_len];
            let outcome = cap_to_expected(body, expected);
            prop_assert!(outcome.bytes.len() as u64 <= expected);
            prop_assert_eq!(outcome.bytes.len() as u64 + outcome.overrun_discarded, body_len as u64);
        }
    }
}
