//! Per-segment retry classification and delay computation. A
//! classification-aware policy with an optionally unbounded limit, as
//! opposed to a single fixed retry count applied uniformly to every
//! failure.

use std::time::Duration;

use crate::config::RetryLimit;
use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    TtfbTimeout,
    RateLimited,
    Other,
}

pub fn classify(err: &DownloadError) -> ErrorClass {
    match err {
        DownloadError::TtfbTimeout => ErrorClass::TtfbTimeout,
        DownloadError::RateLimited => ErrorClass::RateLimited,
        _ => ErrorClass::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Push to the head of `pending` right away; the failure does not
    /// consume retry budget.
    RequeueImmediately,
    /// Schedule a timer; on fire, requeue.
    RequeueAfter(Duration),
    /// Retry budget exhausted — mark the segment `failed`.
    Failed,
}

/// Stateless policy: all mutable state (the per-segment retry counter)
/// lives on the caller's `Segment`.
pub struct RetryPolicy {
    limit: RetryLimit,
}

impl RetryPolicy {
    pub fn new(limit: RetryLimit) -> Self {
        Self { limit }
    }

    /// Classifies `err` and decides what to do next. `retries` is the
    /// segment's running counter; on any non-ttfb classification it is
    /// incremented in place before the limit check.
    pub fn decide(&self, retries: &mut u32, err: &DownloadError) -> RetryDecision {
        match classify(err) {
            ErrorClass::TtfbTimeout => RetryDecision::RequeueImmediately,
            class => {
                *retries += 1;
                if self.limit.exceeded(*retries) {
                    return RetryDecision::Failed;
                }
                match class {
                    ErrorClass::RateLimited => RetryDecision::RequeueAfter(rate_limited_delay(*retries)),
                    ErrorClass::Other => RetryDecision::RequeueAfter(Duration::from_secs(20)),
                    ErrorClass::TtfbTimeout => unreachable!("handled above"),
                }
            }
        }
    }
}

/// `retries <= 9`: silent 1s retry. Beyond that: `min(10s, 1s * 2^(retries-9))`.
fn rate_limited_delay(retries: u32) -> Duration {
    if retries <= 9 {
        return Duration::from_secs(1);
    }
    let exponent = (retries - 9).min(10); // bounds 2^exponent well under u64
    let secs = 1u64.saturating_mul(1u64 << exponent);
    Duration::from_secs(secs.min(10))
}
