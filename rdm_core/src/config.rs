use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};

/// Either a finite per-segment retry cap or unbounded retries.
/// `segmentRetryLimit` accepts an integer or the literal token `"inf"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryLimit {
    Bounded(u32),
    Unbounded,
}

impl RetryLimit {
    pub fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("inf") {
            return Ok(RetryLimit::Unbounded);
        }
        s.parse::<u32>()
            .map(RetryLimit::Bounded)
            .map_err(|_| DownloadError::InvalidConfig(format!("invalid segmentRetryLimit: {s}")))
    }

    pub fn exceeded(&self, attempts: u32) -> bool {
        match self {
            RetryLimit::Bounded(max) => attempts > *max,
            RetryLimit::Unbounded => false,
        }
    }
}

/// User-tunable scalars, persisted globally in the resume store's
/// settings table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection_limit: usize,
    pub segment_retry_limit: RetryLimit,
    pub decrypt_parallelism: usize,
    pub segment_size_mb: u32,
    pub ttfb_timeout_secs: u64,
    pub disable_fs: bool,
    pub disable_opfs: bool,
    pub disable_stream: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_limit: 6,
            segment_retry_limit: RetryLimit::Bounded(5),
            decrypt_parallelism: 6,
            segment_size_mb: 32,
            ttfb_timeout_secs: 20,
            disable_fs: false,
            disable_opfs: false,
            disable_stream: false,
        }
    }
}

impl Config {
    /// Validates range constraints, returning `DownloadError::InvalidConfig`
    /// rather than silently clamping.
    pub fn validate(&self) -> Result<()> {
        check_range("connectionLimit", self.connection_limit, 1, 32)?;
        check_range("decryptParallelism", self.decrypt_parallelism, 1, 32)?;
        check_range("segmentSizeMb", self.segment_size_mb as usize, 2, 48)?;
        check_range("ttfbTimeoutSeconds", self.ttfb_timeout_secs as usize, 5, 120)?;
        Ok(())
    }

    pub fn segment_size_bytes(&self) -> u64 {
        self.segment_size_mb as u64 * 1024 * 1024
    }
}

fn check_range(name: &str, value: usize, min: usize, max: usize) -> Result<()> {
    if value < min || value > max {
        return Err(DownloadError::InvalidConfig(format!(
            "{name}={value} out of range [{min}, {max}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_connection_limit_rejected() {
        let mut c = Config::default();
        c.connection_limit = 0;
        assert!(c.validate().is_err());
        c.connection_limit = 33;
        assert!(c.validate().is_err());
    }

    #[test]
    fn retry_limit_parses_inf_and_int() {
        assert_eq!(RetryLimit::parse("inf").unwrap(), RetryLimit::Unbounded);
        assert_eq!(RetryLimit::parse("INF").unwrap(), RetryLimit::Unbounded);
        assert_eq!(RetryLimit::parse("7").unwrap(), RetryLimit::Bounded(7));
        assert!(RetryLimit::parse("nope").is_err());
    }

    #[test]
    fn retry_limit_exceeded_semantics() {
        let bounded = RetryLimit::Bounded(3);
        assert!(!bounded.exceeded(3));
        assert!(bounded.exceeded(4));
        assert!(!RetryLimit::Unbounded.exceeded(1_000_000));
    }
}
