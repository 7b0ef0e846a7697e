/// Error taxonomy for the download-and-decrypt pipeline.
///
/// `Crypto` and the precondition variants are fatal and are never
/// retried; `Network`/`HttpStatus`/`TtfbTimeout`/`RateLimited` are
/// handled by the retry policy; `Cancelled` is cooperative, not a
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("unexpected status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("time-to-first-byte timeout")]
    TtfbTimeout,

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("sink error: {0}")]
    SinkError(String),

    #[error("decrypted but not saved: {0}")]
    SinkSaveFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("segment {segment} exceeded retry budget")]
    MaxRetryExceeded { segment: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DownloadError {
    /// `true` for errors that are fatal to the whole job and must not be
    /// retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DownloadError::Crypto(_)
                | DownloadError::Precondition(_)
                | DownloadError::InvalidManifest(_)
                | DownloadError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
