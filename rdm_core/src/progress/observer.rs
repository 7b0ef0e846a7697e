use async_trait::async_trait;

use super::snapshot::ProgressSnapshot;

/// Anything that wants to observe download progress, fanned out to zero
/// or more listeners (e.g. the CLI's terminal renderer).
///
/// - `on_progress` fires for every aggregated event.
/// - `on_complete` fires once when the channel closes without an error.
/// - `on_error` fires once on the terminal error, then nothing else fires.
#[async_trait]
pub trait ProgressObserver: Send + Sync + 'static {
    async fn on_progress(&self, snapshot: &ProgressSnapshot);
    async fn on_complete(&self, snapshot: &ProgressSnapshot);
    async fn on_error(&self, error: &str);
}
