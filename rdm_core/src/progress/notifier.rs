use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::observer::ProgressObserver;
use super::snapshot::ProgressSnapshot;

/// How far back the rolling download-speed sample looks.
const ROLLING_WINDOW: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent {
    Init { total_encrypted: u64, total_size: u64 },
    EncryptedDelta(u64),
    DecryptedDelta(u64),
    /// Rollback of a discarded over-fetch: subtracted from
    /// `downloaded_encrypted` without touching the speed sample history.
    EncryptedRollback(u64),
}

/// Consumes `Result<ProgressEvent, String>` from the orchestrator,
/// aggregates into `ProgressSnapshot`s, and fans out to all registered
/// observers.
pub struct ProgressNotifier {
    observers: Vec<Box<dyn ProgressObserver>>,
    downloaded_encrypted: u64,
    total_encrypted: u64,
    decrypted_bytes: u64,
    total_size: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            downloaded_encrypted: 0,
            total_encrypted: 0,
            decrypted_bytes: 0,
            total_size: 0,
            samples: VecDeque::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<Result<ProgressEvent, String>>) {
        while let Some(msg) = events.recv().await {
            match msg {
                Ok(event) => {
                    let snapshot = self.handle_event(event);
                    for observer in &self.observers {
                        observer.on_progress(&snapshot).await;
                    }
                }
                Err(error) => {
                    for observer in &self.observers {
                        observer.on_error(&error).await;
                    }
                    return;
                }
            }
        }
        self.finish().await;
    }

    fn handle_event(&mut self, event: ProgressEvent) -> ProgressSnapshot {
        match event {
            ProgressEvent::Init { total_encrypted, total_size } => {
                self.total_encrypted = total_encrypted;
                self.total_size = total_size;
            }
            ProgressEvent::EncryptedDelta(delta) => {
                self.downloaded_encrypted += delta;
                self.record_sample();
            }
            ProgressEvent::EncryptedRollback(amount) => {
                self.downloaded_encrypted = self.downloaded_encrypted.saturating_sub(amount);
            }
            ProgressEvent::DecryptedDelta(delta) => {
                self.decrypted_bytes += delta;
            }
        }
        self.build_snapshot(false)
    }

    fn record_sample(&mut self) {
        let now = Instant::now();
        self.samples.push_back((now, self.downloaded_encrypted));
        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > ROLLING_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn speed(&self) -> f64 {
        let (Some(&(oldest_ts, oldest_bytes)), Some(&(newest_ts, newest_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = newest_ts.duration_since(oldest_ts).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (newest_bytes.saturating_sub(oldest_bytes)) as f64 / elapsed
    }

    fn build_snapshot(&self, done: bool) -> ProgressSnapshot {
        ProgressSnapshot {
            downloaded_encrypted: self.downloaded_encrypted,
            total_encrypted: self.total_encrypted,
            decrypted_bytes: self.decrypted_bytes,
            total_size: self.total_size,
            speed_bytes_per_sec: self.speed(),
            done,
        }
    }

    async fn finish(self) {
        let snapshot = self.build_snapshot(true);
        for observer in &self.observers {
            observer.on_complete(&snapshot).await;
        }
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}
