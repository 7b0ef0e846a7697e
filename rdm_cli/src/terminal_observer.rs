use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

use rdm_core::progress::{format_bytes, ProgressObserver, ProgressSnapshot};

/// Renders download progress as two indicatif bars: encrypted bytes fetched
/// from the origin, and plaintext bytes decrypted and flushed to the sink —
/// two aggregate scalars rather than one bar per connection.
pub struct TerminalProgressObserver {
    encrypted_bar: Mutex<Option<ProgressBar>>,
    decrypted_bar: Mutex<Option<ProgressBar>>,
}

impl TerminalProgressObserver {
    pub fn new() -> Self {
        Self { encrypted_bar: Mutex::new(None), decrypted_bar: Mutex::new(None) }
    }

    fn ensure_bars(&self, snapshot: &ProgressSnapshot) {
        let mut encrypted = self.encrypted_bar.lock().unwrap();
        let mut decrypted = self.decrypted_bar.lock().unwrap();

        if encrypted.is_none() && snapshot.total_encrypted > 0 {
            let style = ProgressStyle::with_template(
                "fetch  [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec})",
            )
            .unwrap()
            .progress_chars("=>-");
            let pb = ProgressBar::new(snapshot.total_encrypted.max(1));
            pb.set_style(style);
            *encrypted = Some(pb);
        }

        if decrypted.is_none() && snapshot.total_size > 0 {
            let style = ProgressStyle::with_template(
                "decode [{bar:30.green/white}] {bytes}/{total_bytes}",
            )
            .unwrap()
            .progress_chars("=>-");
            let pb = ProgressBar::new(snapshot.total_size.max(1));
            pb.set_style(style);
            *decrypted = Some(pb);
        }
    }

    fn update_bars(&self, snapshot: &ProgressSnapshot) {
        if let Some(pb) = self.encrypted_bar.lock().unwrap().as_ref() {
            pb.set_position(snapshot.downloaded_encrypted);
        }
        if let Some(pb) = self.decrypted_bar.lock().unwrap().as_ref() {
            pb.set_position(snapshot.decrypted_bytes);
        }
    }
}

impl Default for TerminalProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressObserver for TerminalProgressObserver {
    async fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.ensure_bars(snapshot);
        self.update_bars(snapshot);
    }

    async fn on_complete(&self, snapshot: &ProgressSnapshot) {
        self.ensure_bars(snapshot);
        self.update_bars(snapshot);
        let speed = format_bytes(snapshot.speed_bytes_per_sec as u64);
        if let Some(pb) = self.encrypted_bar.lock().unwrap().take() {
            pb.finish_with_message(format!("fetched at {speed}/s"));
        }
        if let Some(pb) = self.decrypted_bar.lock().unwrap().take() {
            pb.finish_with_message("decoded");
        }
    }

    async fn on_error(&self, error: &str) {
        if let Some(pb) = self.encrypted_bar.lock().unwrap().take() {
            pb.abandon_with_message(format!("failed: {error}"));
        }
        if let Some(pb) = self.decrypted_bar.lock().unwrap().take() {
            pb.abandon_with_message(format!("failed: {error}"));
        }
    }
}
