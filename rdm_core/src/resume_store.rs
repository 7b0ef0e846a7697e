//! Key/value persistence for the manifest cache, per-segment ciphertext
//! blobs, and opaque sink handles. Maps what would be IndexedDB tables in
//! a browser onto a plain on-disk directory tree, using the same
//! async-fs idiom as the rest of the crate (`tokio::fs::create_dir_all` +
//! `tokio::fs::File`).
//!
//! Layout under `root`:
//!   settings.json                         — global, not per-key
//!   .session_marker                       — session-isolation marker
//!   keys/<key>/info_cache.json
//!   keys/<key>/writer_handle.json
//!   keys/<key>/segments/<index>.bin       — raw ciphertext
//!   keys/<key>/segments/<index>.meta.json

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{DownloadError, Result};
use crate::types::{Manifest, PlanMeta};

const TTL_SECS: u64 = 24 * 60 * 60;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Builds the resume-store key `"<prefix>::<percent-encoded path>::<percent-encoded sign>"`.
pub fn resume_key(prefix: &str, path: &str, sign: &str) -> String {
    format!("{}::{}::{}", prefix, percent_encode(path), percent_encode(sign))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InfoCacheRecord {
    timestamp: u64,
    data: Manifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentMeta {
    index: u64,
    signature: String,
    length: u64,
    timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WriterHandleRecord {
    handle: String,
    timestamp: u64,
}

/// The outcome of restoring one segment from the store during
/// `prepare_from_info`.
pub struct RestoredSegment {
    pub index: u64,
    pub ciphertext: Vec<u8>,
}

pub struct ResumeStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl ResumeStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root, lock: Mutex::new(()) }
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    fn session_marker_path(&self) -> PathBuf {
        self.root.join(".session_marker")
    }

    fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.keys_dir().join(percent_encode(key))
    }

    fn segments_dir(&self, key: &str) -> PathBuf {
        self.key_dir(key).join("segments")
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(DownloadError::Disk)?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| DownloadError::SinkError(format!("serialize failed: {e}")))?;
        tokio::fs::write(path, bytes).await.map_err(DownloadError::Disk)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| DownloadError::SinkError(format!("corrupt record at {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::Disk(e)),
        }
    }

    /// On first access in a session, clears all per-key tables if no
    /// session marker is present, then sets the marker. `settings` survives
    /// across sessions regardless.
    pub async fn ensure_session(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let marker = self.session_marker_path();
        if tokio::fs::metadata(&marker).await.is_err() {
            let _ = tokio::fs::remove_dir_all(self.keys_dir()).await;
            tokio::fs::create_dir_all(&self.root).await.map_err(DownloadError::Disk)?;
            tokio::fs::write(&marker, b"1").await.map_err(DownloadError::Disk)?;
        }
        Ok(())
    }

    // -- settings (global) ---------------------------------------------

    pub async fn load_settings(&self) -> Result<Config> {
        let _guard = self.lock.lock().await;
        Ok(Self::read_json::<Config>(&self.settings_path()).await?.unwrap_or_default())
    }

    pub async fn save_settings(&self, config: &Config) -> Result<()> {
        let _guard = self.lock.lock().await;
        Self::write_json(&self.settings_path(), config).await
    }

    // -- infoCache --------------------------------------------------------

    pub async fn get_manifest(&self, key: &str) -> Result<Option<Manifest>> {
        let _guard = self.lock.lock().await;
        let path = self.key_dir(key).join("info_cache.json");
        let record: Option<InfoCacheRecord> = Self::read_json(&path).await?;
        match record {
            Some(r) if now_secs().saturating_sub(r.timestamp) < TTL_SECS => Ok(Some(r.data)),
            Some(_) => {
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn put_manifest(&self, key: &str, manifest: &Manifest) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.key_dir(key).join("info_cache.json");
        let record = InfoCacheRecord { timestamp: now_secs(), data: manifest.clone() };
        Self::write_json(&path, &record).await
    }

    // -- segments -----------------------------------------------------

    pub async fn put_segment(&self, key: &str, index: u64, signature: &str, data: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.segments_dir(key);
        tokio::fs::create_dir_all(&dir).await.map_err(DownloadError::Disk)?;
        tokio::fs::write(dir.join(format!("{index}.bin")), data)
            .await
            .map_err(DownloadError::Disk)?;
        let meta = SegmentMeta {
            index,
            signature: signature.to_string(),
            length: data.len() as u64,
            timestamp: now_secs(),
        };
        Self::write_json(&dir.join(format!("{index}.meta.json")), &meta).await
    }

    /// Returns the stored ciphertext for `index` if present, unexpired, and
    /// signed with `signature`. A signature mismatch means the plan shape
    /// changed since the blob was written, so it must not be reused.
    pub async fn get_segment(&self, key: &str, index: u64, signature: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        let dir = self.segments_dir(key);
        let meta: Option<SegmentMeta> = Self::read_json(&dir.join(format!("{index}.meta.json"))).await?;
        let Some(meta) = meta else { return Ok(None) };
        if meta.signature != signature || now_secs().saturating_sub(meta.timestamp) >= TTL_SECS {
            return Ok(None);
        }
        match tokio::fs::read(dir.join(format!("{index}.bin"))).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::Disk(e)),
        }
    }

    /// Restores every segment for `key` matching `signature`, returning the
    /// restored ciphertext blobs. Callers apply these to their freshly
    /// planned `Segment` list and mark the matching indices `Done`.
    pub async fn restore(&self, key: &str, signature: &str) -> Result<Vec<RestoredSegment>> {
        let _guard = self.lock.lock().await;
        let dir = self.segments_dir(key);
        let metas = self.list_segment_metas_unlocked(&dir).await?;
        let mut out = Vec::new();
        for meta in metas {
            if meta.signature != signature || now_secs().saturating_sub(meta.timestamp) >= TTL_SECS {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(dir.join(format!("{}.bin", meta.index))).await {
                out.push(RestoredSegment { index: meta.index, ciphertext: bytes });
            }
        }
        Ok(out)
    }

    async fn list_segment_metas_unlocked(&self, dir: &Path) -> Result<Vec<SegmentMeta>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(DownloadError::Disk(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(DownloadError::Disk)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(meta) = Self::read_json::<SegmentMeta>(&path).await? {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }

    // -- writerHandles --------------------------------------------------

    pub async fn get_writer_handle(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let path = self.key_dir(key).join("writer_handle.json");
        let record: Option<WriterHandleRecord> = Self::read_json(&path).await?;
        Ok(record
            .filter(|r| now_secs().saturating_sub(r.timestamp) < TTL_SECS)
            .map(|r| r.handle))
    }

    pub async fn put_writer_handle(&self, key: &str, handle: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.key_dir(key).join("writer_handle.json");
        let record = WriterHandleRecord { handle: handle.to_string(), timestamp: now_secs() };
        Self::write_json(&path, &record).await
    }

    // -- completion sweep / GC -------------------------------------------

    /// Groups segment records by signature; if any group forms a complete
    /// covering set for its own plan shape, deletes all segments and the
    /// writer handle for `key`.
    pub async fn completion_sweep(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let dir = self.segments_dir(key);
        let metas = self.list_segment_metas_unlocked(&dir).await?;
        if metas.is_empty() {
            return Ok(());
        }

        use std::collections::HashMap;
        let mut groups: HashMap<String, Vec<&SegmentMeta>> = HashMap::new();
        for m in &metas {
            groups.entry(m.signature.clone()).or_default().push(m);
        }

        for (signature, members) in groups {
            let Some(total_size) = signature.split(':').next().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            let plain = signature.contains(":plain:");
            let max_index = members.iter().map(|m| m.index).max().unwrap_or(0);
            let have_all_indices = (0..=max_index).all(|i| members.iter().any(|m| m.index == i));
            let total_len: u64 = members.iter().map(|m| m.length).sum();

            // In plain mode underlying length equals plaintext length, so the
            // sum can be compared directly against `total_size`. In crypt
            // mode the signature only carries the plaintext `total_size`, not
            // the inflated ciphertext size, so completeness falls back to
            // "every index up to the observed max is present".
            let complete = have_all_indices
                && total_len > 0
                && (!plain || total_len >= total_size);

            if complete {
                let _ = tokio::fs::remove_dir_all(self.segments_dir(key)).await;
                let _ = tokio::fs::remove_file(self.key_dir(key).join("writer_handle.json")).await;
            }
        }
        Ok(())
    }

    // -- clear ------------------------------------------------------------

    /// Wipes persisted download state for one key (segments, info cache,
    /// writer handle). `settings.json` is untouched — it is explicitly a
    /// global table, not part of a per-key download's state.
    pub async fn clear_key(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let _ = tokio::fs::remove_dir_all(self.key_dir(key)).await;
        Ok(())
    }

    /// Wipes persisted download state for every key.
    pub async fn clear_all(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let _ = tokio::fs::remove_dir_all(self.keys_dir()).await;
        Ok(())
    }
}

/// Computes the plan signature the resume store compares against
/// (convenience re-export of `PlanMeta::signature` for call sites that only
/// have the pieces, not the struct).
pub fn plan_signature(meta: &PlanMeta) -> String {
    meta.signature()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EncryptionMode;

    fn meta() -> PlanMeta {
        PlanMeta {
            total_size: 100,
            block_data_size: 0,
            block_header_size: 0,
            file_header_size: 0,
            encryption_mode: EncryptionMode::Plain,
            segment_size_bytes: 50,
        }
    }

    #[test]
    fn resume_key_percent_encodes_components() {
        let key = resume_key("rdmv", "/a b/c", "sig nature");
        assert_eq!(key, "rdmv::%2Fa%20b%2Fc::sig%20nature");
    }

    #[tokio::test]
    async fn segment_round_trips_and_respects_signature() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        let sig = meta().signature();

        store.put_segment("k1", 0, &sig, b"hello").await.unwrap();
        let got = store.get_segment("k1", 0, &sig, ).await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));

        // A different signature must not see the stored blob.
        let got_wrong_sig = store.get_segment("k1", 0, "different-signature").await.unwrap();
        assert_eq!(got_wrong_sig, None);
    }

    #[tokio::test]
    async fn restore_after_partial_download_scenario_4() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        let sig = meta().signature();

        for i in 0..3u64 {
            store.put_segment("k1", i, &sig, &vec![i as u8; 10]).await.unwrap();
        }
        let restored = store.restore("k1", &sig).await.unwrap();
        assert_eq!(restored.len(), 3);
    }

    #[tokio::test]
    async fn manifest_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        let manifest = Manifest {
            remote_url: "https://example.com/f".into(),
            remote_url_base64: false,
            method: "GET".into(),
            headers: Default::default(),
            total_size: 100,
            encryption_mode: EncryptionMode::Plain,
            file_header_size: 0,
            block_header_size: 0,
            block_data_size: 0,
            data_key: vec![],
            file_name: "f.bin".into(),
        };
        store.put_manifest("k1", &manifest).await.unwrap();
        let got = store.get_manifest("k1").await.unwrap().unwrap();
        assert_eq!(got.total_size, 100);
    }

    #[tokio::test]
    async fn session_isolation_clears_keys_but_not_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.connection_limit = 12;
        store.save_settings(&cfg).await.unwrap();
        store.put_segment("k1", 0, "sig", b"data").await.unwrap();

        store.ensure_session().await.unwrap();
        // Marker now exists: a second call must NOT clear again.
        assert!(store.get_segment("k1", 0, "sig").await.unwrap().is_some());

        let loaded = store.load_settings().await.unwrap();
        assert_eq!(loaded.connection_limit, 12);
    }

    #[tokio::test]
    async fn completion_sweep_reclaims_finished_plain_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        let m = meta(); // total_size=100, segment_size=50 -> 2 segments of 50
        let sig = m.signature();
        store.put_segment("k1", 0, &sig, &vec![0u8; 50]).await.unwrap();
        store.put_segment("k1", 1, &sig, &vec![0u8; 50]).await.unwrap();
        store.put_writer_handle("k1", "handle-1").await.unwrap();

        store.completion_sweep("k1").await.unwrap();

        assert!(store.get_segment("k1", 0, &sig).await.unwrap().is_none());
        assert!(store.get_writer_handle("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_sweep_leaves_incomplete_downloads_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        let m = meta();
        let sig = m.signature();
        store.put_segment("k1", 0, &sig, &vec![0u8; 50]).await.unwrap();

        store.completion_sweep("k1").await.unwrap();

        assert!(store.get_segment("k1", 0, &sig).await.unwrap().is_some());
    }
}
