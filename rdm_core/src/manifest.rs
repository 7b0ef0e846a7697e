//! Fetches and validates the signed-URL manifest. Bot-challenge solving
//! (ALTCHA/Turnstile/PoW) is explicitly out of scope; callers thread
//! already-obtained tokens through as opaque extra query parameters or
//! headers.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{DownloadError, Result};
use crate::types::{EncryptionMode, Manifest};

#[derive(Debug, Clone, Default)]
pub struct ManifestRequest {
    pub url: String,
    /// Caller-supplied challenge-response params (e.g. an ALTCHA solution);
    /// opaque to this client.
    pub extra_query: HashMap<String, String>,
    pub extra_headers: HashMap<String, String>,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Debug, Deserialize)]
struct ManifestEnvelope {
    code: i32,
    #[serde(default)]
    message: Option<String>,
    url: String,
    #[serde(default)]
    url_base64: bool,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    total_size: u64,
    encryption_mode: EncryptionMode,
    #[serde(default)]
    file_header_size: u32,
    #[serde(default)]
    block_header_size: u32,
    #[serde(default)]
    block_data_size: u32,
    /// Base64-encoded 32-byte key, present only in crypt mode.
    #[serde(default)]
    data_key: Option<String>,
    file_name: String,
}

pub struct ManifestClient {
    client: reqwest::Client,
}

impl ManifestClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetches, decodes, and validates a manifest. HTTP 429 and the
    /// challenge-required range 461-463 surface without retry — re-solving a
    /// challenge is a caller concern.
    pub async fn fetch(&self, request: &ManifestRequest) -> Result<Manifest> {
        let mut builder = self.client.get(&request.url).query(&request.extra_query);
        for (name, value) in &request.extra_headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await.map_err(DownloadError::Network)?;

        let status = response.status();
        let status_code = status.as_u16();
        if status_code == 429 {
            return Err(DownloadError::RateLimited);
        }
        if matches!(status_code, 461 | 462 | 463) {
            return Err(DownloadError::Precondition(format!(
                "manifest endpoint requires a challenge response (HTTP {status_code})"
            )));
        }
        if !status.is_success() {
            return Err(DownloadError::HttpStatus { status: status_code, url: request.url.clone() });
        }

        let envelope: ManifestEnvelope = response.json().await.map_err(DownloadError::Network)?;
        if envelope.code != 200 {
            return Err(DownloadError::Precondition(
                envelope
                    .message
                    .unwrap_or_else(|| format!("manifest endpoint returned code {}", envelope.code)),
            ));
        }

        let data_key = match envelope.data_key {
            Some(encoded) => base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &encoded)
                .map_err(|e| DownloadError::InvalidManifest(format!("bad data_key: {e}")))?,
            None => Vec::new(),
        };

        let manifest = Manifest {
            remote_url: envelope.url,
            remote_url_base64: envelope.url_base64,
            method: envelope.method,
            headers: envelope.headers,
            total_size: envelope.total_size,
            encryption_mode: envelope.encryption_mode,
            file_header_size: envelope.file_header_size,
            block_header_size: envelope.block_header_size,
            block_data_size: envelope.block_data_size,
            data_key,
            file_name: envelope.file_name,
        };
        manifest.validate()?;
        log::info!("manifest fetched: {} bytes, mode={:?}", manifest.total_size, manifest.encryption_mode);
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plain_body() -> serde_json::Value {
        serde_json::json!({
            "code": 200,
            "url": "https://origin.test/blob",
            "method": "GET",
            "total_size": 1024,
            "encryption_mode": "plain",
            "file_name": "movie.mp4"
        })
    }

    #[tokio::test]
    async fn fetch_success_builds_validated_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(plain_body()))
            .mount(&server)
            .await;

        let client = ManifestClient::new(reqwest::Client::new());
        let request = ManifestRequest { url: format!("{}/manifest", server.uri()), ..Default::default() };
        let manifest = client.fetch(&request).await.unwrap();
        assert_eq!(manifest.total_size, 1024);
        assert_eq!(manifest.file_name, "movie.mp4");
    }

    #[tokio::test]
    async fn rate_limited_status_maps_to_rate_limited_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = ManifestClient::new(reqwest::Client::new());
        let request = ManifestRequest { url: format!("{}/manifest", server.uri()), ..Default::default() };
        assert!(matches!(client.fetch(&request).await, Err(DownloadError::RateLimited)));
    }

    #[tokio::test]
    async fn challenge_required_status_maps_to_precondition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest"))
            .respond_with(ResponseTemplate::new(461))
            .mount(&server)
            .await;

        let client = ManifestClient::new(reqwest::Client::new());
        let request = ManifestRequest { url: format!("{}/manifest", server.uri()), ..Default::default() };
        assert!(matches!(client.fetch(&request).await, Err(DownloadError::Precondition(_))));
    }

    #[tokio::test]
    async fn non_200_envelope_code_maps_to_precondition() {
        let server = MockServer::start().await;
        let mut body = plain_body();
        body["code"] = serde_json::json!(403);
        body["message"] = serde_json::json!("not yet verified");
        Mock::given(method("GET"))
            .and(path("/manifest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = ManifestClient::new(reqwest::Client::new());
        let request = ManifestRequest { url: format!("{}/manifest", server.uri()), ..Default::default() };
        let err = client.fetch(&request).await.unwrap_err();
        assert!(matches!(err, DownloadError::Precondition(msg) if msg == "not yet verified"));
    }

    #[tokio::test]
    async fn crypt_mode_decodes_base64_data_key() {
        let server = MockServer::start().await;
        let mut body = plain_body();
        body["encryption_mode"] = serde_json::json!("crypt");
        body["block_data_size"] = serde_json::json!(64);
        body["block_header_size"] = serde_json::json!(16);
        body["file_header_size"] = serde_json::json!(32);
        let key = [9u8; 32];
        body["data_key"] = serde_json::json!(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key));
        Mock::given(method("GET"))
            .and(path("/manifest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = ManifestClient::new(reqwest::Client::new());
        let request = ManifestRequest { url: format!("{}/manifest", server.uri()), ..Default::default() };
        let manifest = client.fetch(&request).await.unwrap();
        assert_eq!(manifest.data_key, key.to_vec());
    }
}
