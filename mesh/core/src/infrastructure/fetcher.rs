// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # HTTP Release Client
//!
//! [`ArtifactSource`] implementation over `reqwest`. Manifests are JSON by
//! default; YAML bodies are accepted when the endpoint says so (content type)
//! or the URL extension does. Artifact downloads return raw bytes — hash
//! verification belongs to the rollout controller, which never skips it.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::domain::update::{ArtifactError, ArtifactSource, UpdateManifest};

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ArtifactError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ArtifactError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ArtifactError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

impl Default for HttpArtifactSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch_manifest(&self, url: &str) -> Result<UpdateManifest, ArtifactError> {
        let response = self.get(url).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = response
            .text()
            .await
            .map_err(|e| ArtifactError::Transport(e.to_string()))?;

        let yaml = content_type.contains("yaml")
            || url.ends_with(".yaml")
            || url.ends_with(".yml");
        if yaml {
            serde_yaml::from_str(&body).map_err(|e| ArtifactError::Decode(e.to_string()))
        } else {
            serde_json::from_str(&body).map_err(|e| ArtifactError::Decode(e.to_string()))
        }
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        let response = self.get(url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ArtifactError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_fetch_manifest_json() {
        let mut server = mockito::Server::new_async().await;
        let now = Utc::now();
        let body = serde_json::json!({
            "id": "rel-1",
            "version": "1.2.0",
            "channel": "beta",
            "sha256": "0".repeat(64),
            "url": "https://releases.kind.example/1.2.0.bin",
            "rollout": {
                "staged": false,
                "start_time": now.to_rfc3339(),
                "end_time": (now + chrono::Duration::hours(1)).to_rfc3339(),
            }
        });
        let mock = server
            .mock("GET", "/manifest.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let source = HttpArtifactSource::new();
        let manifest = source
            .fetch_manifest(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap();
        assert_eq!(manifest.id, "rel-1");
        assert_eq!(manifest.version.to_string(), "1.2.0");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_manifest_yaml_by_content_type() {
        let mut server = mockito::Server::new_async().await;
        let body = "\
id: rel-2
version: 2.0.0
sha256: \"1111111111111111111111111111111111111111111111111111111111111111\"
url: https://releases.kind.example/2.0.0.bin
rollout:
  staged: true
  batch_percent: 10
  start_time: 2026-08-01T00:00:00Z
  end_time: 2026-08-03T00:00:00Z
";
        let _mock = server
            .mock("GET", "/manifest")
            .with_status(200)
            .with_header("content-type", "application/yaml")
            .with_body(body)
            .create_async()
            .await;

        let source = HttpArtifactSource::new();
        let manifest = source
            .fetch_manifest(&format!("{}/manifest", server.url()))
            .await
            .unwrap();
        assert_eq!(manifest.id, "rel-2");
        assert!(manifest.rollout.staged);
        assert_eq!(manifest.rollout.batch_percent, 10);
    }

    #[tokio::test]
    async fn test_server_error_is_transient_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/manifest.json")
            .with_status(503)
            .create_async()
            .await;

        let source = HttpArtifactSource::new();
        let err = source
            .fetch_manifest(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap_err();
        assert_eq!(err, ArtifactError::Status(503));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_garbage_body_is_terminal_decode_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/manifest.json")
            .with_status(200)
            .with_body("not a manifest")
            .create_async()
            .await;

        let source = HttpArtifactSource::new();
        let err = source
            .fetch_manifest(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_artifact_bytes() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/agent.bin")
            .with_status(200)
            .with_body(&b"release artifact"[..])
            .create_async()
            .await;

        let source = HttpArtifactSource::new();
        let bytes = source
            .fetch_artifact(&format!("{}/agent.bin", server.url()))
            .await
            .unwrap();
        assert_eq!(bytes, b"release artifact");
    }
}
