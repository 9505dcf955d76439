//! # provider-devbytes
//!
//! Catalog provider for the DevBytes video playlist.
//!
//! The endpoint serves a single JSON document of the form
//! `{"videos": [{"title": ..., "description": ..., "url": ..., "updated": ...,
//! "thumbnail": ..., "closedCaptions": ...}]}`. This provider performs one GET
//! per [`CatalogSource::fetch_catalog`] call and does no retrying of its own.
//!
//! ## Example
//!
//! ```no_run
//! use bytecache_core::CatalogSource;
//! use provider_devbytes::{DevBytesConfig, DevBytesProvider};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = DevBytesProvider::new(DevBytesConfig::default())?;
//! let items = provider.fetch_catalog().await?;
//! println!("fetched {} items", items.len());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytecache_core::prelude::*;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Public DevBytes playlist endpoint.
pub const DEFAULT_CATALOG_URL: &str = "https://android-kotlin-fun.appspot.com/devbytes";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum DevBytesError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<DevBytesError> for SourceError {
    fn from(err: DevBytesError) -> Self {
        match err {
            DevBytesError::Http(e) => match e.status() {
                Some(status) => SourceError::Status(status.as_u16()),
                None if e.is_decode() => SourceError::Decode(e.to_string()),
                None => SourceError::Network(e.to_string()),
            },
            DevBytesError::Parse(e) => SourceError::Decode(e.to_string()),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Settings for [`DevBytesProvider`].
#[derive(Debug, Clone)]
pub struct DevBytesConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for DevBytesConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: format!("bytecache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

// ============================================================================
// DevBytes Provider
// ============================================================================

pub struct DevBytesProvider {
    config: DevBytesConfig,
    client: Client,
}

impl DevBytesProvider {
    pub fn new(config: DevBytesConfig) -> Result<Self, DevBytesError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn fetch_envelope(&self) -> Result<CatalogEnvelope, DevBytesError> {
        let response = self
            .client
            .get(&self.config.url)
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        debug!("Received {} bytes from {}", body.len(), self.config.url);

        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl CatalogSource for DevBytesProvider {
    fn id(&self) -> &'static str {
        "devbytes"
    }

    async fn fetch_catalog(&self) -> SourceResult<Vec<WireItem>> {
        let envelope = self.fetch_envelope().await?;
        debug!("Decoded {} catalog entries", envelope.items.len());
        Ok(envelope.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response and return the URL to hit.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        format!("http://{addr}/devbytes")
    }

    fn provider_for(url: String) -> DevBytesProvider {
        DevBytesProvider::new(DevBytesConfig {
            url,
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = DevBytesConfig::default();
        assert_eq!(config.url, DEFAULT_CATALOG_URL);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("bytecache/"));
    }

    #[tokio::test]
    async fn test_fetch_catalog_decodes_videos() {
        let url = serve_once(
            "200 OK",
            r#"{"videos":[{"title":"A","description":"first","url":"https://x/a","updated":"2018-06-01","thumbnail":"https://x/a.png"},{"title":"B","url":"https://x/b"}]}"#,
        )
        .await;

        let provider = provider_for(url);
        assert_eq!(provider.id(), "devbytes");

        let items = provider.fetch_catalog().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title.as_deref(), Some("A"));
        assert_eq!(items[1].url.as_deref(), Some("https://x/b"));
        assert!(items[1].description.is_none());
    }

    #[tokio::test]
    async fn test_fetch_catalog_maps_http_status() {
        let url = serve_once("503 Service Unavailable", "{}").await;
        let err = provider_for(url).fetch_catalog().await.unwrap_err();
        assert_eq!(err, SourceError::Status(503));
    }

    #[tokio::test]
    async fn test_fetch_catalog_rejects_malformed_body() {
        let url = serve_once("200 OK", "not json").await;
        let err = provider_for(url).fetch_catalog().await.unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[tokio::test]
    async fn test_fetch_catalog_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = provider_for(format!("http://{addr}/devbytes"))
            .fetch_catalog()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Network(_)));
    }
}
