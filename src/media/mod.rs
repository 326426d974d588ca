//! Media fetching for the official Cloud API
//!
//! Cloud media comes in two steps: resolve the media id to a short-lived
//! URL, then download the binary. Both calls carry the number's bearer
//! token. Failures degrade the message to its bare media-id placeholder
//! instead of failing ingestion.

pub mod store;

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

pub use store::{ext_for_mime, sanitize_base, storage_name, FsMediaStore, MediaStore};

use crate::{Error, Result};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);
const BINARY_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetched media bytes plus provider metadata
#[derive(Debug)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaMetadata {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default, rename = "file_name")]
    filename: Option<String>,
}

/// Cloud API media client
#[derive(Clone)]
pub struct CloudMediaClient {
    client: Client,
    graph_base: String,
    api_version: String,
}

impl CloudMediaClient {
    /// Create a media client against a graph API base
    #[must_use]
    pub fn new(graph_base: String, api_version: String) -> Self {
        Self {
            client: Client::new(),
            graph_base,
            api_version,
        }
    }

    /// Download a cloud media object by id
    ///
    /// # Errors
    ///
    /// Returns error if either fetch step fails or times out
    pub async fn fetch(&self, media_id: &str, token: &str) -> Result<FetchedMedia> {
        let meta = self.fetch_metadata(media_id, token).await?;
        let bytes = self.fetch_binary(&meta.url, token).await?;

        Ok(FetchedMedia {
            bytes,
            mime: meta.mime_type,
            filename: meta.filename,
        })
    }

    /// Like [`fetch`](Self::fetch), but degrades failures to `None` with a warn
    pub async fn fetch_or_warn(&self, media_id: &str, token: &str) -> Option<FetchedMedia> {
        match self.fetch(media_id, token).await {
            Ok(media) => Some(media),
            Err(e) => {
                tracing::warn!(media_id, error = %e, "cloud media fetch failed, keeping placeholder");
                None
            }
        }
    }

    async fn fetch_metadata(&self, media_id: &str, token: &str) -> Result<MediaMetadata> {
        let url = format!("{}/{}/{media_id}", self.graph_base, self.api_version);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Media(format!(
                "media metadata fetch failed: {status} - {body}"
            )));
        }

        Ok(response.json().await?)
    }

    async fn fetch_binary(&self, url: &str, token: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(BINARY_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Media(format!(
                "media binary fetch failed: {}",
                response.status()
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }
}
