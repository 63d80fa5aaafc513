use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Envelope, EntryGateway};
use crate::error::FetchError;
use crate::model::{EntryContent, EntrySummary, ImageMetadata};

/// Persisted login session. Only the bearer token is used here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub token: Option<String>,
}

impl Session {
    /// Read the session file. A missing or unreadable file means "logged out".
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), "No session file: {}", e);
                return Self::default();
            }
        };
        match serde_json::from_slice::<Session>(&raw) {
            Ok(session) => session,
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable session file: {}", e);
                Self::default()
            }
        }
    }

    fn bearer(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// `EntryGateway` over the paths REST API.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: Url,
    session: Session,
}

impl HttpGateway {
    pub fn new(base_url: &str, session: Session, timeout: Duration) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        let base_url = Url::parse(base).with_context(|| format!("Invalid API base URL: {}", base))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("API base URL cannot carry paths: {}", base);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            session,
        })
    }

    /// Build `{base}/{segments...}`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Envelope<T>, FetchError> {
        let mut req = self
            .client
            .get(url.clone())
            .header("Content-Type", "application/json");
        if let Some(token) = self.session.bearer() {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let data = resp.json::<T>().await?;
        debug!(%url, status = status.as_u16(), "fetched");
        Ok(Envelope {
            data,
            status: status.as_u16(),
        })
    }
}

impl EntryGateway for HttpGateway {
    async fn list_entries(&self, path_id: &str) -> Result<Envelope<Vec<EntrySummary>>, FetchError> {
        let url = self.endpoint(&["v1", "paths", path_id, "entries"])?;
        self.get_json(url).await
    }

    async fn get_entry_content(
        &self,
        path_id: &str,
        entry_id: &str,
    ) -> Result<Envelope<EntryContent>, FetchError> {
        let url = self.endpoint(&["v1", "paths", path_id, "entries", entry_id])?;
        self.get_json(url).await
    }

    async fn list_entry_images(
        &self,
        path_id: &str,
        entry_id: &str,
    ) -> Result<Envelope<Vec<ImageMetadata>>, FetchError> {
        let url = self.endpoint(&["v1", "paths", path_id, "entries", entry_id, "images"])?;
        self.get_json(url).await
    }
}
