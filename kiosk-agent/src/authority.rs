//! HTTP client for the remote authority service
//!
//! All requests carry the device identifier in `X-Device-Id`. Every response
//! body is treated as untrusted and validated before it is handed on.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use kiosk_common::config::{AuthorityConfig, ManifestTransport};
use kiosk_common::models::{
    DatabaseKind, Metadata, PendingAlert, PlaylistItem, RemoteDatabaseVersion, SyncManifest,
    TriggeredPlaylist,
};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{AgentError, Result};

const USER_AGENT: &str = concat!("kiosk-agent/", env!("CARGO_PKG_VERSION"));
const DEVICE_HEADER: &str = "X-Device-Id";

/// Playlist half of the split manifest transport
#[derive(Debug, Deserialize)]
struct PlaylistResponse {
    playlist_version: u64,
    #[serde(default)]
    default_playlist: Vec<PlaylistItem>,
    #[serde(default)]
    settings: Metadata,
}

/// Trigger half of the split manifest transport
#[derive(Debug, Deserialize)]
struct TriggersResponse {
    #[serde(default)]
    triggered_playlists: Vec<TriggeredPlaylist>,
}

/// Pairing status as reported by the authority
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePairingStatus {
    pub paired: bool,
}

#[derive(Serialize)]
struct PairingRegistration<'a> {
    device_id: &'a str,
    pairing_code: &'a str,
}

/// Wire shape of a forwarded alert (no biometric content)
#[derive(Serialize)]
struct AlertPayload<'a> {
    alert_id: String,
    device_id: &'a str,
    created_at: String,
    case_reference: &'a str,
    confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_ref: Option<&'a str>,
}

/// Authority API client
pub struct AuthorityClient {
    http: reqwest::Client,
    base_url: Url,
    device_id: String,
    transport: ManifestTransport,
}

impl AuthorityClient {
    pub fn new(config: &AuthorityConfig, device_id: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| AgentError::Config(format!("invalid authority URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AgentError::Config(format!(
                "authority URL cannot be used as a base: {}",
                config.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.min(10)))
            .build()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            device_id: device_id.into(),
            transport: config.manifest_transport,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Build an endpoint URL from path segments (each segment is escaped)
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AgentError::Config("authority URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        debug!(url = %url, "GET");
        let response = self
            .http
            .get(url.clone())
            .header(DEVICE_HEADER, &self.device_id)
            .send()
            .await?;
        check_status(response, &url)
    }

    /// GET that maps 404 to `None`
    async fn get_optional(&self, url: Url) -> Result<Option<reqwest::Response>> {
        match self.get(url).await {
            Ok(response) => Ok(Some(response)),
            Err(AgentError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.get(url).await?;
        response
            .json()
            .await
            .map_err(|e| AgentError::InvalidPayload(e.to_string()))
    }

    /// Fetch the manifest in whichever transport shape is configured
    ///
    /// The result has passed validation; callers may apply it directly.
    pub async fn fetch_manifest(&self) -> Result<SyncManifest> {
        let manifest = match self.transport {
            ManifestTransport::Combined => {
                let url = self.endpoint(&["api", "v1", "devices", &self.device_id, "sync"])?;
                self.get_json::<SyncManifest>(url).await?
            }
            ManifestTransport::Split => {
                let playlist_url =
                    self.endpoint(&["api", "v1", "devices", &self.device_id, "playlist"])?;
                let triggers_url =
                    self.endpoint(&["api", "v1", "devices", &self.device_id, "triggers"])?;
                let playlist: PlaylistResponse = self.get_json(playlist_url).await?;
                let triggers: TriggersResponse = self.get_json(triggers_url).await?;
                SyncManifest {
                    playlist_version: playlist.playlist_version,
                    default_playlist: playlist.default_playlist,
                    triggered_playlists: triggers.triggered_playlists,
                    settings: playlist.settings,
                }
            }
        };

        manifest
            .validate()
            .map_err(|e| AgentError::InvalidPayload(e.to_string()))?;
        Ok(manifest)
    }

    /// Stream one content file into `dest`
    pub async fn download_content(&self, content_id: &str, dest: &Path) -> Result<u64> {
        let url = self.endpoint(&["api", "v1", "content", content_id, "download"])?;
        let response = self.get(url).await?;
        stream_to_file(response, dest).await
    }

    /// Current remote version descriptor; `None` when not yet published
    pub async fn fetch_database_version(
        &self,
        kind: DatabaseKind,
    ) -> Result<Option<RemoteDatabaseVersion>> {
        let url = self.endpoint(&["api", "v1", "databases", kind.as_str(), "version"])?;
        let Some(response) = self.get_optional(url).await? else {
            return Ok(None);
        };
        let version: RemoteDatabaseVersion = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidPayload(e.to_string()))?;
        version
            .validate()
            .map_err(|e| AgentError::InvalidPayload(e.to_string()))?;
        Ok(Some(version))
    }

    /// Stream a database index file into `dest`
    pub async fn download_database(&self, kind: DatabaseKind, dest: &Path) -> Result<u64> {
        let url = self.endpoint(&["api", "v1", "databases", kind.as_str(), "download"])?;
        let response = self.get(url).await?;
        stream_to_file(response, dest).await
    }

    /// Record metadata for a database; `None` when the authority has no endpoint
    pub async fn fetch_database_metadata(
        &self,
        kind: DatabaseKind,
    ) -> Result<Option<Vec<serde_json::Value>>> {
        let url = self.endpoint(&["api", "v1", "databases", kind.as_str(), "metadata"])?;
        let Some(response) = self.get_optional(url).await? else {
            return Ok(None);
        };
        let records = response
            .json()
            .await
            .map_err(|e| AgentError::InvalidPayload(e.to_string()))?;
        Ok(Some(records))
    }

    /// Forward one safety alert
    pub async fn post_alert(&self, alert: &PendingAlert) -> Result<()> {
        let url = self.endpoint(&["api", "v1", "alerts"])?;
        let payload = AlertPayload {
            alert_id: alert.alert_id.to_string(),
            device_id: &self.device_id,
            created_at: alert.created_at.to_rfc3339(),
            case_reference: &alert.case_reference,
            confidence: alert.confidence,
            snapshot_ref: alert.snapshot_ref.as_deref(),
        };
        let response = self
            .http
            .post(url.clone())
            .header(DEVICE_HEADER, &self.device_id)
            .json(&payload)
            .send()
            .await?;
        check_status(response, &url)?;
        Ok(())
    }

    /// Announce the pairing code shown on screen
    pub async fn register_pairing_code(&self, code: &str) -> Result<()> {
        let url = self.endpoint(&["api", "v1", "devices", "register"])?;
        let response = self
            .http
            .post(url.clone())
            .header(DEVICE_HEADER, &self.device_id)
            .json(&PairingRegistration {
                device_id: &self.device_id,
                pairing_code: code,
            })
            .send()
            .await?;
        check_status(response, &url)?;
        Ok(())
    }

    /// Has an administrator claimed this device?
    pub async fn fetch_pairing_status(&self) -> Result<RemotePairingStatus> {
        let url = self.endpoint(&["api", "v1", "devices", &self.device_id, "pairing"])?;
        self.get_json(url).await
    }
}

fn check_status(response: reqwest::Response, url: &Url) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(AgentError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

/// Write a response body to `dest` chunk by chunk, then fsync
async fn stream_to_file(response: reqwest::Response, dest: &Path) -> Result<u64> {
    if response.status() == StatusCode::NO_CONTENT {
        return Err(AgentError::InvalidPayload("empty download body".into()));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AgentError::Network(e.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> AuthorityClient {
        let config = AuthorityConfig {
            base_url: base.to_string(),
            ..Default::default()
        };
        AuthorityClient::new(&config, "dev 1").unwrap()
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let url = client("http://authority.local")
            .endpoint(&["api", "v1", "content", "a/b", "download"])
            .unwrap();
        assert_eq!(url.as_str(), "http://authority.local/api/v1/content/a%2Fb/download");
    }

    #[test]
    fn test_endpoint_keeps_base_path_prefix() {
        let url = client("http://authority.local/signage/")
            .endpoint(&["api", "v1", "alerts"])
            .unwrap();
        assert_eq!(url.as_str(), "http://authority.local/signage/api/v1/alerts");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = AuthorityConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(AuthorityClient::new(&config, "d").is_err());
    }
}
