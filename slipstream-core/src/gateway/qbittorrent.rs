//! qBittorrent Web API gateway.
//!
//! Cookie based session: the first request logs in, a 403 triggers one
//! re-login and retry. Stop/start use the v5 endpoints and fall back to the
//! v4 pause/resume names when the client answers 404.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use url::Url;

use super::{GatewayError, TorrentGateway};
use crate::config::QbittorrentConfig;
use crate::torrent::{TorrentFilter, TorrentInfo, TorrentState, TrackerEntry, TrackerStatus};

const API_PREFIX: &str = "api/v2/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway backed by a qBittorrent instance.
pub struct QbittorrentGateway {
    base_url: Url,
    username: String,
    password: String,
    client: reqwest::Client,
    /// Held while logging in so concurrent races share one session
    session: Mutex<bool>,
}

#[derive(Debug, Deserialize)]
struct RawTorrent {
    hash: String,
    name: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    ratio: f64,
    #[serde(default)]
    progress: f64,
    state: TorrentState,
    /// Unix timestamp of the last activity
    #[serde(default)]
    last_activity: i64,
    #[serde(default)]
    time_active: i64,
}

#[derive(Debug, Deserialize)]
struct RawTracker {
    url: String,
    status: i64,
    #[serde(default)]
    msg: String,
}

impl RawTorrent {
    fn into_info(self, now: i64, trackers: Vec<TrackerEntry>) -> TorrentInfo {
        let since_active = if self.last_activity > 0 {
            now.saturating_sub(self.last_activity).max(0)
        } else {
            0
        };
        TorrentInfo {
            hash: self.hash,
            name: self.name,
            category: Some(self.category).filter(|category| !category.is_empty()),
            ratio: self.ratio,
            progress: self.progress,
            state: self.state,
            time_since_active: Duration::from_secs(since_active as u64),
            time_active: Duration::from_secs(self.time_active.max(0) as u64),
            trackers,
        }
    }
}

impl QbittorrentGateway {
    /// Creates a gateway for the configured client; no request is sent yet.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unavailable` - Host/port do not form a valid URL or the HTTP client could not be built
    pub fn new(config: &QbittorrentConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("slipstream/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: config.base_url().map_err(GatewayError::unavailable)?,
            username: config.username.clone(),
            password: config.password.clone(),
            client,
            session: Mutex::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(API_PREFIX)
            .and_then(|api| api.join(path))
            .map_err(GatewayError::unavailable)
    }

    async fn login(&self, logged_in: &mut bool) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.endpoint("auth/login")?)
            .header(reqwest::header::REFERER, self.base_url.as_str())
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() || body.trim() != "Ok." {
            *logged_in = false;
            return Err(GatewayError::LoginRejected {
                username: self.username.clone(),
            });
        }

        *logged_in = true;
        match self.version().await {
            Ok(version) => tracing::info!(
                "Connected to qBittorrent {} at {} successfully",
                version,
                self.base_url
            ),
            Err(e) => {
                tracing::info!("Connected to qBittorrent at {} successfully", self.base_url);
                tracing::debug!("Could not read qBittorrent version: {}", e);
            }
        }
        Ok(())
    }

    /// Client application version, e.g. `v5.0.3`. Sent with the session
    /// cookie directly, as the session lock is held during login.
    async fn version(&self) -> Result<String, GatewayError> {
        let response = self.request(Method::GET, "app/version", &[])?.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::UnexpectedStatus {
                endpoint: "app/version".to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?.trim().to_string())
    }

    async fn ensure_session(&self) -> Result<(), GatewayError> {
        let mut logged_in = self.session.lock().await;
        if !*logged_in {
            self.login(&mut logged_in).await?;
        }
        Ok(())
    }

    async fn relogin(&self) -> Result<(), GatewayError> {
        let mut logged_in = self.session.lock().await;
        *logged_in = false;
        self.login(&mut logged_in).await
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let builder = self.client.request(method.clone(), self.endpoint(path)?);
        Ok(if method == Method::GET {
            builder.query(params)
        } else {
            builder.form(params)
        })
    }

    /// Sends a request, re-authenticating once on 403.
    async fn send_raw(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, GatewayError> {
        self.ensure_session().await?;
        let response = self.request(method.clone(), path, params)?.send().await?;
        if response.status() != StatusCode::FORBIDDEN {
            return Ok(response);
        }

        tracing::debug!("qBittorrent session expired, logging in again");
        self.relogin().await?;
        Ok(self.request(method, path, params)?.send().await?)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self.send_raw(method, path, params).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::UnexpectedStatus {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let response = self.send(Method::GET, path, params).await?;
        Ok(response.json().await?)
    }

    /// Posts to the v5 endpoint, retrying with the v4 name on 404.
    async fn post_with_fallback(
        &self,
        path: &str,
        legacy_path: &str,
        params: &[(&str, String)],
    ) -> Result<(), GatewayError> {
        let response = self.send_raw(Method::POST, path, params).await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("{path} not supported by client, falling back to {legacy_path}");
            self.send(Method::POST, legacy_path, params).await?;
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(GatewayError::UnexpectedStatus {
                endpoint: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn trackers(&self, hash: &str) -> Result<Vec<TrackerEntry>, GatewayError> {
        let raw: Vec<RawTracker> = self
            .get_json("torrents/trackers", &[("hash", hash.to_string())])
            .await?;
        Ok(raw
            .into_iter()
            .map(|tracker| {
                TrackerEntry::new(tracker.url, TrackerStatus::from_code(tracker.status), tracker.msg)
            })
            .collect())
    }
}

fn join_hashes<'a>(hashes: impl IntoIterator<Item = &'a String>) -> String {
    hashes
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

#[async_trait]
impl TorrentGateway for QbittorrentGateway {
    async fn list_torrents(&self, filter: &TorrentFilter) -> Result<Vec<TorrentInfo>, GatewayError> {
        let mut params = vec![("filter", filter.status.as_query().to_string())];
        if let Some(hashes) = &filter.hashes {
            params.push(("hashes", join_hashes(hashes)));
        }

        let raw: Vec<RawTorrent> = self.get_json("torrents/info", &params).await?;
        let now = chrono::Utc::now().timestamp();

        if !filter.include_trackers {
            return Ok(raw
                .into_iter()
                .map(|torrent| torrent.into_info(now, Vec::new()))
                .collect());
        }

        let trackers = try_join_all(raw.iter().map(|torrent| self.trackers(&torrent.hash))).await?;
        Ok(raw
            .into_iter()
            .zip(trackers)
            .map(|(torrent, trackers)| torrent.into_info(now, trackers))
            .collect())
    }

    async fn pause(&self, hashes: &BTreeSet<String>) -> Result<(), GatewayError> {
        if hashes.is_empty() {
            return Ok(());
        }
        self.post_with_fallback(
            "torrents/stop",
            "torrents/pause",
            &[("hashes", join_hashes(hashes))],
        )
        .await
    }

    async fn resume(&self, hashes: &BTreeSet<String>) -> Result<(), GatewayError> {
        if hashes.is_empty() {
            return Ok(());
        }
        self.post_with_fallback(
            "torrents/start",
            "torrents/resume",
            &[("hashes", join_hashes(hashes))],
        )
        .await
    }

    async fn reannounce(&self, hash: &str) -> Result<(), GatewayError> {
        self.send(
            Method::POST,
            "torrents/reannounce",
            &[("hashes", hash.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn restart(&self, hash: &str) -> Result<(), GatewayError> {
        let params = [("hashes", hash.to_string())];
        self.post_with_fallback("torrents/stop", "torrents/pause", &params)
            .await?;
        self.post_with_fallback("torrents/start", "torrents/resume", &params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QbittorrentConfig {
        QbittorrentConfig {
            host: "localhost".to_string(),
            port: Some(8080),
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn test_endpoint_joins_api_prefix() {
        let gateway = QbittorrentGateway::new(&config()).unwrap();
        let url = gateway.endpoint("torrents/info").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/v2/torrents/info");
    }

    #[test]
    fn test_raw_torrent_conversion() {
        let raw: RawTorrent = serde_json::from_value(serde_json::json!({
            "hash": "abc",
            "name": "Some.Release",
            "category": "",
            "ratio": 0.5,
            "progress": 1.0,
            "state": "stalledUP",
            "last_activity": 1_000,
            "time_active": 7200
        }))
        .unwrap();

        let info = raw.into_info(1_060, Vec::new());
        assert_eq!(info.category, None);
        assert_eq!(info.state, TorrentState::StalledUpload);
        assert_eq!(info.time_since_active, Duration::from_secs(60));
        assert_eq!(info.time_active, Duration::from_secs(7200));
    }

    #[test]
    fn test_join_hashes_uses_pipe_separator() {
        let hashes: BTreeSet<String> = ["b", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(join_hashes(&hashes), "a|b");
    }
}
