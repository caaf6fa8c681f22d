//! The pull side: where readings come from.
//!
//! [`ReadingSource`] is the narrow interface the engine consumes. [`HttpSource`] speaks
//! the vendor's REST API:
//!
//! ```text
//! POST {base}/oauth/token                      -> { access_token, token_type, ... }
//! GET  {base}/devices                          -> { devices: [{ device_id, description?, first_seen_at? }] }
//! GET  {base}/devices/{id}/readings?since=..&page_size=..&page_token=..
//!                                              -> { readings: [{ timestamp, values }], next_page_token? }
//! ```

use crate::errors::SourceError;
use crate::model::{Device, Page, RawTimestamp, Reading};
use crate::BoxFuture;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub type SourceResult<T> = std::result::Result<T, SourceError>;

pub trait ReadingSource: Send + Sync {
    /// Devices known to the source.
    fn list_devices(&self) -> BoxFuture<'_, Vec<Device>, SourceError>;

    /// One page of readings strictly after `since`, ascending by timestamp.
    ///
    /// `page_token` is the token returned with the previous page, `None` on the first call.
    fn fetch_page<'a>(
        &'a self,
        device_id: &'a str,
        since: DateTime<Utc>,
        page_token: Option<&'a str>,
    ) -> BoxFuture<'a, Page, SourceError>;
}

/// How the HTTP source proves who it is.
#[derive(Debug, Clone)]
pub enum Grant {
    RefreshToken(String),
    AuthorizationCode {
        code: String,
        redirect_uri: String,
    },
    Password {
        username: String,
        password: String,
    },
}

impl Grant {
    fn grant_type(&self) -> &'static str {
        match self {
            Grant::RefreshToken(_) => "refresh_token",
            Grant::AuthorizationCode { .. } => "authorization_code",
            Grant::Password { .. } => "password",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub grant: Grant,
    pub page_size: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    devices: Vec<WireDevice>,
}

#[derive(Debug, Deserialize)]
struct WireDevice {
    device_id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    first_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ReadingsResponse {
    #[serde(default)]
    readings: Vec<WireReading>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireReading {
    #[serde(default)]
    timestamp: serde_json::Value,
    #[serde(default)]
    values: BTreeMap<String, serde_json::Value>,
}

impl WireReading {
    fn into_reading(self, device_id: &str) -> Reading {
        let timestamp = match self.timestamp {
            serde_json::Value::Null => None,
            serde_json::Value::Number(n) => Some(match n.as_i64() {
                Some(secs) => RawTimestamp::Unix(secs),
                None => RawTimestamp::Text(n.to_string()),
            }),
            serde_json::Value::String(s) => Some(RawTimestamp::Text(s)),
            other => Some(RawTimestamp::Text(other.to_string())),
        };

        let values = self
            .values
            .into_iter()
            .map(|(metric, value)| (metric, wire_value(&value)))
            .collect();

        Reading {
            device_id: device_id.to_string(),
            timestamp,
            values,
        }
    }
}

/// Numbers pass through and numeric strings are parsed. `null` counts as absent. Anything
/// else becomes NaN so validation rejects the reading instead of dropping the metric.
fn wire_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Number(n) => Some(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Some(s.trim().parse().unwrap_or(f64::NAN)),
        _ => Some(f64::NAN),
    }
}

pub struct HttpSource {
    client: reqwest::Client,
    base_url: reqwest::Url,
    config: HttpSourceConfig,
    authorization: RwLock<Option<String>>,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> SourceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("HTTP client setup: {}", e)))?;

        let base_url = reqwest::Url::parse(&config.base_url)
            .map_err(|e| SourceError::Protocol(format!("invalid base URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::Protocol(format!(
                "invalid base URL: {}",
                config.base_url
            )));
        }

        Ok(Self {
            client,
            base_url,
            config,
            authorization: RwLock::new(None),
        })
    }

    /// Appends escaped path segments to the base URL.
    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Performs the token handshake. Must succeed before any data call.
    pub async fn authenticate(&self) -> SourceResult<()> {
        let mut body = serde_json::json!({
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret,
            "grant_type": self.config.grant.grant_type(),
        });
        match &self.config.grant {
            Grant::RefreshToken(token) => {
                body["refresh_token"] = token.clone().into();
            }
            Grant::AuthorizationCode { code, redirect_uri } => {
                body["code"] = code.clone().into();
                body["redirect_uri"] = redirect_uri.clone().into();
            }
            Grant::Password { username, password } => {
                body["username"] = username.clone().into();
                body["password"] = password.clone().into();
            }
        }

        let resp = self
            .client
            .post(self.url(&["oauth", "token"]))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            // A 4xx from the token endpoint means the credentials are bad, whatever the code.
            return Err(match classify_status(status) {
                SourceError::Protocol(msg) => SourceError::AuthFailed(format!(
                    "{} grant rejected: {}",
                    self.config.grant.grant_type(),
                    msg
                )),
                other => other,
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::AuthFailed(format!("invalid token response: {}", e)))?;
        let token_type = token.token_type.unwrap_or_else(|| "Bearer".to_string());

        *self.authorization.write().await = Some(format!("{} {}", token_type, token.access_token));
        info!(
            grant = self.config.grant.grant_type(),
            "Authenticated with reading source"
        );
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &[&str],
        query: &[(&str, String)],
    ) -> SourceResult<T> {
        let authorization = self
            .authorization
            .read()
            .await
            .clone()
            .ok_or_else(|| SourceError::AuthFailed("not authenticated".to_string()))?;

        let resp = self
            .client
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        resp.json()
            .await
            .map_err(|e| SourceError::Protocol(format!("decoding {}: {}", path.join("/"), e)))
    }

    async fn list_devices_inner(&self) -> SourceResult<Vec<Device>> {
        let resp: DevicesResponse = self.get_json(&["devices"], &[]).await?;
        let devices: Vec<Device> = resp
            .devices
            .into_iter()
            .map(|d| Device {
                id: d.device_id,
                name: d.description,
                first_seen_at: d.first_seen_at,
            })
            .collect();
        debug!(count = devices.len(), "Listed devices");
        Ok(devices)
    }

    async fn fetch_page_inner(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> SourceResult<Page> {
        let mut query = vec![
            ("since", since.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            ("page_size", self.config.page_size.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }

        let resp: ReadingsResponse = self
            .get_json(&["devices", device_id, "readings"], &query)
            .await?;

        Ok(Page {
            readings: resp
                .readings
                .into_iter()
                .map(|r| r.into_reading(device_id))
                .collect(),
            next_page_token: resp.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

impl ReadingSource for HttpSource {
    fn list_devices(&self) -> BoxFuture<'_, Vec<Device>, SourceError> {
        Box::pin(self.list_devices_inner())
    }

    fn fetch_page<'a>(
        &'a self,
        device_id: &'a str,
        since: DateTime<Utc>,
        page_token: Option<&'a str>,
    ) -> BoxFuture<'a, Page, SourceError> {
        Box::pin(self.fetch_page_inner(device_id, since, page_token))
    }
}

fn transport_error(e: reqwest::Error) -> SourceError {
    warn!("Source request failed: {}", e);
    SourceError::Unavailable(e.to_string())
}

/// Maps a non-success HTTP status onto the source error taxonomy.
fn classify_status(status: StatusCode) -> SourceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SourceError::AuthFailed(format!("HTTP {}", status))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            SourceError::Unavailable(format!("HTTP {}", status))
        }
        s if s.is_server_error() => SourceError::Unavailable(format!("HTTP {}", s)),
        s => SourceError::Protocol(format!("HTTP {}", s)),
    }
}
