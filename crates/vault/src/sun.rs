//! Sun object store client
//!
//! Objects are addressed by `(kind, name)`:
//!
//! - `PUT /v1/objects/{kind}/{name}` with `{content_type, payload_base64, metadata}`
//! - `GET /v1/objects/{kind}/{name}/payload` returning the raw bytes
//!
//! A 404 on read means the object does not exist yet.

use crate::error::VaultError;
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Serialize;
use si_core::SunSettings;
use std::time::Duration;
use tracing::{debug, warn};

/// Object kind holding the vault identity
pub const KIND_IDENTITY: &str = "identity";
/// Object kind holding vault file bytes
pub const KIND_BACKUP: &str = "vault-backup";
/// Object name of the identity
pub const IDENTITY_OBJECT: &str = "default";

const MAX_TOKEN_CHARS: usize = 256;

/// Remote key/value storage for identities and vault backups
pub trait ObjectStore {
    /// Fetch an object's payload; `None` when absent
    fn get(&self, kind: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace an object
    fn put(
        &self,
        kind: &str,
        name: &str,
        payload: &[u8],
        content_type: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;
}

#[derive(Serialize)]
struct PutObjectRequest<'a> {
    content_type: &'a str,
    payload_base64: String,
    metadata: serde_json::Value,
}

/// Blocking HTTP client for the sun service
pub struct SunClient {
    base_url: String,
    token: String,
    http: Client,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl SunClient {
    /// Build a client from `[sun]` settings
    pub fn from_settings(settings: &SunSettings, allow_insecure_http: bool) -> Result<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                anyhow!(VaultError::BackendUnavailable(
                    "sun base_url is not configured (set [sun].base_url or SI_SUN_BASE_URL)"
                        .to_string()
                ))
            })?;
        let token = settings.token.as_deref().unwrap_or_default();
        Self::new(
            base_url,
            token,
            Duration::from_secs(settings.timeout_seconds.max(1)),
            allow_insecure_http,
        )
    }

    pub fn new(
        base_url: &str,
        token: &str,
        timeout: Duration,
        allow_insecure_http: bool,
    ) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        validate_base_url(&base_url, allow_insecure_http)?;
        let token = token.trim().to_string();
        validate_token(&token)?;

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(format!("si/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build sun HTTP client")?;

        Ok(Self {
            base_url,
            token,
            http,
            timeout,
            max_retries: 2,
            retry_delay: Duration::from_millis(200),
        })
    }

    /// Override the base delay between retries
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn object_url(&self, kind: &str, name: &str) -> String {
        format!("{}/v1/objects/{}/{}", self.base_url, kind, name)
    }

    /// Send with retries on connect errors, timeouts, 429 and 5xx
    fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let request = build()
                .bearer_auth(&self.token)
                .timeout(self.timeout);

            let retryable = match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        if attempt >= self.max_retries {
                            return Ok(response);
                        }
                        format!("status {}", status.as_u16())
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if attempt >= self.max_retries {
                        bail!(VaultError::BackendUnavailable(format!("sun request failed: {}", e)));
                    }
                    e.to_string()
                }
                Err(e) => bail!(VaultError::BackendUnavailable(format!("sun request failed: {}", e))),
            };

            attempt += 1;
            let delay = self.retry_delay * 2u32.pow(attempt - 1);
            debug!(attempt, reason = %retryable, "retrying sun request");
            std::thread::sleep(delay.min(Duration::from_secs(2)));
        }
    }
}

fn status_error(response: Response) -> anyhow::Error {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.canonical_reason().unwrap_or("error").to_string()
            } else {
                trimmed.to_string()
            }
        });
    anyhow!(VaultError::BackendUnavailable(format!(
        "sun: {} (status {})",
        message,
        status.as_u16()
    )))
}

impl ObjectStore for SunClient {
    fn get(&self, kind: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/payload", self.object_url(kind, name));
        let response = self.send(|| self.http.get(&url))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(kind, name, "sun object absent");
                Ok(None)
            }
            s if s.is_success() => {
                let bytes = response.bytes().map_err(|e| {
                    anyhow!(VaultError::BackendUnavailable(format!("read sun payload: {}", e)))
                })?;
                Ok(Some(bytes.to_vec()))
            }
            _ => Err(status_error(response)),
        }
    }

    fn put(
        &self,
        kind: &str,
        name: &str,
        payload: &[u8],
        content_type: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let url = self.object_url(kind, name);
        let body = PutObjectRequest {
            content_type,
            payload_base64: STANDARD.encode(payload),
            metadata,
        };
        let response = self.send(|| self.http.put(&url).json(&body))?;

        if response.status().is_success() {
            debug!(kind, name, bytes = payload.len(), "sun object stored");
            Ok(())
        } else {
            Err(status_error(response))
        }
    }
}

fn validate_base_url(base_url: &str, allow_insecure_http: bool) -> Result<()> {
    let lower = base_url.to_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    if let Some(rest) = lower.strip_prefix("http://") {
        let host = rest.split(['/', '?']).next().unwrap_or_default();
        let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        if allow_insecure_http || matches!(host, "localhost" | "127.0.0.1" | "[::1]") {
            if allow_insecure_http {
                warn!(base_url, "using plain HTTP for sun");
            }
            return Ok(());
        }
    }
    bail!(VaultError::BackendUnavailable(format!(
        "sun base_url must use https: {}",
        base_url
    )))
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        bail!(VaultError::BackendUnavailable(
            "sun token is required (set [sun].token or SI_SUN_TOKEN)".to_string()
        ));
    }
    if token.chars().count() > MAX_TOKEN_CHARS {
        bail!(VaultError::BackendUnavailable("sun token is too long".to_string()));
    }
    if token.chars().any(|c| c <= ' ' || c == '\u{7f}') {
        bail!(VaultError::BackendUnavailable(
            "sun token must not contain whitespace or control characters".to_string()
        ));
    }
    Ok(())
}
