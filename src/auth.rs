use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::crypto;
use crate::domain::{url_token, url_token_refresh};
use crate::error::{AgentError, Result};

const API_KEY_HEADER: &str = "qredo-api-key";
const API_SIGNATURE_HEADER: &str = "qredo-api-signature";
const API_TIMESTAMP_HEADER: &str = "qredo-api-timestamp";
const AUTH_HEADER: &str = "x-token";

#[derive(Debug, Deserialize)]
struct GetTokenResponse {
    token: String,
}

/// Supplies the auth header for upstream calls and keeps the underlying
/// bearer token fresh in the background.
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    /// Obtain the initial token and start the background refresh. Fails if
    /// the authority rejects the credentials or returns an unusable token.
    async fn initiate(&self, workspace_id: &str, api_key_secret: &str, api_key_id: &str) -> Result<()>;
    /// Current auth header, `{x-token: <token>}`.
    fn auth_header(&self) -> HeaderMap;
    /// Stop the background refresh task.
    fn stop(&self);
}

struct Credentials {
    workspace_id: String,
    api_key_id: String,
    api_key_secret: Vec<u8>,
}

struct Inner {
    base_url: String,
    htc: reqwest::Client,
    credentials: RwLock<Option<Credentials>>,
    token: RwLock<String>,
    stop: Notify,
}

/// HeaderProvider backed by the authority's token endpoints.
#[derive(Clone)]
pub struct TokenProvider {
    inner: Arc<Inner>,
}

impl TokenProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                base_url: base_url.to_string(),
                htc: reqwest::Client::new(),
                credentials: RwLock::new(None),
                token: RwLock::new(String::new()),
                stop: Notify::new(),
            }),
        }
    }

    #[cfg(test)]
    fn set_token_for_test(&self, token: &str) {
        *self.inner.token.write().unwrap() = token.to_string();
    }
}

impl Inner {
    /// Issue a fresh token with the api-key HMAC headers. Returns the new
    /// token TTL.
    async fn init_token(&self) -> Result<Duration> {
        info!("TokenProvider: initiating token");

        let (url, timestamp, signature, api_key_id) = {
            let guard = self.credentials.read().expect("credentials lock poisoned");
            let creds = guard
                .as_ref()
                .ok_or_else(|| AgentError::Internal("token provider not initiated".to_string()))?;

            let url = url_token(&self.base_url, &creds.workspace_id);
            let timestamp = Utc::now().timestamp().to_string();
            let sig = crypto::hmac_sum(&timestamp, "GET", &url, &creds.api_key_secret, b"")?;

            (url, timestamp, URL_SAFE_NO_PAD.encode(sig), creds.api_key_id.clone())
        };

        let mut headers = HeaderMap::new();
        headers.insert(API_TIMESTAMP_HEADER, header_value(&timestamp)?);
        headers.insert(API_KEY_HEADER, header_value(&api_key_id)?);
        headers.insert(API_SIGNATURE_HEADER, header_value(&signature)?);

        let resp = self
            .htc
            .get(&url)
            .headers(headers)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AgentError::Upstream(format!("token request failed: {}", e)))?
            .json::<GetTokenResponse>()
            .await?;

        let ttl = token_duration(&resp.token);
        if ttl.is_zero() {
            return Err(AgentError::Upstream("invalid token duration".to_string()));
        }

        *self.token.write().expect("token lock poisoned") = resp.token;

        debug!("TokenProvider: token validity {:?}", ttl / 2);
        Ok(ttl)
    }

    /// Refresh the current token. Returns the new TTL, or None when the
    /// refresh endpoint fails and a full re-issue is needed.
    async fn refresh_token(&self) -> Option<Duration> {
        let url = {
            let guard = self.credentials.read().expect("credentials lock poisoned");
            let creds = guard.as_ref()?;
            url_token_refresh(&self.base_url, &creds.workspace_id)
        };

        let resp = match self
            .htc
            .get(&url)
            .headers(self.current_auth_header())
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(r) => r,
            Err(e) => {
                error!("TokenProvider: error while refreshing token, err: {}", e);
                return None;
            }
        };

        let body = match resp.json::<GetTokenResponse>().await {
            Ok(b) => b,
            Err(e) => {
                error!("TokenProvider: bad refresh response, err: {}", e);
                return None;
            }
        };

        if body.token.is_empty() {
            error!("TokenProvider: empty token response");
            return None;
        }

        let ttl = token_duration(&body.token);
        *self.token.write().expect("token lock poisoned") = body.token;
        Some(ttl)
    }

    fn current_auth_header(&self) -> HeaderMap {
        let token = self.token.read().expect("token lock poisoned");

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&token) {
            headers.insert(AUTH_HEADER, value);
        }
        headers
    }
}

fn spawn_refresh_loop(inner: Arc<Inner>, initial_ttl: Duration) {
    tokio::spawn(async move {
        let mut ttl = initial_ttl;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(ttl / 2) => {
                    info!("TokenProvider: token expiring, refreshing");

                    match inner.refresh_token().await {
                        Some(new_ttl) if !new_ttl.is_zero() => ttl = new_ttl,
                        _ => {
                            // refresh failed, issue a new token
                            match inner.init_token().await {
                                Ok(new_ttl) => ttl = new_ttl,
                                Err(e) => {
                                    error!("TokenProvider: failed to initialize token, err: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }
                _ = inner.stop.notified() => break,
            }
        }

        info!("TokenProvider: stopped");
    });
}

#[async_trait]
impl HeaderProvider for TokenProvider {
    async fn initiate(&self, workspace_id: &str, api_key_secret: &str, api_key_id: &str) -> Result<()> {
        let secret = URL_SAFE_NO_PAD
            .decode(api_key_secret.trim_end_matches('='))
            .map_err(|e| AgentError::Validation(format!("invalid api key secret: {}", e)))?;

        *self.inner.credentials.write().expect("credentials lock poisoned") = Some(Credentials {
            workspace_id: workspace_id.to_string(),
            api_key_id: api_key_id.to_string(),
            api_key_secret: secret,
        });

        let ttl = self.inner.init_token().await.map_err(|e| {
            error!("failed to initialize token, err: {}", e);
            e
        })?;

        spawn_refresh_loop(Arc::clone(&self.inner), ttl);
        Ok(())
    }

    fn auth_header(&self) -> HeaderMap {
        self.inner.current_auth_header()
    }

    fn stop(&self) {
        self.inner.stop.notify_waiters();
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| AgentError::Internal(format!("invalid header value: {}", e)))
}

/// Remaining validity of a JWT, read from its `exp` claim. Returns zero for
/// anything that does not look like a three-segment token.
fn token_duration(token: &str) -> Duration {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Duration::ZERO;
    }

    let payload = match URL_SAFE_NO_PAD.decode(parts[1]) {
        Ok(p) => p,
        Err(_) => return Duration::ZERO,
    };

    let claims: serde_json::Value = match serde_json::from_slice(&payload) {
        Ok(c) => c,
        Err(_) => return Duration::ZERO,
    };

    let expiration = match claims.get("exp").and_then(|e| e.as_i64()) {
        Some(e) => e,
        None => return Duration::ZERO,
    };

    let remaining = expiration - Utc::now().timestamp();
    if remaining <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(remaining as u64)
    }
}
