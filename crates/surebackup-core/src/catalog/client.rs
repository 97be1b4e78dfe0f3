//! Token-authenticated REST client for the backup catalog service.
//!
//! Every call goes through the transient-retry loop. A rejected token
//! (`401`) triggers one re-authentication before the call is attempted again,
//! so a token expiring mid-run does not fail the run.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::error::CatalogError;
use super::retry::{retry_transient, retry_with, RetryPolicy};
use super::types::{
    Backup, CatalogRestorePoint, DataPage, Job, RestoreRequest, RestoreSession, TokenResponse,
};
use super::BackupCatalog;
use crate::config::CatalogConfig;

/// Refresh the token this long before the server says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Option<Instant>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// REST client for the backup catalog.
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    api_version: String,
    policy: RetryPolicy,
    token: RwLock<Option<AccessToken>>,
}

impl CatalogClient {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("surebackup/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CatalogError::Transport {
                message: format!("failed to build HTTP client: {e}"),
                retryable: false,
            })?;

        Ok(Self {
            http,
            base_url: config.server.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            api_version: config.api_version.clone(),
            policy: config.retry_policy(),
            token: RwLock::new(None),
        })
    }

    /// Override the retry policy (tests use millisecond backoff).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn token_url(&self) -> String {
        format!("{}/api/oauth2/token", self.base_url)
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Exchange credentials for an access token and cache it.
    ///
    /// Any failure is retried with backoff; exhausting the budget is fatal.
    pub async fn authenticate(&self) -> Result<String, CatalogError> {
        let response = retry_with(&self.policy, "authenticate", |_| true, |_| self.request_token())
            .await
            .map_err(|e| CatalogError::Auth(e.to_string()))?;

        let expires_at = response
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs).saturating_sub(TOKEN_EXPIRY_MARGIN));
        *self.token.write().await = Some(AccessToken {
            value: response.access_token.clone(),
            expires_at,
        });
        info!(server = %self.base_url, user = %self.username, "authenticated to backup catalog");
        Ok(response.access_token)
    }

    async fn request_token(&self) -> Result<TokenResponse, CatalogError> {
        let form = [
            ("grant_type", "password"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];
        let response = self
            .http
            .post(self.token_url())
            .header("x-api-version", &self.api_version)
            .form(&form)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))
    }

    async fn bearer(&self) -> Result<String, CatalogError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.is_fresh() {
                return Ok(token.value.clone());
            }
        }
        self.authenticate().await
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    /// Issue a request against `/api/v1/{endpoint}` and decode the JSON body.
    /// An empty body decodes to `Value::Null`.
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, CatalogError> {
        let response = self.send(method, endpoint, body).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| CatalogError::Decode(e.to_string()))
    }

    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T, CatalogError> {
        let value = self.call(method, endpoint, body).await?;
        serde_json::from_value(value).map_err(|e| CatalogError::Decode(e.to_string()))
    }

    /// Stream `GET /api/v1/{endpoint}` into `destination`. Returns bytes written.
    pub async fn download(&self, endpoint: &str, destination: &Path) -> Result<u64, CatalogError> {
        let mut response = self.send(Method::GET, endpoint, None).await?;
        let mut file = tokio::fs::File::create(destination).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(endpoint = %endpoint, bytes = written, path = %destination.display(), "download complete");
        Ok(written)
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Response, CatalogError> {
        let url = self.api_url(endpoint);
        let url = url.as_str();
        let mut reauthenticated = false;
        loop {
            let result = retry_transient(&self.policy, endpoint, |_| {
                self.send_once(method.clone(), url, body)
            })
            .await;
            match result {
                Err(CatalogError::Unauthorized) if !reauthenticated => {
                    debug!(endpoint = %endpoint, "access token rejected, re-authenticating");
                    self.invalidate_token().await;
                    reauthenticated = true;
                }
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, CatalogError> {
        let token = self.bearer().await?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("x-api-version", &self.api_version);
        if let Some(body) = body {
            request = request.json(body);
        }
        check_status(request.send().await?).await
    }
}

async fn check_status(response: Response) -> Result<Response, CatalogError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(CatalogError::from_response(status, body, retry_after))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct SessionRef {
    id: String,
}

#[async_trait]
impl BackupCatalog for CatalogClient {
    async fn authenticate(&self) -> Result<(), CatalogError> {
        CatalogClient::authenticate(self).await.map(|_| ())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, CatalogError> {
        let page: DataPage<Job> = self.call_json(Method::GET, "jobs", None).await?;
        Ok(page.data)
    }

    async fn list_backups(&self) -> Result<Vec<Backup>, CatalogError> {
        let page: DataPage<Backup> = self.call_json(Method::GET, "backups", None).await?;
        Ok(page.data)
    }

    async fn list_restore_points(
        &self,
        backup_id: &str,
    ) -> Result<Vec<CatalogRestorePoint>, CatalogError> {
        let endpoint = format!("backups/{backup_id}/restorePoints");
        let page: DataPage<CatalogRestorePoint> =
            self.call_json(Method::GET, &endpoint, None).await?;
        Ok(page.data)
    }

    async fn start_restore(&self, request: &RestoreRequest) -> Result<String, CatalogError> {
        let body = request.to_body();
        let session: SessionRef = self
            .call_json(Method::POST, "restoreSessions", Some(&body))
            .await?;
        Ok(session.id)
    }

    async fn get_restore_session(&self, session_id: &str) -> Result<RestoreSession, CatalogError> {
        let endpoint = format!("restoreSessions/{session_id}");
        self.call_json(Method::GET, &endpoint, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_join_cleanly() {
        let config = CatalogConfig {
            server: "https://vbr.local:9419/".to_string(),
            ..CatalogConfig::default()
        };
        let client = CatalogClient::new(&config).unwrap();
        assert_eq!(client.token_url(), "https://vbr.local:9419/api/oauth2/token");
        assert_eq!(
            client.api_url("/backups/b1/restorePoints"),
            "https://vbr.local:9419/api/v1/backups/b1/restorePoints"
        );
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }
}
