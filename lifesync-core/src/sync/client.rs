//! Remote client facade.
//!
//! [`RemoteClient`] is the seam between the sync engine and the backend. It
//! performs no caching or retries; the engine owns timeouts, retry and
//! fallback.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::error::RemoteError;
use super::protocol::{
    ErrorResponse, HealthResponse, QueryResponse, RemoteQuery, WriteOp, WriteResponse,
};
use crate::models::Record;

/// Default per-call timeout for HTTP requests.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Scoped read of one collection for one owner.
    async fn query(
        &self,
        collection: &str,
        owner: &str,
        query: &RemoteQuery,
    ) -> Result<QueryResponse, RemoteError>;

    /// Applies a single-record write and returns the stored record.
    async fn write(&self, collection: &str, owner: &str, op: &WriteOp)
        -> Result<Record, RemoteError>;

    /// Lightweight reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// HTTP client for the LifeSync server.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    server_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpRemoteClient {
    pub fn new(
        server_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        Ok(Self {
            server_url: server_url.into(),
            api_key,
            http,
            timeout,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Builds an HTTP URL from the configured server address.
    ///
    /// Accepts `http(s)://`, `ws(s)://` or a bare `host:port`.
    fn build_http_url(&self, path: &str) -> String {
        normalize_base_url(&self.server_url) + path
    }

    fn records_url(&self, collection: &str, owner: &str, action: &str) -> String {
        self.build_http_url(&format!(
            "/v1/records/{}/{}/{}",
            urlencoding::encode(collection),
            urlencoding::encode(owner),
            action
        ))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Unreachable(e.to_string())
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %response.url(), %status, "Server returned an error");
            return Err(error_from_response(status, response).await);
        }

        response.json::<T>().await.map_err(|e| self.transport_error(e))
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn query(
        &self,
        collection: &str,
        owner: &str,
        query: &RemoteQuery,
    ) -> Result<QueryResponse, RemoteError> {
        let url = self.records_url(collection, owner, "query");
        self.send_json(self.http.post(&url).json(query)).await
    }

    async fn write(
        &self,
        collection: &str,
        owner: &str,
        op: &WriteOp,
    ) -> Result<Record, RemoteError> {
        let url = self.records_url(collection, owner, "write");
        let response: WriteResponse = self.send_json(self.http.post(&url).json(op)).await?;
        Ok(response.record)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let url = self.build_http_url("/health");
        let health: HealthResponse = self.send_json(self.http.get(&url)).await?;
        if health.status == "ok" {
            Ok(())
        } else {
            Err(RemoteError::InvalidResponse(format!(
                "health status '{}'",
                health.status
            )))
        }
    }
}

async fn error_from_response(status: StatusCode, response: reqwest::Response) -> RemoteError {
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    RemoteError::from_status(status.as_u16(), message)
}

fn normalize_base_url(server_url: &str) -> String {
    let base_url = if let Some(rest) = server_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if let Some(rest) = server_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        format!("http://{}", server_url)
    } else {
        server_url.to_string()
    };
    base_url.trim_end_matches('/').to_string()
}

/// Stand-in used when no server is configured. Always unreachable, so the
/// engine runs purely against the local store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

#[async_trait]
impl RemoteClient for NoRemote {
    async fn query(
        &self,
        _collection: &str,
        _owner: &str,
        _query: &RemoteQuery,
    ) -> Result<QueryResponse, RemoteError> {
        Err(RemoteError::Unreachable("sync is not configured".into()))
    }

    async fn write(
        &self,
        _collection: &str,
        _owner: &str,
        _op: &WriteOp,
    ) -> Result<Record, RemoteError> {
        Err(RemoteError::Unreachable("sync is not configured".into()))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Err(RemoteError::Unreachable("sync is not configured".into()))
    }
}
