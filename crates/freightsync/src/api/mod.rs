//! Remote API access.
//!
//! The sync processor and the data managers only see the [`RemoteApi`]
//! trait. [`HttpApi`] is the production implementation: a reqwest client
//! that attaches the session's bearer token and maps HTTP statuses onto the
//! crate's [`Error`] taxonomy.

pub mod auth;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::SessionStore;

pub use auth::{AuthClient, CompanyClient, Credentials, Registration};

/// Endpoint that must never clear the session on 401.
pub const LOGIN_ENDPOINT: &str = "/auth/login";

/// A JSON-over-HTTP API.
#[async_trait]
pub trait RemoteApi: Send + Sync + std::fmt::Debug {
    /// Send a request and return the decoded response body.
    ///
    /// An empty response body decodes to `Value::Null`.
    ///
    /// # Errors
    ///
    /// Returns the mapped error for transport failures and non-2xx statuses.
    async fn request(&self, method: Method, endpoint: &str, body: Option<&Value>)
        -> Result<Value>;

    /// GET `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`RemoteApi::request`].
    async fn get(&self, endpoint: &str) -> Result<Value> {
        self.request(Method::GET, endpoint, None).await
    }

    /// POST `body` to `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`RemoteApi::request`].
    async fn post(&self, endpoint: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, endpoint, Some(body)).await
    }
}

/// Fetch a collection endpoint and decode every item.
///
/// Accepts either a bare JSON array or an object wrapping it under
/// `results`, `data`, or `items`.
///
/// # Errors
///
/// Returns the request error, or [`Error::UnexpectedResponse`] if the body
/// is not a list of `T`.
pub async fn fetch_list<T: DeserializeOwned>(api: &dyn RemoteApi, endpoint: &str) -> Result<Vec<T>> {
    let body = api.get(endpoint).await?;
    decode_list(endpoint, body)
}

pub(crate) fn decode_list<T: DeserializeOwned>(endpoint: &str, body: Value) -> Result<Vec<T>> {
    let unexpected = |message: String| Error::UnexpectedResponse {
        endpoint: endpoint.to_string(),
        message,
    };

    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => ["results", "data", "items"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| unexpected("expected a list".to_string()))?,
        other => return Err(unexpected(format!("expected a list, got {other}"))),
    };

    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| unexpected(e.to_string())))
        .collect()
}

/// Production [`RemoteApi`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    session: Arc<SessionStore>,
}

impl HttpApi {
    /// Create a client for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration, session: Arc<SessionStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("freightsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &Config, session: Arc<SessionStore>) -> Result<Self> {
        Self::new(&config.api.base_url, config.request_timeout(), session)
    }

    /// The base URL every endpoint is joined to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The session supplying the bearer token.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn map_status(&self, status: StatusCode, endpoint: &str, body: &str) -> Error {
        match status {
            StatusCode::UNAUTHORIZED if endpoint != LOGIN_ENDPOINT => {
                if let Err(e) = self.session.clear() {
                    warn!(error = %e, "Failed to clear rejected session");
                }
                Error::SessionExpired
            }
            StatusCode::FORBIDDEN => Error::PermissionDenied,
            StatusCode::NOT_FOUND => Error::NotFound {
                endpoint: endpoint.to_string(),
            },
            _ => Error::api(status.as_u16(), error_message(status, body)),
        }
    }
}

/// Pull a human-readable message out of an error body.
fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ["detail", "message", "error"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str).map(String::from))
    });

    from_json.unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            trimmed.chars().take(200).collect()
        }
    })
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut request = self.client.request(method.clone(), self.url(endpoint));
        if let Some(token) = self.session.token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(%method, endpoint, "API request");
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(%method, endpoint, status = status.as_u16(), "API request rejected");
            return Err(self.map_status(status, endpoint, &text));
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| Error::UnexpectedResponse {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }
}
