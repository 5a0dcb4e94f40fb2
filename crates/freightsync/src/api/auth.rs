//! Authentication and company lookup calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{RemoteApi, LOGIN_ENDPOINT};
use crate::error::{Error, Result};
use crate::session::{Session, SessionStore, UserInfo};

const REGISTER_ENDPOINT: &str = "/auth/register";
const REFRESH_ENDPOINT: &str = "/auth/refresh";
const ME_ENDPOINT: &str = "/auth/me";

/// Login form.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    /// Login email.
    pub email: String,
    /// Plain-text password, sent over TLS only.
    pub password: String,
}

/// Sign-up form.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    /// Login email.
    pub email: String,
    /// Chosen password.
    pub password: String,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Company to join.
    pub company_code: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "token")]
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    user: Option<UserInfo>,
}

impl TokenResponse {
    fn parse(endpoint: &str, body: Value) -> Result<Self> {
        serde_json::from_value(body).map_err(|e| Error::UnexpectedResponse {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    fn into_session(self, previous_user: Option<UserInfo>) -> Session {
        let expires_at = self.expires_at.or_else(|| {
            self.expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
        });
        Session {
            access_token: self.access_token,
            expires_at,
            user: self.user.or(previous_user),
        }
    }
}

/// Sign-in, sign-up, and token lifecycle.
#[derive(Debug, Clone)]
pub struct AuthClient {
    api: Arc<dyn RemoteApi>,
    session: Arc<SessionStore>,
}

impl AuthClient {
    /// Create a client storing tokens in `session`.
    #[must_use]
    pub fn new(api: Arc<dyn RemoteApi>, session: Arc<SessionStore>) -> Self {
        Self { api, session }
    }

    /// Sign in and persist the session.
    ///
    /// # Errors
    ///
    /// Returns the API error for rejected credentials, or an error if the
    /// session cannot be stored.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session> {
        let body = self
            .api
            .post(LOGIN_ENDPOINT, &serde_json::to_value(credentials)?)
            .await?;
        let session = TokenResponse::parse(LOGIN_ENDPOINT, body)?.into_session(None);
        self.session.save(session.clone())?;

        if session.user.is_some() {
            return Ok(session);
        }
        match self.me().await {
            Ok(user) => Ok(Session {
                user: Some(user),
                ..session
            }),
            Err(e) => {
                warn!(error = %e, "Signed in but could not load the user profile");
                Ok(session)
            }
        }
    }

    /// Create an account. Returns the session if the server signed the
    /// new user in directly.
    ///
    /// # Errors
    ///
    /// Returns the API error if the registration is rejected.
    pub async fn register(&self, registration: &Registration) -> Result<Option<Session>> {
        let body = self
            .api
            .post(REGISTER_ENDPOINT, &serde_json::to_value(registration)?)
            .await?;

        if body.get("access_token").is_none() && body.get("token").is_none() {
            info!(email = %registration.email, "Account registered");
            return Ok(None);
        }
        let session = TokenResponse::parse(REGISTER_ENDPOINT, body)?.into_session(None);
        self.session.save(session.clone())?;
        Ok(Some(session))
    }

    /// Exchange the current token for a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpired`] if there is no usable session.
    pub async fn refresh(&self) -> Result<Session> {
        let current = self
            .session
            .current()
            .filter(|_| self.session.is_authenticated())
            .ok_or(Error::SessionExpired)?;

        let body = self.api.post(REFRESH_ENDPOINT, &json!({})).await?;
        let session = TokenResponse::parse(REFRESH_ENDPOINT, body)?.into_session(current.user);
        self.session.save(session.clone())?;
        Ok(session)
    }

    /// Load the signed-in user and attach it to the session.
    ///
    /// # Errors
    ///
    /// Returns the API error, or [`Error::UnexpectedResponse`] for a
    /// malformed profile.
    pub async fn me(&self) -> Result<UserInfo> {
        let body = self.api.get(ME_ENDPOINT).await?;
        let user: UserInfo =
            serde_json::from_value(body).map_err(|e| Error::UnexpectedResponse {
                endpoint: ME_ENDPOINT.to_string(),
                message: e.to_string(),
            })?;
        self.session.set_user(user.clone())?;
        Ok(user)
    }

    /// Sign out locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be removed.
    pub fn logout(&self) -> Result<()> {
        self.session.clear()?;
        info!("Signed out");
        Ok(())
    }
}

/// Company lookups used during sign-up.
#[derive(Debug, Clone)]
pub struct CompanyClient {
    api: Arc<dyn RemoteApi>,
}

impl CompanyClient {
    /// Create a client.
    #[must_use]
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self { api }
    }

    /// Whether a company with `code` exists. A 404 answers `false`.
    ///
    /// # Errors
    ///
    /// Returns any API error other than not-found.
    pub async fn exists(&self, code: &str) -> Result<bool> {
        match self.api.get(&format!("/companies/{code}")).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{FakeApi, Reply};
    use reqwest::Method;

    fn clients() -> (Arc<FakeApi>, Arc<SessionStore>, AuthClient) {
        let api = Arc::new(FakeApi::new());
        let session = Arc::new(SessionStore::in_memory());
        let auth = AuthClient::new(api.clone(), Arc::clone(&session));
        (api, session, auth)
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "driver@example.com".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_with_user_in_response() {
        let (api, session, auth) = clients();
        api.reply(
            Method::POST,
            LOGIN_ENDPOINT,
            Reply::Json(json!({
                "access_token": "tok",
                "expires_in": 3600,
                "user": {"id": 1, "email": "driver@example.com"},
            })),
        );

        let signed_in = auth.login(&credentials()).await.unwrap();
        assert_eq!(signed_in.access_token, "tok");
        assert!(signed_in.expires_at.unwrap() > Utc::now());
        assert_eq!(session.token().as_deref(), Some("tok"));
        assert_eq!(api.call_count(), 1);
        assert_eq!(api.calls()[0].body.as_ref().unwrap()["email"], "driver@example.com");
    }

    #[tokio::test]
    async fn test_login_loads_profile_when_missing() {
        let (api, session, auth) = clients();
        api.reply(Method::POST, LOGIN_ENDPOINT, Reply::Json(json!({"token": "tok"})));
        api.reply(
            Method::GET,
            ME_ENDPOINT,
            Reply::Json(json!({"id": "9", "email": "driver@example.com", "company_code": "ACME"})),
        );

        let signed_in = auth.login(&credentials()).await.unwrap();
        assert_eq!(signed_in.user.unwrap().id, "9");
        assert_eq!(
            session.current().unwrap().user.unwrap().company_code.as_deref(),
            Some("ACME")
        );
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let (api, session, auth) = clients();
        api.reply(Method::POST, LOGIN_ENDPOINT, Reply::Status(400));

        assert!(auth.login(&credentials()).await.is_err());
        assert!(session.current().is_none());
    }

    #[tokio::test]
    async fn test_register_without_token() {
        let (api, session, auth) = clients();
        api.reply(
            Method::POST,
            REGISTER_ENDPOINT,
            Reply::Json(json!({"id": 3, "email": "new@example.com"})),
        );

        let registration = Registration {
            email: "new@example.com".to_string(),
            password: "pw".to_string(),
            name: None,
            company_code: "ACME".to_string(),
        };
        assert!(auth.register(&registration).await.unwrap().is_none());
        assert!(session.current().is_none());
        assert!(api.calls()[0].body.as_ref().unwrap().get("name").is_none());
    }

    #[tokio::test]
    async fn test_refresh_keeps_user() {
        let (api, session, auth) = clients();
        session
            .save(Session {
                access_token: "old".to_string(),
                expires_at: None,
                user: Some(UserInfo {
                    id: "1".to_string(),
                    email: "driver@example.com".to_string(),
                    name: None,
                    company_code: None,
                }),
            })
            .unwrap();
        api.reply(Method::POST, REFRESH_ENDPOINT, Reply::Json(json!({"access_token": "new"})));

        let refreshed = auth.refresh().await.unwrap();
        assert_eq!(refreshed.access_token, "new");
        assert_eq!(refreshed.user.unwrap().id, "1");
    }

    #[tokio::test]
    async fn test_refresh_requires_session() {
        let (api, _session, auth) = clients();
        assert!(matches!(auth.refresh().await, Err(Error::SessionExpired)));
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let (_api, session, auth) = clients();
        session
            .save(Session {
                access_token: "tok".to_string(),
                expires_at: None,
                user: None,
            })
            .unwrap();
        auth.logout().unwrap();
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_company_exists() {
        let api = Arc::new(FakeApi::new());
        api.reply(Method::GET, "/companies/ACME", Reply::Json(json!({"code": "ACME"})));
        api.reply(Method::GET, "/companies/NOPE", Reply::Status(404));
        api.reply(Method::GET, "/companies/DENY", Reply::Status(403));

        let companies = CompanyClient::new(api);
        assert!(companies.exists("ACME").await.unwrap());
        assert!(!companies.exists("NOPE").await.unwrap());
        assert!(companies.exists("DENY").await.unwrap_err().is_permission_error());
    }
}
