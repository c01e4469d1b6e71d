//! Session sources
//!
//! A [`SessionSource`] is the provider's "get current session" operation.
//! The coordinator decorates it with caching, coalescing and rate limiting;
//! the source itself only has to produce a session, sending whatever HTTP
//! it needs through the guarded [`HttpTransport`] it is handed.
//!
//! [`RestSessionSource`] talks to a GoTrue-style REST API: it keeps the
//! signed-in session in memory and exchanges its refresh token once the
//! access token is close to expiry.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use reserva_core::{
    config::ProviderConfig,
    domain::{Session, User},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{rate_limit::parse_retry_after, transport::HttpTransport, SessionError, SessionResult};

/// Path of the token endpoint relative to the provider base URL
const TOKEN_PATH: &str = "auth/v1/token";

/// Provider operation returning the current session
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Fetches the current session; `Ok(None)` when nobody is signed in.
    ///
    /// Every outbound request must go through `http`.
    async fn fetch_session(&self, http: &HttpTransport) -> SessionResult;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    expires_in: Option<i64>,
    /// Absolute expiry as unix seconds; preferred over `expires_in`
    #[serde(default)]
    expires_at: Option<i64>,
    refresh_token: String,
    #[serde(default)]
    user: Option<User>,
}

impl TokenResponse {
    fn into_session(self) -> Result<Session, SessionError> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc
                .timestamp_opt(at, 0)
                .single()
                .ok_or_else(|| SessionError::InvalidResponse(format!("bad expires_at {at}")))?,
            (None, Some(secs)) => chrono::Duration::try_seconds(secs)
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                .ok_or_else(|| SessionError::InvalidResponse(format!("bad expires_in {secs}")))?,
            (None, None) => {
                return Err(SessionError::InvalidResponse(
                    "token response has neither expires_at nor expires_in".to_string(),
                ))
            }
        };

        Ok(Session {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at,
            refresh_token: self.refresh_token,
            user: self.user,
        })
    }
}

/// Error body shapes the provider uses
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn into_message(self, status: StatusCode) -> String {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string())
    }
}

// ============================================================================
// RestSessionSource
// ============================================================================

/// Session source backed by the provider's REST token endpoint
#[derive(Debug)]
pub struct RestSessionSource {
    client: Client,
    token_url: Url,
    api_key: Option<String>,
    refresh_margin: chrono::Duration,
    stored: Mutex<Option<Session>>,
}

impl RestSessionSource {
    /// Creates a source with no signed-in session
    pub fn new(config: &ProviderConfig) -> Result<Self, url::ParseError> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let mut token_url = Url::parse(&base)?.join(TOKEN_PATH)?;
        token_url.set_query(Some("grant_type=refresh_token"));

        Ok(Self {
            client: Client::new(),
            token_url,
            api_key: config.api_key.clone(),
            refresh_margin: chrono::Duration::from_std(config.refresh_margin())
                .unwrap_or(chrono::Duration::MAX),
            stored: Mutex::new(None),
        })
    }

    /// Starts from a bare refresh token; the first fetch exchanges it
    pub fn with_refresh_token(self, refresh_token: impl Into<String>) -> Self {
        self.set_session(Session::from_refresh_token(refresh_token));
        self
    }

    fn stored(&self) -> MutexGuard<'_, Option<Session>> {
        self.stored.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the signed-in session (login)
    pub fn set_session(&self, session: Session) {
        *self.stored() = Some(session);
    }

    /// Forgets the signed-in session (logout)
    pub fn clear_session(&self) {
        *self.stored() = None;
    }

    /// The session currently held, without any network traffic
    pub fn current(&self) -> Option<Session> {
        self.stored().clone()
    }

    /// URL refresh-token exchanges are posted to
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    async fn refresh(&self, http: &HttpTransport, refresh_token: &str) -> SessionResult {
        let mut builder = self
            .client
            .post(self.token_url.clone())
            .json(&RefreshRequest { refresh_token });
        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }
        let request = builder.build()?;

        debug!(url = %self.token_url, "Exchanging refresh token");
        let response = http.execute(request).await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(SessionError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .unwrap_or_default()
                .into_message(status);

            if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
                warn!(status = status.as_u16(), %message, "Refresh token rejected, signing out");
                self.clear_session();
            }
            return Err(SessionError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let session = serde_json::from_str::<TokenResponse>(&body)
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?
            .into_session()?;

        info!(
            user_id = session.user_id().unwrap_or("unknown"),
            expires_at = %session.expires_at,
            "Session refreshed"
        );
        self.set_session(session.clone());
        Ok(Some(session))
    }
}

#[async_trait]
impl SessionSource for RestSessionSource {
    async fn fetch_session(&self, http: &HttpTransport) -> SessionResult {
        let Some(session) = self.current() else {
            return Ok(None);
        };

        if !session.expires_within(self.refresh_margin) {
            return Ok(Some(session));
        }

        self.refresh(http, &session.refresh_token).await
    }
}
