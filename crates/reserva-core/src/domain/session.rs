//! Session domain types
//!
//! A [`Session`] is the provider's representation of a signed-in user: a
//! bearer token, the refresh token used to renew it, and when it expires.
//! The coordinator treats it as an opaque value apart from the expiry check.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity attached to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Provider-assigned user ID
    pub id: String,
    /// Primary email address, if the provider exposes one
    #[serde(default)]
    pub email: Option<String>,
}

/// An authenticated user context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token for authenticating API requests
    pub access_token: String,
    /// Token type reported by the provider (normally "bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// When the access token expires
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    /// Token exchanged for a new access token once this one expires
    pub refresh_token: String,
    /// The signed-in user, when the provider includes it
    #[serde(default)]
    pub user: Option<User>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// Builds a session that only carries a refresh token.
    ///
    /// The access token is empty and already expired, so the first fetch
    /// performs a refresh-token exchange.
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            token_type: default_token_type(),
            expires_at: DateTime::<Utc>::default(),
            refresh_token: refresh_token.into(),
            user: None,
        }
    }

    /// Returns true if the access token has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns true if the access token will expire within the given duration
    pub fn expires_within(&self, duration: Duration) -> bool {
        Utc::now()
            .checked_add_signed(duration)
            .map_or(true, |deadline| deadline >= self.expires_at)
    }

    /// ID of the signed-in user, if known
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }
}
