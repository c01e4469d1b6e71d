//! Session command - fetch the current session through the coordinator
//!
//! Provides the `reserva session` CLI command which:
//! 1. Builds a coordinator from the configuration and a refresh token
//! 2. Issues `--callers` concurrent `get_session()` calls
//! 3. Reports how many requests actually reached the provider and the
//!    resulting session

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use futures_util::future::join_all;
use reqwest::{Client, Request, Response};
use reserva_auth::{
    source::RestSessionSource, transport::RawTransport, SessionRefreshCoordinator, SessionResult,
};
use reserva_core::{config::Config, domain::Session};
use tracing::info;

use crate::output::{get_formatter, OutputFormat};

/// Environment variable read when `--refresh-token` is not given
const REFRESH_TOKEN_ENV: &str = "RESERVA_REFRESH_TOKEN";

#[derive(Debug, Args)]
pub struct SessionCommand {
    /// Number of concurrent callers asking for the session
    #[arg(long, default_value_t = 5)]
    callers: usize,

    /// Refresh token to start from (defaults to $RESERVA_REFRESH_TOKEN)
    #[arg(long)]
    refresh_token: Option<String>,

    /// Override provider.base_url
    #[arg(long)]
    base_url: Option<String>,

    /// Override provider.api_key
    #[arg(long)]
    api_key: Option<String>,
}

/// Raw transport that counts the requests it sends
struct CountingTransport {
    client: Client,
    sent: AtomicUsize,
}

#[async_trait]
impl RawTransport for CountingTransport {
    async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.client.execute(request).await
    }
}

impl SessionCommand {
    /// Execute the session command
    pub async fn execute(&self, config: &Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        let mut provider = config.provider.clone();
        if let Some(base_url) = &self.base_url {
            provider.base_url = base_url.clone();
        }
        if let Some(api_key) = &self.api_key {
            provider.api_key = Some(api_key.clone());
        }

        let refresh_token = self
            .refresh_token
            .clone()
            .or_else(|| std::env::var(REFRESH_TOKEN_ENV).ok())
            .with_context(|| {
                format!("No refresh token given; pass --refresh-token or set {REFRESH_TOKEN_ENV}")
            })?;

        let source = RestSessionSource::new(&provider)
            .with_context(|| format!("Invalid provider base URL '{}'", provider.base_url))?
            .with_refresh_token(refresh_token);
        let raw = Arc::new(CountingTransport {
            client: Client::new(),
            sent: AtomicUsize::new(0),
        });
        let coordinator =
            SessionRefreshCoordinator::new(config.session.clone(), Arc::new(source), raw.clone());

        let callers = self.callers.max(1);
        info!(callers, base_url = %provider.base_url, "Requesting session");
        let results = join_all((0..callers).map(|_| coordinator.get_session())).await;

        let requests = raw.sent.load(Ordering::SeqCst);
        let snapshot = coordinator.rate_limit_snapshot();
        let failures = results.iter().filter(|r| r.is_err()).count();
        let first = results
            .into_iter()
            .next()
            .context("No session result was produced")?;

        if format.is_json() {
            formatter.print_json(&summary_json(callers, requests, failures, &first));
            if let Err(e) = &first {
                anyhow::bail!("Session fetch failed: {e}");
            }
            return Ok(());
        }

        match &first {
            Ok(Some(session)) => {
                formatter.success("Session available");
                print_session(formatter.as_ref(), session);
            }
            Ok(None) => formatter.warn("No signed-in user"),
            Err(_) => formatter.error("Session fetch failed"),
        }
        formatter.info("");
        formatter.field("Callers", &callers.to_string());
        formatter.field("Requests sent", &requests.to_string());
        formatter.field("Failed callers", &failures.to_string());
        if snapshot.is_rate_limited {
            formatter.warn(&format!(
                "Provider rate limit active (backoff {:?})",
                snapshot.backoff_time
            ));
        }

        if let Err(e) = first {
            anyhow::bail!("Session fetch failed: {e}");
        }
        Ok(())
    }
}

fn print_session(formatter: &dyn crate::output::OutputFormatter, session: &Session) {
    formatter.field("User", session.user_id().unwrap_or("unknown"));
    if let Some(email) = session.user.as_ref().and_then(|u| u.email.as_deref()) {
        formatter.field("Email", email);
    }
    formatter.field("Token type", &session.token_type);
    formatter.field("Expires at", &session.expires_at.to_rfc3339());
}

/// JSON summary of one run; tokens are never included
fn summary_json(
    callers: usize,
    requests: usize,
    failures: usize,
    result: &SessionResult,
) -> serde_json::Value {
    let (session, error) = match result {
        Ok(Some(session)) => (
            serde_json::json!({
                "user_id": session.user_id(),
                "email": session.user.as_ref().and_then(|u| u.email.clone()),
                "token_type": session.token_type,
                "expires_at": session.expires_at.to_rfc3339(),
            }),
            serde_json::Value::Null,
        ),
        Ok(None) => (serde_json::Value::Null, serde_json::Value::Null),
        Err(e) => (serde_json::Value::Null, serde_json::json!(e.to_string())),
    };

    serde_json::json!({
        "success": result.is_ok(),
        "callers": callers,
        "requests": requests,
        "failed_callers": failures,
        "session": session,
        "error": error,
    })
}
