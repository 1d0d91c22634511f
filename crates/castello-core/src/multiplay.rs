//! Concurrent playback (multiplay) entitlement checks
//!
//! While a load carries an entitlement token, the token is posted to the
//! entitlement service on a fixed period. A refusal stops the checks and
//! signals the session, which unloads the player if the load that started
//! the checks is still the active one.

use crate::{
    config::ReceiverConfig,
    session::SessionSignal,
    state::SessionGuard,
    types::redact,
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

/// Fallback message when the service gives none
const DEFAULT_REJECTION_MESSAGE: &str = "Multiplay error detected";

/// Outcome of one entitlement check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementVerdict {
    pub accepted: bool,
    pub status: u16,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl EntitlementVerdict {
    /// Diagnostic code, falling back to the HTTP status
    pub fn code(&self) -> String {
        self.code.clone().unwrap_or_else(|| self.status.to_string())
    }

    pub fn message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| DEFAULT_REJECTION_MESSAGE.to_string())
    }

    /// The refusal as an [`Error::EntitlementRejected`]
    pub fn to_error(&self) -> Error {
        Error::EntitlementRejected {
            code: self.code(),
            message: self.message(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EntitlementRequest<'a> {
    #[serde(rename = "Cookies")]
    cookies: [Cookie<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Cookie<'a> {
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Value")]
    value: &'a str,
}

/// Entitlement service reply. Every field is optional; `message` is either
/// an object with `displayCode`/`code`/`text` or a bare string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementResponse {
    pub is_success: Option<bool>,
    pub message: Option<Value>,
    pub error_code: Option<Value>,
    pub code: Option<Value>,
}

impl EntitlementResponse {
    /// Interpret the reply. Refused on a non-2xx status or an explicit
    /// `isSuccess: false`.
    pub fn verdict(&self, status: u16) -> EntitlementVerdict {
        let accepted = (200..300).contains(&status) && self.is_success != Some(false);
        let message_field = |name: &str| self.message.as_ref().and_then(|m| m.get(name)).and_then(value_text);

        let code = message_field("displayCode")
            .or_else(|| self.error_code.as_ref().and_then(value_text))
            .or_else(|| message_field("code"))
            .or_else(|| self.code.as_ref().and_then(value_text));
        let message = match &self.message {
            Some(Value::String(text)) => Some(text.clone()),
            _ => message_field("text"),
        };

        EntitlementVerdict {
            accepted,
            status,
            code,
            message,
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Checks an entitlement token with the entitlement service
#[async_trait]
pub trait EntitlementClient: Send + Sync {
    async fn check(&self, token: &str) -> Result<EntitlementVerdict>;
}

/// reqwest-backed entitlement client
#[derive(Debug, Clone)]
pub struct HttpEntitlementClient {
    client: Client,
    endpoint: Url,
}

impl HttpEntitlementClient {
    pub fn new(endpoint: Url, config: &ReceiverConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl EntitlementClient for HttpEntitlementClient {
    async fn check(&self, token: &str) -> Result<EntitlementVerdict> {
        let body = EntitlementRequest {
            cookies: [Cookie { key: "token", value: token }],
        };
        let response = self.client.post(self.endpoint.clone()).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        let parsed: EntitlementResponse = if status.is_success() {
            serde_json::from_str(&text)?
        } else {
            serde_json::from_str(&text).unwrap_or_default()
        };
        debug!(status = status.as_u16(), is_success = ?parsed.is_success, "Entitlement check response");
        Ok(parsed.verdict(status.as_u16()))
    }
}

/// Token under periodic check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSession {
    #[serde(skip_serializing)]
    pub token: String,
    pub started_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

struct ActiveCheck {
    token: String,
    guard: Arc<RwLock<SessionGuard>>,
    handle: JoinHandle<()>,
}

/// Periodic entitlement checker for the active session
pub struct MultiplayValidator {
    client: Option<Arc<dyn EntitlementClient>>,
    period: Duration,
    signals: mpsc::UnboundedSender<SessionSignal>,
    active: Mutex<Option<ActiveCheck>>,
    entitlement: Arc<RwLock<Option<EntitlementSession>>>,
}

impl MultiplayValidator {
    /// `client` is `None` when no entitlement service is configured; tokens
    /// are then accepted without checks.
    pub fn new(
        client: Option<Arc<dyn EntitlementClient>>,
        period: Duration,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            client,
            period,
            signals,
            active: Mutex::new(None),
            entitlement: Arc::new(RwLock::new(None)),
        }
    }

    /// Start checking `token` on behalf of the load holding `guard`.
    ///
    /// Calling again with the same token while the checks run keeps their
    /// schedule and hands them the new guard; a different token replaces the
    /// old checks.
    pub async fn start(&self, token: &str, guard: SessionGuard) {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            let rejected = self.entitlement.read().await.is_none();
            if current.token == token && !current.handle.is_finished() && !rejected {
                debug!("Entitlement checks already running for token");
                *current.guard.write().await = guard;
                return;
            }
        }
        if let Some(previous) = active.take() {
            previous.handle.abort();
        }

        let Some(client) = self.client.clone() else {
            warn!(token = %redact(token), "No entitlement service configured, skipping multiplay checks");
            return;
        };

        *self.entitlement.write().await = Some(EntitlementSession {
            token: token.to_string(),
            started_at: Utc::now(),
            last_checked_at: None,
        });
        info!(token = %redact(token), period_ms = self.period.as_millis() as u64, "Starting multiplay checks");

        let guard = Arc::new(RwLock::new(guard));
        let handle = tokio::spawn(check_loop(
            client,
            token.to_string(),
            Arc::clone(&guard),
            self.period,
            Arc::clone(&self.entitlement),
            self.signals.clone(),
        ));
        *active = Some(ActiveCheck {
            token: token.to_string(),
            guard,
            handle,
        });
    }

    /// Stop checking and forget the token
    pub async fn stop(&self) {
        if let Some(active) = self.active.lock().await.take() {
            active.handle.abort();
            debug!("Multiplay checks stopped");
        }
        *self.entitlement.write().await = None;
    }

    /// Token the current checks were started for
    pub async fn token(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|a| a.token.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }

    pub async fn entitlement(&self) -> Option<EntitlementSession> {
        self.entitlement.read().await.clone()
    }
}

impl Drop for MultiplayValidator {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.handle.abort();
        }
    }
}

async fn check_loop(
    client: Arc<dyn EntitlementClient>,
    token: String,
    guard: Arc<RwLock<SessionGuard>>,
    period: Duration,
    entitlement: Arc<RwLock<Option<EntitlementSession>>>,
    signals: mpsc::UnboundedSender<SessionSignal>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let verdict = match client.check(&token).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "Entitlement check failed, will retry next period");
                continue;
            }
        };

        if verdict.accepted {
            if let Some(session) = entitlement.write().await.as_mut() {
                session.last_checked_at = Some(Utc::now());
            }
            debug!("Entitlement confirmed");
            continue;
        }

        error!(error = %verdict.to_error(), "Entitlement rejected, stopping checks");
        {
            let mut current = entitlement.write().await;
            if current.as_ref().is_some_and(|s| s.token == token) {
                *current = None;
            }
        }
        let guard = guard.read().await.clone();
        let _ = signals.send(SessionSignal::EntitlementRejected { guard, token, verdict });
        break;
    }
}
