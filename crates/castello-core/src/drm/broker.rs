//! License broker
//!
//! One broker exists per load. It tracks every license exchange in flight in
//! a [`PendingExchanges`] registry and applies the retry policy:
//!
//! - the first attempt runs under a deadline; missing it aborts the request
//! - after a license failure (deadline, error status, empty body, network),
//!   exactly one retry without a deadline is made, but only when no sibling
//!   exchange is still in flight and the load that created the broker is
//!   still current
//! - otherwise the original error propagates

use super::transport::{LicenseReply, LicenseRequest, LicenseTransport};
use crate::{state::SessionGuard, Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default deadline for the first attempt of a license exchange
pub const DEFAULT_LICENSE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// A license exchange in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLicenseRequest {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl PendingLicenseRequest {
    pub fn new(timeout: Duration) -> Self {
        let started_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(started_at);
        Self {
            id: Uuid::new_v4(),
            started_at,
            deadline,
        }
    }
}

/// Registry of license exchanges in flight, keyed by request id
#[derive(Debug, Default)]
pub struct PendingExchanges {
    inner: RwLock<HashMap<Uuid, PendingLicenseRequest>>,
}

impl PendingExchanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new exchange and return its entry
    pub async fn register(&self, timeout: Duration) -> PendingLicenseRequest {
        let request = PendingLicenseRequest::new(timeout);
        self.inner.write().await.insert(request.id, request.clone());
        request
    }

    /// Remove a finished exchange; returns false if it was not registered
    pub async fn complete(&self, id: &Uuid) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Counters for one broker
#[derive(Debug, Default)]
pub struct BrokerStats {
    exchanges: AtomicU64,
    retries: AtomicU64,
}

impl BrokerStats {
    /// First attempts started
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Retries issued
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }
}

/// Acquires license material for the key systems of one load
pub struct LicenseBroker {
    transport: Arc<dyn LicenseTransport>,
    pending: PendingExchanges,
    guard: Option<SessionGuard>,
    stats: BrokerStats,
}

impl LicenseBroker {
    /// Broker not tied to any load generation
    pub fn new(transport: Arc<dyn LicenseTransport>) -> Self {
        Self {
            transport,
            pending: PendingExchanges::new(),
            guard: None,
            stats: BrokerStats::default(),
        }
    }

    /// Broker whose retries stop once the load is replaced
    pub fn for_session(transport: Arc<dyn LicenseTransport>, guard: SessionGuard) -> Self {
        Self {
            guard: Some(guard),
            ..Self::new(transport)
        }
    }

    pub fn pending(&self) -> &PendingExchanges {
        &self.pending
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    /// Run one license exchange under the retry policy.
    ///
    /// Returns the license bytes unchanged.
    #[instrument(skip(self, request), fields(endpoint = %request.endpoint))]
    pub async fn acquire_license(&self, request: LicenseRequest, timeout: Duration) -> Result<Bytes> {
        let pending = self.pending.register(timeout).await;
        self.stats.exchanges.fetch_add(1, Ordering::SeqCst);
        debug!(request_id = %pending.id, deadline = %pending.deadline, "License exchange started");

        let first = tokio::time::timeout(timeout, self.exchange(&request)).await;
        self.pending.complete(&pending.id).await;

        let error = match first {
            Ok(Ok(license)) => {
                info!(request_id = %pending.id, bytes = license.len(), "License acquired");
                return Ok(license);
            }
            Ok(Err(e)) => e,
            Err(_) => Error::LicenseTimeout {
                timeout_ms: timeout.as_millis() as u64,
            },
        };
        warn!(request_id = %pending.id, error = %error, code = error.error_code(), "License exchange failed");

        if !error.is_license_failure() {
            return Err(error);
        }
        let in_flight = self.pending.len().await;
        if in_flight > 0 {
            warn!(in_flight = in_flight, "Sibling license exchange in flight, not retrying");
            return Err(error);
        }
        if let Some(guard) = &self.guard {
            if !guard.is_current() {
                debug!(generation = guard.generation(), "Load replaced, dropping license retry");
                return Err(error);
            }
        }

        self.stats.retries.fetch_add(1, Ordering::SeqCst);
        info!(request_id = %pending.id, "Retrying license request");
        match self.exchange(&request).await {
            Ok(license) => {
                info!(bytes = license.len(), "License acquired on retry");
                Ok(license)
            }
            Err(retry_error) => {
                warn!(error = %retry_error, "License retry failed");
                Err(retry_error)
            }
        }
    }

    /// One request/response cycle, classified
    async fn exchange(&self, request: &LicenseRequest) -> Result<Bytes> {
        let LicenseReply { status, body } = self.transport.send(request).await?;
        if !(200..300).contains(&status) {
            return Err(Error::LicenseHttp {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if body.is_empty() {
            return Err(Error::LicenseEmptyResponse);
        }
        Ok(body)
    }
}

impl std::fmt::Debug for LicenseBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseBroker")
            .field("guard", &self.guard)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{ScriptedTransport, Step};
    use super::*;
    use crate::state::MediaSession;
    use crate::types::LoadCommand;
    use url::Url;

    fn request() -> LicenseRequest {
        LicenseRequest::new(
            Url::parse("https://lic.example/v1?contentId=m1").unwrap(),
            "t1",
            vec![1u8, 2, 3],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_license_unchanged() {
        let transport = ScriptedTransport::new(vec![Step::ok(50, b"\x00license\xff")]);
        let broker = LicenseBroker::new(transport.clone());

        let license = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap();

        assert_eq!(license.as_ref(), b"\x00license\xff");
        assert_eq!(transport.calls(), 1);
        assert_eq!(broker.stats().retries(), 0);
        assert!(broker.pending().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_retries_exactly_once() {
        let transport = ScriptedTransport::new(vec![Step::status(10, 500), Step::ok(10, b"lic")]);
        let broker = LicenseBroker::new(transport.clone());

        let license = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap();

        assert_eq!(license.as_ref(), b"lic");
        assert_eq!(transport.calls(), 2);
        assert_eq!(broker.stats().retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failure_propagates_retry_error() {
        let transport = ScriptedTransport::new(vec![Step::status(10, 500), Step::status(10, 403)]);
        let broker = LicenseBroker::new(transport.clone());

        let err = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap_err();

        assert!(matches!(err, Error::LicenseHttp { status: 403, .. }));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_then_retries() {
        let transport = ScriptedTransport::new(vec![Step::ok(30_000, b"late"), Step::ok(10, b"lic")]);
        let broker = LicenseBroker::new(transport.clone());
        let started = tokio::time::Instant::now();

        let license = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap();

        assert_eq!(license.as_ref(), b"lic");
        assert_eq!(transport.calls(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(10_000));
        assert!(elapsed < Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_error_when_retry_also_fails() {
        let transport = ScriptedTransport::new(vec![Step::ok(30_000, b"late"), Step::ok(10, b"")]);
        let broker = LicenseBroker::new(transport.clone());

        let err = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap_err();

        assert!(matches!(err, Error::LicenseEmptyResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_while_sibling_in_flight() {
        // first exchange fails fast, second is still running when it does
        let transport = ScriptedTransport::new(vec![Step::status(10, 500), Step::ok(200, b"lic")]);
        let broker = LicenseBroker::new(transport.clone());

        let (a, b) = tokio::join!(
            broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT),
            broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT),
        );

        assert!(matches!(a, Err(Error::LicenseHttp { status: 500, .. })));
        assert_eq!(b.unwrap().as_ref(), b"lic");
        assert_eq!(transport.calls(), 2);
        assert_eq!(broker.stats().retries(), 0);
        assert!(broker.pending().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_is_failure() {
        let transport = ScriptedTransport::new(vec![Step::ok(10, b""), Step::ok(10, b"")]);
        let broker = LicenseBroker::new(transport.clone());

        let err = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap_err();

        assert!(matches!(err, Error::LicenseEmptyResponse));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_skips_retry() {
        let session = MediaSession::new();
        let guard = session.begin_load(LoadCommand::new("https://cdn/a.mpd", "dash")).await;
        let transport = ScriptedTransport::new(vec![Step::status(10, 500), Step::ok(10, b"lic")]);
        let broker = LicenseBroker::for_session(transport.clone(), guard);

        session.begin_load(LoadCommand::new("https://cdn/b.mpd", "dash")).await;
        let err = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap_err();

        assert!(matches!(err, Error::LicenseHttp { status: 500, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_license_failure_is_not_retried() {
        use std::sync::atomic::AtomicU32;

        struct BrokenTransport(AtomicU32);

        #[async_trait::async_trait]
        impl LicenseTransport for BrokenTransport {
            async fn send(&self, _request: &LicenseRequest) -> Result<LicenseReply> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(Error::Internal("transport closed".into()))
            }
        }

        let transport = Arc::new(BrokenTransport(AtomicU32::new(0)));
        let broker = LicenseBroker::new(transport.clone());

        let err = broker.acquire_license(request(), DEFAULT_LICENSE_TIMEOUT).await.unwrap_err();

        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stats().retries(), 0);
    }

    #[tokio::test]
    async fn test_pending_registry() {
        let pending = PendingExchanges::new();
        let a = pending.register(Duration::from_secs(10)).await;
        let b = pending.register(Duration::from_secs(10)).await;
        assert_ne!(a.id, b.id);
        assert_eq!(pending.len().await, 2);
        assert!(pending.contains(&a.id).await);
        assert!(a.deadline > a.started_at);

        assert!(pending.complete(&a.id).await);
        assert!(!pending.complete(&a.id).await);
        assert_eq!(pending.len().await, 1);
    }
}
