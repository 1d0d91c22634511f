//! License server transport

use crate::{config::ReceiverConfig, types::redact, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use tracing::debug;
use url::Url;

/// Content type of a raw binary key message
pub const OCTET_STREAM: &str = "application/octet-stream";

/// One license request as sent on the wire
#[derive(Clone)]
pub struct LicenseRequest {
    /// License URL including the content id query parameter
    pub endpoint: Url,
    /// Bearer credential
    pub ticket: String,
    /// Key message (or unwrapped challenge)
    pub body: Bytes,
    pub content_type: String,
    /// Extra headers requested by the key system
    pub headers: Vec<(String, String)>,
}

impl LicenseRequest {
    /// Binary key message request
    pub fn new(endpoint: Url, ticket: impl Into<String>, key_message: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            ticket: ticket.into(),
            body: key_message.into(),
            content_type: OCTET_STREAM.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl std::fmt::Debug for LicenseRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseRequest")
            .field("endpoint", &self.endpoint.as_str())
            .field("ticket", &redact(&self.ticket))
            .field("body_len", &self.body.len())
            .field("content_type", &self.content_type)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Raw license server reply; classification happens in the broker
#[derive(Debug, Clone)]
pub struct LicenseReply {
    pub status: u16,
    pub body: Bytes,
}

impl LicenseReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends license requests to a license server
#[async_trait]
pub trait LicenseTransport: Send + Sync {
    /// Perform one request and read the whole body, whatever the status
    async fn send(&self, request: &LicenseRequest) -> Result<LicenseReply>;
}

/// reqwest-backed license transport
#[derive(Debug, Clone)]
pub struct HttpLicenseTransport {
    client: Client,
    user_agent: String,
}

impl HttpLicenseTransport {
    /// Build a transport from receiver configuration.
    ///
    /// Only the connect phase is bounded here; the broker owns the
    /// per-attempt deadline.
    pub fn new(config: &ReceiverConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(client, config.user_agent.clone()))
    }

    pub fn with_client(client: Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl LicenseTransport for HttpLicenseTransport {
    async fn send(&self, request: &LicenseRequest) -> Result<LicenseReply> {
        let mut builder = self
            .client
            .post(request.endpoint.clone())
            .bearer_auth(&request.ticket)
            .header(CONTENT_TYPE, request.content_type.as_str())
            .header(USER_AGENT, self.user_agent.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body.clone()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        debug!(
            endpoint = %request.endpoint,
            status = status,
            bytes = body.len(),
            "License server replied"
        );

        Ok(LicenseReply { status, body })
    }
}
