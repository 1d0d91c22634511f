//! Inbound transport messages
//!
//! Serde model of the messages a sender delivers to the receiver, and the
//! interceptor that routes them. LOAD is turned into a [`LoadCommand`] and
//! handed to the session; the playback controls are observed and echoed.

use crate::{
    session::ReceiverSession,
    types::{DrmCustomData, LoadCommand},
    Error, Result,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Numbers, numeric strings or nothing; anything else reads as absent
fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

/// Only a literal `true` counts
fn strict_true<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(matches!(value, Some(Value::Bool(true))))
}

/// Sender-specific fields of a LOAD request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    #[serde(rename = "licenseServerURL", alias = "licenseServerUrl", alias = "licenseserver")]
    pub license_server_url: Option<String>,
    pub media_id: Option<String>,
    #[serde(skip_serializing)]
    pub drm_ticket: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    #[serde(default, deserialize_with = "strict_true")]
    pub watch_from_start: bool,
}

/// Media section of a LOAD request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInformation {
    pub content_id: Option<String>,
    pub content_url: Option<String>,
    pub content_type: Option<String>,
    pub stream_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub duration: Option<f64>,
    pub metadata: Option<Value>,
    pub custom_data: Option<CustomData>,
}

impl MediaInformation {
    /// `contentUrl`, or `contentId` when the sender puts the URL there
    pub fn source_url(&self) -> Option<&str> {
        fn non_empty(value: &Option<String>) -> Option<&str> {
            value.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }
        non_empty(&self.content_url).or_else(|| non_empty(&self.content_id))
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("title")?.as_str()
    }
}

/// LOAD request as delivered by the transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequestData {
    pub request_id: Option<u64>,
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub current_time: Option<f64>,
    pub media: Option<MediaInformation>,
}

impl LoadRequestData {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Normalize into a load command. Fails only when there is no URL.
    pub fn to_command(&self) -> Result<LoadCommand> {
        let media = self.media.as_ref().ok_or(Error::MissingContentUrl)?;
        let url = media.source_url().ok_or(Error::MissingContentUrl)?;
        let custom = media.custom_data.clone().unwrap_or_default();

        let mut command = LoadCommand::new(url, media.content_type.clone().unwrap_or_default())
            .with_watch_from_start(custom.watch_from_start);
        if let Some(duration) = media.duration {
            command = command.with_duration(duration);
        }
        if let Some(position) = self.current_time {
            command = command.with_seek(position);
        }
        if let Some(drm) = DrmCustomData::from_parts(
            custom.license_server_url.as_deref(),
            custom.media_id.as_deref(),
            custom.drm_ticket.as_deref(),
            custom.token.as_deref(),
        ) {
            command = command.with_drm(drm);
        }
        if let Some(token) = custom.token.as_deref().filter(|t| !t.trim().is_empty()) {
            command = command.with_entitlement_token(token);
        }
        Ok(command)
    }
}

/// Payload of a playback control message, kept verbatim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Messages the receiver intercepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverMessage {
    Load(LoadRequestData),
    Play(ControlRequest),
    Pause(ControlRequest),
    Stop(ControlRequest),
    Seek(ControlRequest),
    SetVolume(ControlRequest),
    MediaStatus(ControlRequest),
}

impl ReceiverMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ReceiverMessage::Load(_) => "LOAD",
            ReceiverMessage::Play(_) => "PLAY",
            ReceiverMessage::Pause(_) => "PAUSE",
            ReceiverMessage::Stop(_) => "STOP",
            ReceiverMessage::Seek(_) => "SEEK",
            ReceiverMessage::SetVolume(_) => "SET_VOLUME",
            ReceiverMessage::MediaStatus(_) => "MEDIA_STATUS",
        }
    }
}

/// Routes transport messages to the session
pub struct MessageInterceptor {
    session: Arc<ReceiverSession>,
}

impl MessageInterceptor {
    pub fn new(session: Arc<ReceiverSession>) -> Self {
        Self { session }
    }

    /// Returns the message to acknowledge, or `None` to make the transport
    /// report an error to the sender
    pub async fn intercept(&self, message: ReceiverMessage) -> Option<ReceiverMessage> {
        match message {
            ReceiverMessage::Load(request) => {
                info!(request_id = ?request.request_id, "LOAD request received");
                self.session.handle_load(request).await.map(ReceiverMessage::Load)
            }
            ReceiverMessage::Seek(ref request) => {
                debug!(
                    current_time = ?request.fields.get("currentTime"),
                    resume_state = ?request.fields.get("resumeState"),
                    "SEEK request received"
                );
                Some(message)
            }
            ReceiverMessage::SetVolume(ref request) => {
                debug!(volume = ?request.fields.get("volume"), "SET_VOLUME request received");
                Some(message)
            }
            other => {
                debug!(message_type = other.message_type(), "Control request received");
                Some(other)
            }
        }
    }

    /// Parse and intercept a raw JSON message
    pub async fn intercept_json(&self, raw: &str) -> Result<Option<ReceiverMessage>> {
        let message: ReceiverMessage = serde_json::from_str(raw).map_err(|e| {
            warn!(error = %e, "Unparseable transport message");
            Error::from(e)
        })?;
        Ok(self.intercept(message).await)
    }
}
