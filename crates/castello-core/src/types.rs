//! Core types for Castello

use crate::drm::KeySystemConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a receiver session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// DRM parameters carried in a load command's custom data.
///
/// A command only carries this value when the license server URL, media id
/// and ticket are all present; that is the sole "DRM required" predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrmCustomData {
    pub license_server_url: String,
    pub media_id: String,
    #[serde(skip_serializing)]
    pub ticket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlement_token: Option<String>,
}

impl DrmCustomData {
    /// Build DRM data from optional fields, returning `None` unless all
    /// three required fields are present and non-empty
    pub fn from_parts(
        license_server_url: Option<&str>,
        media_id: Option<&str>,
        ticket: Option<&str>,
        entitlement_token: Option<&str>,
    ) -> Option<Self> {
        let present = |v: Option<&str>| v.filter(|s| !s.trim().is_empty()).map(str::to_string);
        Some(Self {
            license_server_url: present(license_server_url)?,
            media_id: present(media_id)?,
            ticket: present(ticket)?,
            entitlement_token: present(entitlement_token),
        })
    }
}

/// A normalized load command, immutable once accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCommand {
    /// Media URL (or content id in the content-id variant)
    pub content_url: String,
    /// MIME type or free-form content type hint
    pub content_type: String,
    /// Media duration in seconds as announced by the sender
    pub duration: Option<f64>,
    /// Raw requested start position, seconds or milliseconds
    pub requested_seek_seconds: Option<f64>,
    /// DRM configuration, present only when DRM is required
    pub drm: Option<DrmCustomData>,
    /// Token for periodic entitlement checks
    #[serde(skip_serializing)]
    pub entitlement_token: Option<String>,
    /// Restart from the beginning regardless of the requested position
    pub watch_from_start: bool,
}

impl LoadCommand {
    /// Create a plain (non-DRM) load command
    pub fn new(content_url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            content_url: content_url.into(),
            content_type: content_type.into(),
            duration: None,
            requested_seek_seconds: None,
            drm: None,
            entitlement_token: None,
            watch_from_start: false,
        }
    }

    /// Attach DRM custom data
    pub fn with_drm(mut self, drm: DrmCustomData) -> Self {
        if self.entitlement_token.is_none() {
            self.entitlement_token = drm.entitlement_token.clone();
        }
        self.drm = Some(drm);
        self
    }

    /// Set the requested start position
    pub fn with_seek(mut self, raw: f64) -> Self {
        self.requested_seek_seconds = Some(raw);
        self
    }

    /// Set the announced media duration
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    /// Force playback from the start
    pub fn with_watch_from_start(mut self, watch_from_start: bool) -> Self {
        self.watch_from_start = watch_from_start;
        self
    }

    /// Set the entitlement token
    pub fn with_entitlement_token(mut self, token: impl Into<String>) -> Self {
        self.entitlement_token = Some(token.into());
        self
    }

    /// Whether a license exchange is needed to play this command
    pub fn requires_drm(&self) -> bool {
        self.drm.is_some()
    }

    /// Entitlement token, from the command or its DRM data
    pub fn token(&self) -> Option<&str> {
        self.entitlement_token
            .as_deref()
            .or_else(|| self.drm.as_ref().and_then(|d| d.entitlement_token.as_deref()))
    }
}

/// Streaming container inferred from the content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Dash,
    Hls,
    Smooth,
    /// No match; the player picks between the DASH and HLS candidates
    Auto,
}

impl ContainerType {
    /// Substring match against the content type, `dash` first
    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("dash") {
            ContainerType::Dash
        } else if ct.contains("hls") {
            ContainerType::Hls
        } else if ct.contains("smooth") || ct.contains("ism") {
            ContainerType::Smooth
        } else {
            ContainerType::Auto
        }
    }
}

impl std::fmt::Display for ContainerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerType::Dash => write!(f, "dash"),
            ContainerType::Hls => write!(f, "hls"),
            ContainerType::Smooth => write!(f, "smooth"),
            ContainerType::Auto => write!(f, "auto"),
        }
    }
}

/// Per-container source URLs handed to the player
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCandidates {
    pub dash: Option<String>,
    pub hls: Option<String>,
    pub smooth: Option<String>,
}

impl SourceCandidates {
    pub fn for_container(container: ContainerType, url: &str) -> Self {
        let url = Some(url.to_string());
        match container {
            ContainerType::Dash => Self { dash: url, ..Default::default() },
            ContainerType::Hls => Self { hls: url, ..Default::default() },
            ContainerType::Smooth => Self { smooth: url, ..Default::default() },
            ContainerType::Auto => Self {
                dash: url.clone(),
                hls: url,
                smooth: None,
            },
        }
    }
}

/// Fully resolved, player-ready description of what to play.
///
/// Derived from a [`LoadCommand`]; replaced wholesale on every load and never
/// mutated in place.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Final source URL after start/end stripping
    pub url: String,
    /// Content type as received
    pub content_type: String,
    /// Inferred container
    pub container_type: ContainerType,
    /// Candidate URLs per container
    pub candidates: SourceCandidates,
    /// One configuration per supported key system, empty for clear content
    pub key_systems: Vec<KeySystemConfig>,
}

impl SourceDescriptor {
    /// Whether this source needs a license exchange
    pub fn is_protected(&self) -> bool {
        !self.key_systems.is_empty()
    }

    /// Find the configuration for a key system
    pub fn key_system(&self, system: crate::drm::KeySystem) -> Option<&KeySystemConfig> {
        self.key_systems.iter().find(|k| k.system() == system)
    }

    /// Serializable view without license callbacks or secrets
    pub fn summary(&self) -> SourceSummary {
        SourceSummary {
            url: self.url.clone(),
            content_type: self.content_type.clone(),
            container_type: self.container_type,
            candidates: self.candidates.clone(),
            key_systems: self
                .key_systems
                .iter()
                .map(|k| KeySystemSummary {
                    system: k.system(),
                    license_url: k.license_url().to_string(),
                })
                .collect(),
        }
    }
}

/// Serializable summary of a [`SourceDescriptor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub url: String,
    pub content_type: String,
    pub container_type: ContainerType,
    pub candidates: SourceCandidates,
    pub key_systems: Vec<KeySystemSummary>,
}

/// Key system entry of a [`SourceSummary`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySystemSummary {
    pub system: crate::drm::KeySystem,
    pub license_url: String,
}

/// Receiver state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverState {
    /// Awaiting a load command
    Idle,
    /// Checking an incoming load command
    Validating,
    /// Tearing down the previous source and applying the new one
    Configuring,
    /// The last load failed during configuration
    Rejected,
    /// The player accepted the source
    Playing,
    /// The current source is being reapplied after a stall or key error
    Recovering,
}

impl ReceiverState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: ReceiverState) -> bool {
        use ReceiverState::*;
        matches!(
            (self, target),
            // A new load can start from any settled state
            (Idle, Validating) | (Playing, Validating) | (Recovering, Validating) | (Rejected, Validating) |
            // Validation failure returns to whatever was running before
            (Validating, Idle) | (Validating, Playing) | (Validating, Recovering) | (Validating, Rejected) |
            (Validating, Configuring) |
            // From Configuring
            (Configuring, Playing) | (Configuring, Rejected) |
            // From Playing
            (Playing, Recovering) | (Playing, Idle) |
            // From Recovering
            (Recovering, Playing) | (Recovering, Recovering) | (Recovering, Idle) |
            // From Rejected
            (Rejected, Idle)
        )
    }

    /// Whether a source is currently applied to the player
    pub fn has_active_source(&self) -> bool {
        matches!(self, ReceiverState::Playing | ReceiverState::Recovering)
    }
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverState::Idle => write!(f, "idle"),
            ReceiverState::Validating => write!(f, "validating"),
            ReceiverState::Configuring => write!(f, "configuring"),
            ReceiverState::Rejected => write!(f, "rejected"),
            ReceiverState::Playing => write!(f, "playing"),
            ReceiverState::Recovering => write!(f, "recovering"),
        }
    }
}

/// Shortens a secret for log output
pub(crate) fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(6).collect();
    format!("{}…({} chars)", prefix, secret.chars().count())
}
