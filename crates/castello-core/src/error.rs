//! Error types for Castello Core

use crate::player::PlayerError;
use thiserror::Error;

/// Result type alias for receiver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Receiver error types
#[derive(Error, Debug)]
pub enum Error {
    // Load request errors
    #[error("Load request has no content URL or content id")]
    MissingContentUrl,

    #[error("Invalid license server URL {url}: {source}")]
    InvalidLicenseUrl {
        url: String,
        source: url::ParseError,
    },

    // License exchange errors
    #[error("License request timed out after {timeout_ms}ms")]
    LicenseTimeout { timeout_ms: u64 },

    #[error("License request failed: {status} - {body}")]
    LicenseHttp { status: u16, body: String },

    #[error("Received empty license from server")]
    LicenseEmptyResponse,

    #[error("Malformed key message: {0}")]
    KeyMessage(String),

    #[error("Session was replaced before the operation completed")]
    StaleSession,

    // Playback errors
    #[error("Playback stalled after {attempts} recovery attempts")]
    PlaybackStalled { attempts: u32 },

    #[error("Entitlement rejected ({code}): {message}")]
    EntitlementRejected { code: String, message: String },

    #[error("Invalid receiver state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Player initialization failed: {0}")]
    PlayerInit(String),

    #[error("Player error: {0}")]
    Player(#[from] PlayerError),

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the failure is eligible for the license retry policy
    pub fn is_license_failure(&self) -> bool {
        matches!(
            self,
            Error::LicenseTimeout { .. }
                | Error::LicenseHttp { .. }
                | Error::LicenseEmptyResponse
                | Error::Network(_)
        )
    }

    /// Returns the error code reported to the sender
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::MissingContentUrl => "MISSING_CONTENT_ID",
            Error::InvalidLicenseUrl { .. } => "INVALID_LICENSE_URL",
            Error::LicenseTimeout { .. } => "LICENSE_TIMEOUT",
            Error::LicenseHttp { .. } => "LICENSE_HTTP",
            Error::LicenseEmptyResponse => "LICENSE_EMPTY",
            Error::KeyMessage(_) => "KEY_MESSAGE",
            Error::StaleSession => "STALE_SESSION",
            Error::PlaybackStalled { .. } => "PLAYBACK_STALLED",
            Error::EntitlementRejected { .. } => "ENTITLEMENT_REJECTED",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::PlayerInit(_) => "PLAYER_INIT",
            Error::Player(_) => "PLAYER",
            Error::Network(_) => "NETWORK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Json(_) => "JSON",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
        }
    }
}
