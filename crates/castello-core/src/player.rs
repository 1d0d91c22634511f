//! Opaque player boundary
//!
//! The decode/render engine is not part of this crate. The receiver drives it
//! through [`Player`] and observes it through a stream of [`PlayerEvent`]s.

use crate::types::SourceDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a player implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    #[error("Player is not initialized")]
    NotInitialized,

    #[error("Source rejected: {0}")]
    SourceRejected(String),

    #[error("{operation} failed: {message}")]
    Command { operation: &'static str, message: String },

    #[error("Feature not supported")]
    FeatureNotSupported,
}

/// Media element ready state, ordered like the HTML media ready states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

impl ReadyState {
    /// Whether playback can continue without waiting for data
    pub fn can_play(&self) -> bool {
        *self >= ReadyState::HaveFutureData
    }
}

/// Category of a player error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerErrorKind {
    /// Key session or license fault raised by the CDM
    Drm,
    /// Decoder fault
    Decode,
    Network,
    Other,
}

/// Error reported through the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerErrorEvent {
    pub kind: PlayerErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl PlayerErrorEvent {
    pub fn new(kind: PlayerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Decode and key errors are eligible for the one-shot source reapply
    pub fn is_key_or_decode(&self) -> bool {
        matches!(self.kind, PlayerErrorKind::Drm | PlayerErrorKind::Decode)
    }
}

/// Player lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// The player accepted a new source
    SourceLoaded,
    /// Metadata (including duration) is available
    MetadataLoaded,
    Playing,
    Paused,
    /// Playback halted waiting for data
    Waiting,
    Seeking { target: f64 },
    Seeked,
    PlaybackFinished,
    Error(PlayerErrorEvent),
}

impl PlayerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerEvent::SourceLoaded => "source_loaded",
            PlayerEvent::MetadataLoaded => "metadata_loaded",
            PlayerEvent::Playing => "playing",
            PlayerEvent::Paused => "paused",
            PlayerEvent::Waiting => "waiting",
            PlayerEvent::Seeking { .. } => "seek",
            PlayerEvent::Seeked => "seeked",
            PlayerEvent::PlaybackFinished => "ended",
            PlayerEvent::Error(_) => "error",
        }
    }
}

/// Sender half handed to a player implementation
pub type PlayerEventSender = mpsc::UnboundedSender<PlayerEvent>;

/// Receiver half consumed by the session event loop
pub type PlayerEventStream = mpsc::UnboundedReceiver<PlayerEvent>;

/// Create a player event channel
pub fn event_channel() -> (PlayerEventSender, PlayerEventStream) {
    mpsc::unbounded_channel()
}

/// The opaque decode/render engine
#[async_trait]
pub trait Player: Send + Sync {
    /// Whether the engine finished its own initialization (EME setup etc.)
    fn is_initialized(&self) -> bool {
        true
    }

    /// Apply a source. Reapplying the same descriptor restarts its pipeline.
    async fn load(&self, source: &SourceDescriptor) -> Result<(), PlayerError>;

    async fn play(&self) -> Result<(), PlayerError>;

    async fn pause(&self) -> Result<(), PlayerError>;

    /// Stop playback and release the current source
    async fn unload(&self) -> Result<(), PlayerError>;

    async fn seek(&self, seconds: f64) -> Result<(), PlayerError>;

    async fn set_volume(&self, _level: f64) -> Result<(), PlayerError> {
        Err(PlayerError::FeatureNotSupported)
    }

    fn current_time(&self) -> f64;

    /// Media duration in seconds, `0` when unknown
    fn duration(&self) -> f64;

    fn is_paused(&self) -> bool;

    fn ready_state(&self) -> ReadyState;
}

/// Shared player handle
pub type PlayerHandle = Arc<dyn Player>;
