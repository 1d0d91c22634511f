//! Castello Core - load and DRM session engine for media receivers
//!
//! This crate sits between a casting transport and an opaque player:
//! - Load command normalization and source derivation
//! - Start position unit detection (seconds vs milliseconds)
//! - License brokering with a single-retry policy
//! - Stall detection and source reapply
//! - Periodic concurrent-playback (multiplay) entitlement checks
//! - Outbound receiver events and branding visibility
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Castello Core                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐                                               │
//! │  │   Message    │  LOAD / PLAY / PAUSE / STOP / SEEK            │
//! │  │ Interceptor  │                                               │
//! │  └──────┬───────┘                                               │
//! │         │                                                       │
//! │  ┌──────┴───────┐      ┌──────────────┐   ┌──────────────┐      │
//! │  │   Receiver   │──────│ LoadRequest  │───│   License    │      │
//! │  │   Session    │      │  Processor   │   │    Broker    │      │
//! │  └──┬────────┬──┘      └──────┬───────┘   └──────────────┘      │
//! │     │        │                │                                 │
//! │  ┌──┴─────┐ ┌┴──────────┐ ┌───┴──────────┐ ┌──────────────┐     │
//! │  │ Health │ │ Multiplay │ │ MediaSession │ │    Event     │     │
//! │  │Monitor │ │ Validator │ │ (generation) │ │   Emitter    │     │
//! │  └────────┘ └───────────┘ └──────────────┘ └──────────────┘     │
//! │                                                                 │
//! │                  Player (opaque, async trait)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod drm;
pub mod error;
pub mod events;
pub mod health;
pub mod intercept;
pub mod loader;
pub mod multiplay;
pub mod player;
pub mod seek;
pub mod session;
pub mod state;
pub mod types;

pub use config::ReceiverConfig;
pub use drm::{
    license_endpoint, HttpLicenseTransport, KeySystem, KeySystemAdapter, KeySystemConfig, LicenseBroker,
    LicenseTransport, PlayReady, Widevine,
};
pub use error::{Error, Result};
pub use events::{EventEmitter, ReceiverEvent, ReceiverEventRecord};
pub use health::{PlaybackHealthMonitor, SessionHealth, StallDecision};
pub use intercept::{LoadRequestData, MessageInterceptor, ReceiverMessage};
pub use loader::{derive_source, LoadOutcome, LoadRequestProcessor};
pub use multiplay::{EntitlementClient, EntitlementSession, EntitlementVerdict, HttpEntitlementClient, MultiplayValidator};
pub use player::{Player, PlayerError, PlayerEvent, PlayerHandle, ReadyState};
pub use session::{ReceiverSession, SessionSignal};
pub use state::{MediaSession, SessionGuard};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the receiver library
pub fn init() {
    tracing::info!(version = VERSION, "Castello Core initialized");
}
