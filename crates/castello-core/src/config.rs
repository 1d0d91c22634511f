//! Receiver configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Receiver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReceiverConfig {
    /// Deadline for the first attempt of a license exchange (milliseconds)
    pub license_timeout_ms: u64,
    /// Time a `waiting` player may go without `playing` before the source
    /// is reapplied (milliseconds)
    pub stall_timeout_ms: u64,
    /// Consecutive stall reapplies before the session is torn down
    /// (`None` = keep reapplying until recovery or a new load)
    pub max_stall_reapplies: Option<u32>,
    /// Entitlement check period (milliseconds)
    pub multiplay_interval_ms: u64,
    /// Entitlement check endpoint; multiplay checks are disabled without it
    pub entitlement_url: Option<Url>,
    /// Request timeout for entitlement checks and connect timeout for
    /// license requests (milliseconds)
    pub request_timeout_ms: u64,
    /// Attach a PlayReady configuration next to Widevine
    pub playready_enabled: bool,
    /// User agent for outbound HTTP requests
    pub user_agent: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            license_timeout_ms: 10_000,
            stall_timeout_ms: 10_000,
            max_stall_reapplies: None,
            multiplay_interval_ms: 60_000,
            entitlement_url: None,
            request_timeout_ms: 10_000,
            playready_enabled: true,
            user_agent: format!("castello/{}", crate::VERSION),
        }
    }
}

impl ReceiverConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a timer by accident
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("licenseTimeoutMs", self.license_timeout_ms),
            ("stallTimeoutMs", self.stall_timeout_ms),
            ("multiplayIntervalMs", self.multiplay_interval_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be greater than zero", name)));
            }
        }
        if let Some(url) = &self.entitlement_url {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::InvalidConfig(format!(
                    "entitlementUrl must be http(s), got {}",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }

    pub fn license_timeout(&self) -> Duration {
        Duration::from_millis(self.license_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn multiplay_interval(&self) -> Duration {
        Duration::from_millis(self.multiplay_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
