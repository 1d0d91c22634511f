//! Media session state
//!
//! The single record of what the receiver is currently doing. Every load
//! bumps a generation counter; timers, one-shot listeners and license retries
//! capture a [`SessionGuard`] and become no-ops once their generation is gone.

use crate::{
    types::{LoadCommand, ReceiverState, SourceDescriptor},
    Error, Result,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Capability tied to one load generation
#[derive(Debug, Clone)]
pub struct SessionGuard {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl SessionGuard {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once a newer load or a teardown replaced this generation
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

/// Seek waiting for the first metadata event of its generation
#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingSeek {
    generation: u64,
    target_seconds: f64,
}

#[derive(Debug)]
struct SessionRecord {
    state: ReceiverState,
    command: Option<LoadCommand>,
    source: Option<SourceDescriptor>,
    pending_seek: Option<PendingSeek>,
    drm_recovery_used: bool,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            state: ReceiverState::Idle,
            command: None,
            source: None,
            pending_seek: None,
            drm_recovery_used: false,
        }
    }
}

/// Process-wide media session record
#[derive(Debug)]
pub struct MediaSession {
    generation: Arc<AtomicU64>,
    record: RwLock<SessionRecord>,
}

impl MediaSession {
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            record: RwLock::new(SessionRecord::default()),
        }
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Guard for the current generation
    pub fn guard(&self) -> SessionGuard {
        SessionGuard {
            generation: self.generation(),
            current: Arc::clone(&self.generation),
        }
    }

    pub async fn state(&self) -> ReceiverState {
        self.record.read().await.state
    }

    /// Transition to a new state, rejecting transitions the state machine
    /// does not allow
    pub async fn set_state(&self, new_state: ReceiverState) -> Result<()> {
        let mut record = self.record.write().await;
        let current = record.state;
        if current == new_state {
            return Ok(());
        }
        if !current.can_transition_to(new_state) {
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: new_state.to_string(),
            });
        }
        record.state = new_state;
        debug!(from = %current, to = %new_state, "Receiver state transition");
        Ok(())
    }

    /// Start a new generation for an accepted load command.
    ///
    /// Drops the previous command, source, pending seek and recovery flag.
    pub async fn begin_load(&self, command: LoadCommand) -> SessionGuard {
        let mut record = self.record.write().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        record.command = Some(command);
        record.source = None;
        record.pending_seek = None;
        record.drm_recovery_used = false;
        record.state = ReceiverState::Configuring;
        info!(generation = generation, "Load generation started");
        SessionGuard {
            generation,
            current: Arc::clone(&self.generation),
        }
    }

    /// Make a source active if its generation is still current
    pub async fn activate(&self, guard: &SessionGuard, source: SourceDescriptor) -> bool {
        let mut record = self.record.write().await;
        if !guard.is_current() {
            return false;
        }
        record.source = Some(source);
        true
    }

    /// Register the one-shot seek for this generation
    pub async fn arm_seek(&self, guard: &SessionGuard, target_seconds: f64) {
        let mut record = self.record.write().await;
        if guard.is_current() {
            record.pending_seek = Some(PendingSeek {
                generation: guard.generation(),
                target_seconds,
            });
        }
    }

    /// Consume the pending seek if it belongs to the current generation
    pub async fn take_seek(&self) -> Option<f64> {
        let mut record = self.record.write().await;
        let pending = record.pending_seek.take()?;
        if pending.generation == self.generation() {
            Some(pending.target_seconds)
        } else {
            None
        }
    }

    /// Claim the single DRM error recovery for the current generation
    pub async fn claim_drm_recovery(&self) -> Option<SourceDescriptor> {
        let mut record = self.record.write().await;
        if record.drm_recovery_used {
            return None;
        }
        let source = record.source.clone().filter(|s| s.is_protected())?;
        record.drm_recovery_used = true;
        Some(source)
    }

    /// Active source
    pub async fn source(&self) -> Option<SourceDescriptor> {
        self.record.read().await.source.clone()
    }

    /// Command that produced the active generation
    pub async fn command(&self) -> Option<LoadCommand> {
        self.record.read().await.command.clone()
    }

    /// Entitlement token of the active command
    pub async fn entitlement_token(&self) -> Option<String> {
        self.record
            .read()
            .await
            .command
            .as_ref()
            .and_then(|c| c.token().map(str::to_string))
    }

    /// Drop everything and return to Idle under a fresh generation.
    ///
    /// Outstanding guards become stale.
    pub async fn reset(&self) -> u64 {
        let mut record = self.record.write().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *record = SessionRecord::default();
        info!(generation = generation, "Media session reset");
        generation
    }
}

impl Default for MediaSession {
    fn default() -> Self {
        Self::new()
    }
}
