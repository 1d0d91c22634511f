//! Load request processing
//!
//! Validates load commands, tears down the previous source, derives the new
//! [`SourceDescriptor`] and hands it to the player. Also owns the two
//! per-load follow-ups: the one-shot start position seek and the single
//! source reapply after a key or decode error.

use crate::{
    config::ReceiverConfig,
    drm::{license_endpoint, KeySystemAdapter, KeySystemConfig, LicenseBroker, LicenseTransport, PlayReady, Widevine},
    player::{PlayerErrorEvent, PlayerHandle},
    seek,
    state::{MediaSession, SessionGuard},
    types::{ContainerType, DrmCustomData, LoadCommand, ReceiverState, SourceCandidates, SourceDescriptor},
    Error, Result,
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Result of handling a load command
#[derive(Debug)]
pub enum LoadOutcome {
    /// The player accepted the source
    Accepted(SourceDescriptor),
    /// The command was refused; the transport should report an error
    Rejected(Error),
}

impl LoadOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, LoadOutcome::Accepted(_))
    }

    pub fn source(&self) -> Option<&SourceDescriptor> {
        match self {
            LoadOutcome::Accepted(source) => Some(source),
            LoadOutcome::Rejected(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            LoadOutcome::Accepted(_) => None,
            LoadOutcome::Rejected(e) => Some(e),
        }
    }
}

/// Derive the player-ready source for a command.
///
/// With DRM data, one key system configuration is attached per supported
/// system, all sharing one broker bound to `guard`.
pub fn derive_source(
    command: &LoadCommand,
    transport: Arc<dyn LicenseTransport>,
    config: &ReceiverConfig,
    guard: Option<SessionGuard>,
) -> Result<SourceDescriptor> {
    if command.content_url.trim().is_empty() {
        return Err(Error::MissingContentUrl);
    }

    let url = if command.watch_from_start {
        seek::strip_trim_params(&command.content_url)
    } else {
        command.content_url.clone()
    };
    let container_type = ContainerType::from_content_type(&command.content_type);
    let candidates = SourceCandidates::for_container(container_type, &url);

    let key_systems = match &command.drm {
        Some(drm) => key_systems_for(drm, transport, config, guard)?,
        None => Vec::new(),
    };

    Ok(SourceDescriptor {
        url,
        content_type: command.content_type.clone(),
        container_type,
        candidates,
        key_systems,
    })
}

fn key_systems_for(
    drm: &DrmCustomData,
    transport: Arc<dyn LicenseTransport>,
    config: &ReceiverConfig,
    guard: Option<SessionGuard>,
) -> Result<Vec<KeySystemConfig>> {
    let endpoint = license_endpoint(&drm.license_server_url, &drm.media_id)?;
    let broker = Arc::new(match guard {
        Some(guard) => LicenseBroker::for_session(transport, guard),
        None => LicenseBroker::new(transport),
    });

    let mut adapters: Vec<Arc<dyn KeySystemAdapter>> = vec![Arc::new(Widevine)];
    if config.playready_enabled {
        adapters.push(Arc::new(PlayReady));
    }

    Ok(adapters
        .into_iter()
        .map(|adapter| {
            KeySystemConfig::new(
                adapter,
                endpoint.clone(),
                drm.ticket.clone(),
                Arc::clone(&broker),
                config.license_timeout(),
            )
        })
        .collect())
}

/// Turns load commands into active sources
pub struct LoadRequestProcessor {
    player: PlayerHandle,
    session: Arc<MediaSession>,
    transport: Arc<dyn LicenseTransport>,
    config: ReceiverConfig,
}

impl LoadRequestProcessor {
    pub fn new(
        player: PlayerHandle,
        session: Arc<MediaSession>,
        transport: Arc<dyn LicenseTransport>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            player,
            session,
            transport,
            config,
        }
    }

    pub fn session(&self) -> &Arc<MediaSession> {
        &self.session
    }

    pub fn player(&self) -> &PlayerHandle {
        &self.player
    }

    /// Handle one load command.
    ///
    /// A command without a URL is rejected before anything is touched, so
    /// whatever was playing keeps playing. Every other failure leaves the
    /// session idle with nothing applied.
    #[instrument(skip(self, command), fields(content_type = %command.content_type, drm = command.requires_drm()))]
    pub async fn on_load(&self, command: LoadCommand) -> LoadOutcome {
        let previous = self.session.state().await;
        if let Err(e) = self.session.set_state(ReceiverState::Validating).await {
            warn!(error = %e, "Load arrived while another load was configuring");
            return LoadOutcome::Rejected(e);
        }

        if command.content_url.trim().is_empty() {
            warn!("Rejecting load without content URL");
            if let Err(e) = self.session.set_state(previous).await {
                error!(error = %e, "Could not restore receiver state");
            }
            return LoadOutcome::Rejected(Error::MissingContentUrl);
        }

        let seek_target = seek::normalize_command(
            command.requested_seek_seconds,
            command.duration,
            command.watch_from_start,
        );
        let guard = self.session.begin_load(command.clone()).await;
        info!(
            generation = guard.generation(),
            seek = seek_target,
            watch_from_start = command.watch_from_start,
            "Configuring source"
        );

        match self.configure(&guard, &command, seek_target).await {
            Ok(source) => {
                info!(container = %source.container_type, key_systems = source.key_systems.len(), "Source loaded");
                LoadOutcome::Accepted(source)
            }
            Err(e) => {
                self.fail_load(&guard, &e).await;
                LoadOutcome::Rejected(e)
            }
        }
    }

    async fn configure(&self, guard: &SessionGuard, command: &LoadCommand, seek_target: f64) -> Result<SourceDescriptor> {
        if !self.player.is_initialized() {
            return Err(Error::PlayerInit("player instance is not initialized".into()));
        }

        // no two decode pipelines at once
        self.player.unload().await?;

        let source = self.build_source(command, guard)?;
        if seek_target > 0.0 {
            self.session.arm_seek(guard, seek_target).await;
        }

        self.player.load(&source).await?;
        if !self.session.activate(guard, source.clone()).await {
            return Err(Error::StaleSession);
        }
        self.session.set_state(ReceiverState::Playing).await?;

        if let Err(e) = self.player.play().await {
            warn!(error = %e, "Autoplay failed");
        }
        Ok(source)
    }

    async fn fail_load(&self, guard: &SessionGuard, cause: &Error) {
        error!(error = %cause, code = cause.error_code(), "Load failed");
        if !guard.is_current() {
            debug!("Failed load was already replaced");
            return;
        }
        if let Err(e) = self.session.set_state(ReceiverState::Rejected).await {
            warn!(error = %e, "Could not mark load as rejected");
        }
        if let Err(e) = self.player.unload().await {
            warn!(error = %e, "Unload after failed load failed");
        }
        self.session.reset().await;
    }

    /// Build the source for a command, with license retries bound to `guard`
    pub fn build_source(&self, command: &LoadCommand, guard: &SessionGuard) -> Result<SourceDescriptor> {
        derive_source(command, Arc::clone(&self.transport), &self.config, Some(guard.clone()))
    }

    /// Apply the pending start position once metadata is known.
    ///
    /// Returns the position sought to, if any.
    pub async fn on_metadata_loaded(&self) -> Option<f64> {
        let target = self.session.take_seek().await?;
        let duration = self.player.duration();
        if !seek::should_apply(target, duration) {
            debug!(target = target, duration = duration, "Skipping start position seek");
            return None;
        }
        match self.player.seek(target).await {
            Ok(()) => {
                info!(target = target, "Applied start position");
                Some(target)
            }
            Err(e) => {
                warn!(error = %e, target = target, "Start position seek failed");
                None
            }
        }
    }

    /// React to a player error. Key and decode errors on a protected source
    /// reapply it once per load; returns whether a reapply happened.
    ///
    /// A failed reapply has already torn the source down when this returns
    /// the error.
    pub async fn on_player_error(&self, event: &PlayerErrorEvent) -> Result<bool> {
        warn!(kind = ?event.kind, code = ?event.code, message = %event.message, "Player error");
        if !event.is_key_or_decode() {
            return Ok(false);
        }
        if self.session.claim_drm_recovery().await.is_none() {
            debug!("DRM recovery not available");
            return Ok(false);
        }

        let guard = self.session.guard();
        self.reapply(&guard, "drm_error").await?;
        Ok(true)
    }

    /// The player reports it is playing
    pub async fn on_playing(&self) {
        let state = self.session.state().await;
        if state.has_active_source() || state == ReceiverState::Configuring {
            if let Err(e) = self.session.set_state(ReceiverState::Playing).await {
                warn!(error = %e, "Could not enter playing");
            }
        }
    }

    /// Playback reached the end; the source stays loaded
    pub async fn on_playback_finished(&self) {
        if self.session.state().await.has_active_source() {
            if let Err(e) = self.session.set_state(ReceiverState::Idle).await {
                warn!(error = %e, "Could not enter idle");
            }
        }
    }

    /// Apply the active source again, unchanged.
    ///
    /// If the reapply fails while `guard` still owns the session, the player
    /// is unloaded and the session goes idle before the error is returned.
    #[instrument(skip(self, guard), fields(generation = guard.generation()))]
    pub async fn reapply(&self, guard: &SessionGuard, reason: &str) -> Result<()> {
        let result = self.apply_again(guard, reason).await;
        if let Err(e) = &result {
            if guard.is_current() {
                error!(error = %e, reason = reason, "Reapply failed");
                self.teardown("reapply_failed").await;
            }
        }
        result
    }

    async fn apply_again(&self, guard: &SessionGuard, reason: &str) -> Result<()> {
        if !guard.is_current() {
            return Err(Error::StaleSession);
        }
        let source = self
            .session
            .source()
            .await
            .ok_or_else(|| Error::Internal("no active source to reapply".into()))?;

        self.session.set_state(ReceiverState::Recovering).await?;
        info!(reason = reason, url = %source.url, "Reapplying source");
        self.player.load(&source).await?;
        if !guard.is_current() {
            return Err(Error::StaleSession);
        }
        self.player.play().await?;
        Ok(())
    }

    /// Unload the player and return the session to idle.
    ///
    /// Returns the new generation.
    #[instrument(skip(self))]
    pub async fn teardown(&self, reason: &str) -> u64 {
        if let Err(e) = self.player.unload().await {
            warn!(error = %e, "Unload during teardown failed");
        }
        let generation = self.session.reset().await;
        info!(reason = reason, generation = generation, "Session torn down");
        generation
    }
}
