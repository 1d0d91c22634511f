//! Receiver Session - orchestrator for one receiver
//!
//! Coordinates:
//! - Load commands from the transport
//! - Player lifecycle events
//! - Stall and entitlement timers
//! - Outbound events
//!
//! Every entry point takes the dispatch lock first, so load handling, player
//! events and timer signals never interleave.

use crate::{
    config::ReceiverConfig,
    drm::{HttpLicenseTransport, LicenseTransport},
    events::{EventEmitter, ReceiverEvent, ReceiverEventRecord},
    health::{PlaybackHealthMonitor, StallDecision},
    intercept::LoadRequestData,
    loader::{LoadOutcome, LoadRequestProcessor},
    multiplay::{EntitlementClient, EntitlementVerdict, HttpEntitlementClient, MultiplayValidator},
    player::{PlayerEvent, PlayerEventStream, PlayerHandle},
    state::{MediaSession, SessionGuard},
    types::{LoadCommand, ReceiverState, SessionId},
    Error, Result,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Signals from timers back into the session
#[derive(Debug, Clone)]
pub enum SessionSignal {
    /// A stall window expired without `playing`
    StallTimeout { guard: SessionGuard },
    /// The entitlement service refused `token`, checked for the load
    /// holding `guard`
    EntitlementRejected {
        guard: SessionGuard,
        token: String,
        verdict: EntitlementVerdict,
    },
}

struct Inbound {
    player_events: PlayerEventStream,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
}

/// A receiver bound to one player
pub struct ReceiverSession {
    id: SessionId,
    player: PlayerHandle,
    media: Arc<MediaSession>,
    loader: LoadRequestProcessor,
    health: PlaybackHealthMonitor,
    multiplay: MultiplayValidator,
    events: EventEmitter,
    dispatch: Mutex<()>,
    inbound: Mutex<Option<Inbound>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReceiverSession {
    /// Session with HTTP license transport and, when `entitlement_url` is
    /// configured, HTTP entitlement checks
    pub fn new(player: PlayerHandle, player_events: PlayerEventStream, config: ReceiverConfig) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn LicenseTransport> = Arc::new(HttpLicenseTransport::new(&config)?);
        let entitlement = match &config.entitlement_url {
            Some(url) => Some(Arc::new(HttpEntitlementClient::new(url.clone(), &config)?) as Arc<dyn EntitlementClient>),
            None => None,
        };
        Ok(Self::with_components(player, player_events, config, transport, entitlement))
    }

    /// Session with explicit transports
    pub fn with_components(
        player: PlayerHandle,
        player_events: PlayerEventStream,
        config: ReceiverConfig,
        transport: Arc<dyn LicenseTransport>,
        entitlement: Option<Arc<dyn EntitlementClient>>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let id = SessionId::new();
        let media = Arc::new(MediaSession::new());

        let health = PlaybackHealthMonitor::new(
            Arc::clone(&player),
            config.stall_timeout(),
            config.max_stall_reapplies,
            signal_tx.clone(),
        );
        let multiplay = MultiplayValidator::new(entitlement, config.multiplay_interval(), signal_tx);
        let loader = LoadRequestProcessor::new(Arc::clone(&player), Arc::clone(&media), transport, config);

        info!(session_id = %id, "Receiver session created");
        Self {
            id,
            player,
            media,
            loader,
            health,
            multiplay,
            events: EventEmitter::new(id),
            dispatch: Mutex::new(()),
            inbound: Mutex::new(Some(Inbound {
                player_events,
                signals: signal_rx,
            })),
            shutdown_tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn state(&self) -> ReceiverState {
        self.media.state().await
    }

    pub fn media(&self) -> &Arc<MediaSession> {
        &self.media
    }

    pub fn health(&self) -> &PlaybackHealthMonitor {
        &self.health
    }

    pub fn multiplay(&self) -> &MultiplayValidator {
        &self.multiplay
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Subscribe to outbound events
    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEventRecord> {
        self.events.subscribe()
    }

    /// Handle a LOAD request from the transport.
    ///
    /// Returns the request to acknowledge, or `None` if it was refused.
    pub async fn handle_load(&self, request: LoadRequestData) -> Option<LoadRequestData> {
        let command = match request.to_command() {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Refusing LOAD request");
                self.events
                    .emit(ReceiverEvent::LoadRejected {
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                    })
                    .await;
                return None;
            }
        };
        self.handle_command(command).await.is_accepted().then_some(request)
    }

    /// Handle an already normalized load command
    #[instrument(skip(self, command), fields(session_id = %self.id))]
    pub async fn handle_command(&self, command: LoadCommand) -> LoadOutcome {
        let _turn = self.dispatch.lock().await;

        if command.content_url.trim().is_empty() {
            let outcome = self.loader.on_load(command).await;
            if let Some(e) = outcome.error() {
                self.events
                    .emit(ReceiverEvent::LoadRejected {
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                    })
                    .await;
            }
            return outcome;
        }

        self.health.reset().await;
        self.events
            .emit(ReceiverEvent::LoadStarted {
                content_url: command.content_url.clone(),
            })
            .await;

        // checks for another token must not outlive the source they guard
        let token = command.token().map(str::to_string);
        if self.multiplay.token().await != token {
            self.multiplay.stop().await;
        }

        let outcome = self.loader.on_load(command).await;
        match &outcome {
            LoadOutcome::Accepted(source) => {
                if let Some(token) = token {
                    self.multiplay.start(&token, self.media.guard()).await;
                }
                self.events
                    .emit(ReceiverEvent::LoadSucceeded {
                        content_url: source.url.clone(),
                        duration: self.player.duration(),
                    })
                    .await;
            }
            LoadOutcome::Rejected(e) => {
                self.multiplay.stop().await;
                self.events
                    .emit(ReceiverEvent::LoadFailed {
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        outcome
    }

    /// Handle one player lifecycle event
    pub async fn handle_player_event(&self, event: PlayerEvent) {
        let _turn = self.dispatch.lock().await;
        debug!(event = event.name(), "Player event");

        match &event {
            PlayerEvent::MetadataLoaded => {
                self.loader.on_metadata_loaded().await;
                return;
            }
            PlayerEvent::Playing => {
                self.health.on_playing().await;
                self.loader.on_playing().await;
            }
            PlayerEvent::Waiting => {
                if self.media.state().await.has_active_source() {
                    self.health.on_waiting(self.media.guard()).await;
                }
                return;
            }
            PlayerEvent::PlaybackFinished => {
                self.health.cancel().await;
                self.loader.on_playback_finished().await;
            }
            PlayerEvent::Error(error) => {
                self.events
                    .emit(ReceiverEvent::PlayerError {
                        code: error.code.clone(),
                        message: error.message.clone(),
                    })
                    .await;
                match self.loader.on_player_error(error).await {
                    Ok(true) => self.events.emit(ReceiverEvent::DrmRecovery).await,
                    Ok(false) | Err(Error::StaleSession) => {}
                    Err(e) => self.report_teardown(&e, "reapply_failed").await,
                }
                return;
            }
            PlayerEvent::SourceLoaded | PlayerEvent::Paused | PlayerEvent::Seeking { .. } | PlayerEvent::Seeked => {}
        }

        self.events
            .emit(ReceiverEvent::Playback {
                kind: event.name().to_string(),
                current_time: self.player.current_time(),
                duration: self.player.duration(),
            })
            .await;
    }

    /// Handle one timer signal
    pub async fn handle_signal(&self, signal: SessionSignal) {
        let _turn = self.dispatch.lock().await;

        match signal {
            SessionSignal::StallTimeout { guard } => match self.health.evaluate(&guard).await {
                StallDecision::Reapply { attempt } => match self.loader.reapply(&guard, "stall").await {
                    Ok(()) => self.events.emit(ReceiverEvent::StallRecovery { attempt }).await,
                    Err(Error::StaleSession) => debug!("Stall recovery for a replaced session"),
                    Err(e) => self.report_teardown(&e, "reapply_failed").await,
                },
                StallDecision::GiveUp { attempts } => {
                    self.loader.teardown("stalled").await;
                    self.report_teardown(&Error::PlaybackStalled { attempts }, "stalled").await;
                }
                StallDecision::Recovered | StallDecision::Stale => {}
            },
            SessionSignal::EntitlementRejected { guard, token, verdict } => {
                if !guard.is_current() || self.media.entitlement_token().await.as_deref() != Some(token.as_str()) {
                    debug!(generation = guard.generation(), "Entitlement rejection for a replaced session");
                    return;
                }
                let error = verdict.to_error();
                self.health.reset().await;
                self.multiplay.stop().await;
                let generation = self.loader.teardown("entitlement_rejected").await;
                warn!(generation = generation, code = error.error_code(), error = %error, "Session stopped");
                self.events
                    .emit(ReceiverEvent::EntitlementRejected {
                        code: verdict.code(),
                        message: verdict.message(),
                    })
                    .await;
                self.events
                    .emit(ReceiverEvent::SessionReset {
                        reason: "entitlement_rejected".to_string(),
                    })
                    .await;
            }
        }
    }

    /// Report a source the loader already tore down
    async fn report_teardown(&self, error: &Error, reason: &str) {
        warn!(error = %error, code = error.error_code(), reason = reason, "Source torn down");
        self.health.reset().await;
        self.multiplay.stop().await;
        self.events
            .emit(ReceiverEvent::LoadFailed {
                code: error.error_code().to_string(),
                message: error.to_string(),
            })
            .await;
        self.events
            .emit(ReceiverEvent::SessionReset {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Tear the current source down and go idle
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn stop(&self) {
        let _turn = self.dispatch.lock().await;
        self.health.reset().await;
        self.multiplay.stop().await;
        self.loader.teardown("stop").await;
        self.events
            .emit(ReceiverEvent::SessionReset {
                reason: "stop".to_string(),
            })
            .await;
    }

    /// Event loop: player events and timer signals, in arrival order, until
    /// [`shutdown`](Self::shutdown) or the player event stream closes
    pub async fn run(&self) -> Result<()> {
        let Inbound {
            mut player_events,
            mut signals,
        } = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("receiver session is already running".into()))?;
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        info!(session_id = %self.id, "Receiver event loop started");

        loop {
            tokio::select! {
                event = player_events.recv() => match event {
                    Some(event) => self.handle_player_event(event).await,
                    None => {
                        info!("Player event stream closed");
                        break;
                    }
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                _ = shutdown.changed() => break,
            }
        }

        info!(session_id = %self.id, "Receiver event loop stopped");
        Ok(())
    }

    /// Run the event loop on a task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run().await })
    }

    /// Stop the source and end the event loop
    pub async fn shutdown(&self) {
        self.stop().await;
        let _ = self.shutdown_tx.send(true);
    }
}
