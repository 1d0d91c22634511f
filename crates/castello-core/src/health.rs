//! Playback health monitoring
//!
//! Watches `waiting`/`playing` transitions. A player that keeps waiting for
//! longer than the stall window without reaching a playable ready state gets
//! its source reapplied.

use crate::{
    player::PlayerHandle,
    session::SessionSignal,
    state::SessionGuard,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Snapshot of the health of the active source
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    /// Last `playing` transition
    pub last_playing_at: Option<DateTime<Utc>>,
    /// Start of the current stall, if any
    pub stalled_since: Option<DateTime<Utc>>,
    /// Reapplies since the last `playing`
    pub consecutive_reapplies: u32,
}

/// What to do when the stall window expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDecision {
    /// The player caught up on its own
    Recovered,
    /// Reapply the source; `attempt` counts from 1 since the last `playing`
    Reapply { attempt: u32 },
    /// The reapply bound was reached
    GiveUp { attempts: u32 },
    /// The timer belongs to a replaced load
    Stale,
}

/// Stall detector for the active source
pub struct PlaybackHealthMonitor {
    player: PlayerHandle,
    stall_timeout: Duration,
    max_reapplies: Option<u32>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    timer: Mutex<Option<JoinHandle<()>>>,
    health: RwLock<SessionHealth>,
}

impl PlaybackHealthMonitor {
    pub fn new(
        player: PlayerHandle,
        stall_timeout: Duration,
        max_reapplies: Option<u32>,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            player,
            stall_timeout,
            max_reapplies,
            signals,
            timer: Mutex::new(None),
            health: RwLock::new(SessionHealth::default()),
        }
    }

    /// Start the stall window, replacing any window already running
    pub async fn on_waiting(&self, guard: SessionGuard) {
        let mut timer = self.timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        {
            let mut health = self.health.write().await;
            if health.stalled_since.is_none() {
                health.stalled_since = Some(Utc::now());
            }
        }

        let window = self.stall_timeout;
        let signals = self.signals.clone();
        debug!(window_ms = window.as_millis() as u64, generation = guard.generation(), "Stall window started");
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if guard.is_current() {
                let _ = signals.send(SessionSignal::StallTimeout { guard });
            }
        }));
    }

    /// Playback resumed: cancel the window and clear the stall counters
    pub async fn on_playing(&self) {
        self.cancel().await;
        let mut health = self.health.write().await;
        health.last_playing_at = Some(Utc::now());
        health.stalled_since = None;
        health.consecutive_reapplies = 0;
    }

    /// Decide what an expired stall window means
    pub async fn evaluate(&self, guard: &SessionGuard) -> StallDecision {
        if !guard.is_current() {
            return StallDecision::Stale;
        }

        let ready_state = self.player.ready_state();
        if ready_state.can_play() {
            debug!(ready_state = ?ready_state, "Stall window expired after recovery");
            return StallDecision::Recovered;
        }

        let mut health = self.health.write().await;
        health.consecutive_reapplies += 1;
        let attempt = health.consecutive_reapplies;
        if let Some(max) = self.max_reapplies {
            if attempt > max {
                warn!(attempts = max, "Stall recovery exhausted");
                return StallDecision::GiveUp { attempts: max };
            }
        }
        info!(attempt = attempt, ready_state = ?ready_state, "Playback stalled, reapplying source");
        StallDecision::Reapply { attempt }
    }

    /// Cancel the stall window, if any
    pub async fn cancel(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
        }
    }

    /// Forget everything about the previous source
    pub async fn reset(&self) {
        self.cancel().await;
        *self.health.write().await = SessionHealth::default();
    }

    /// Whether a stall window is running
    pub async fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn health(&self) -> SessionHealth {
        self.health.read().await.clone()
    }
}

impl Drop for PlaybackHealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::test_support::RecordingPlayer;
    use crate::player::ReadyState;
    use crate::state::MediaSession;
    use crate::types::LoadCommand;
    use std::sync::Arc;
    use tokio::time::sleep;

    const WINDOW: Duration = Duration::from_millis(10_000);

    async fn setup(
        max: Option<u32>,
    ) -> (
        PlaybackHealthMonitor,
        mpsc::UnboundedReceiver<SessionSignal>,
        Arc<RecordingPlayer>,
        MediaSession,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let player = RecordingPlayer::new();
        let monitor = PlaybackHealthMonitor::new(player.clone(), WINDOW, max, tx);
        let session = MediaSession::new();
        session.begin_load(LoadCommand::new("https://cdn/a.mpd", "dash")).await;
        (monitor, rx, player, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_without_playing_fires_once() {
        let (monitor, mut rx, _player, session) = setup(None).await;

        monitor.on_waiting(session.guard()).await;
        sleep(Duration::from_millis(9_999)).await;
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_millis(2)).await;
        let signal = rx.try_recv().unwrap();
        assert!(matches!(signal, SessionSignal::StallTimeout { .. }));

        sleep(WINDOW * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_cancels_window() {
        let (monitor, mut rx, _player, session) = setup(None).await;

        monitor.on_waiting(session.guard()).await;
        sleep(Duration::from_millis(5_000)).await;
        monitor.on_playing().await;
        sleep(WINDOW * 2).await;

        assert!(rx.try_recv().is_err());
        assert!(!monitor.is_armed().await);
        assert!(monitor.health().await.last_playing_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_waiting_coalesces() {
        let (monitor, mut rx, _player, session) = setup(None).await;

        monitor.on_waiting(session.guard()).await;
        sleep(Duration::from_millis(6_000)).await;
        monitor.on_waiting(session.guard()).await;
        sleep(Duration::from_millis(6_000)).await;
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_millis(4_001)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_load_silences_old_window() {
        let (monitor, mut rx, _player, session) = setup(None).await;

        monitor.on_waiting(session.guard()).await;
        session.begin_load(LoadCommand::new("https://cdn/b.mpd", "dash")).await;
        sleep(WINDOW * 2).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_evaluate_respects_ready_state() {
        let (monitor, _rx, player, session) = setup(None).await;
        let guard = session.guard();

        player.set_ready_state(ReadyState::HaveEnoughData);
        assert_eq!(monitor.evaluate(&guard).await, StallDecision::Recovered);

        player.set_ready_state(ReadyState::HaveCurrentData);
        assert_eq!(monitor.evaluate(&guard).await, StallDecision::Reapply { attempt: 1 });
        assert_eq!(monitor.evaluate(&guard).await, StallDecision::Reapply { attempt: 2 });

        monitor.on_playing().await;
        assert_eq!(monitor.evaluate(&guard).await, StallDecision::Reapply { attempt: 1 });
    }

    #[tokio::test]
    async fn test_bounded_reapplies_give_up() {
        let (monitor, _rx, _player, session) = setup(Some(2)).await;
        let guard = session.guard();

        assert_eq!(monitor.evaluate(&guard).await, StallDecision::Reapply { attempt: 1 });
        assert_eq!(monitor.evaluate(&guard).await, StallDecision::Reapply { attempt: 2 });
        assert_eq!(monitor.evaluate(&guard).await, StallDecision::GiveUp { attempts: 2 });
    }

    #[tokio::test]
    async fn test_stale_guard_is_ignored() {
        let (monitor, _rx, _player, session) = setup(None).await;
        let guard = session.guard();
        session.reset().await;
        assert_eq!(monitor.evaluate(&guard).await, StallDecision::Stale);
    }
}
