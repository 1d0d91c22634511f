//! Outbound receiver events
//!
//! Everything the sender application and the on-screen overlay need to know
//! about the session is published here:
//! - load lifecycle (started, succeeded, failed)
//! - playback transitions
//! - recovery actions
//! - branding overlay visibility

use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Capacity of the subscriber channel
const CHANNEL_CAPACITY: usize = 256;

/// Records kept for late readers
const HISTORY_LIMIT: usize = 100;

/// Receiver event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReceiverEvent {
    /// A load command was accepted for processing
    LoadStarted {
        content_url: String,
    },

    /// The player accepted the source
    LoadSucceeded {
        content_url: String,
        duration: f64,
    },

    /// The command was refused before anything was touched; whatever was
    /// playing keeps playing
    LoadRejected {
        code: String,
        message: String,
    },

    /// The load failed while configuring; the session is idle
    LoadFailed {
        code: String,
        message: String,
    },

    /// Playback transition reported by the player
    #[serde(rename_all = "camelCase")]
    Playback {
        kind: String,
        current_time: f64,
        duration: f64,
    },

    /// Error reported by the player
    PlayerError {
        code: Option<String>,
        message: String,
    },

    /// Overlay visibility changed
    Branding {
        visible: bool,
    },

    /// The source was reapplied after a stall
    StallRecovery {
        attempt: u32,
    },

    /// The source was reapplied after a key or decode error
    DrmRecovery,

    /// The entitlement service refused the token
    EntitlementRejected {
        code: String,
        message: String,
    },

    /// The session returned to idle
    SessionReset {
        reason: String,
    },
}

impl ReceiverEvent {
    /// Overlay visibility implied by this event, if any
    pub fn branding(&self) -> Option<bool> {
        match self {
            ReceiverEvent::Playback { kind, .. } => match kind.as_str() {
                "playing" => Some(false),
                "source_loaded" | "paused" | "ended" => Some(true),
                _ => None,
            },
            ReceiverEvent::LoadFailed { .. }
            | ReceiverEvent::EntitlementRejected { .. }
            | ReceiverEvent::SessionReset { .. } => Some(true),
            _ => None,
        }
    }
}

/// Receiver event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverEventRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    #[serde(flatten)]
    pub event: ReceiverEvent,
}

/// Publishes receiver events to any number of subscribers
pub struct EventEmitter {
    session_id: SessionId,
    sequence: RwLock<u64>,
    history: RwLock<VecDeque<ReceiverEventRecord>>,
    branding_visible: RwLock<bool>,
    event_tx: broadcast::Sender<ReceiverEventRecord>,
}

impl EventEmitter {
    pub fn new(session_id: SessionId) -> Self {
        let (event_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id,
            sequence: RwLock::new(0),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            // the overlay is up until something plays
            branding_visible: RwLock::new(true),
            event_tx,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEventRecord> {
        self.event_tx.subscribe()
    }

    /// Emit an event, followed by a branding event when it changes the
    /// overlay visibility
    pub async fn emit(&self, event: ReceiverEvent) {
        let branding = event.branding();
        self.publish(event).await;

        if let Some(visible) = branding {
            let mut current = self.branding_visible.write().await;
            if *current != visible {
                *current = visible;
                drop(current);
                self.publish(ReceiverEvent::Branding { visible }).await;
            }
        }
    }

    async fn publish(&self, event: ReceiverEvent) {
        let mut seq = self.sequence.write().await;
        *seq += 1;

        let record = ReceiverEventRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            timestamp: Utc::now(),
            sequence: *seq,
            event,
        };
        drop(seq);

        debug!(sequence = record.sequence, event = ?record.event, "Receiver event");

        let mut history = self.history.write().await;
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record.clone());
        drop(history);

        // no subscribers is fine
        let _ = self.event_tx.send(record);
    }

    /// Most recent records, oldest first
    pub async fn recent(&self) -> Vec<ReceiverEventRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn branding_visible(&self) -> bool {
        *self.branding_visible.read().await
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(SessionId::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playback(kind: &str) -> ReceiverEvent {
        ReceiverEvent::Playback {
            kind: kind.to_string(),
            current_time: 0.0,
            duration: 60.0,
        }
    }

    #[tokio::test]
    async fn test_sequence_and_subscription() {
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();

        emitter.emit(ReceiverEvent::DrmRecovery).await;
        emitter.emit(ReceiverEvent::StallRecovery { attempt: 1 }).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.event, ReceiverEvent::StallRecovery { attempt: 1 });
        assert_eq!(first.session_id, emitter.session_id());
    }

    #[tokio::test]
    async fn test_branding_follows_playback() {
        let emitter = EventEmitter::default();
        assert!(emitter.branding_visible().await);

        emitter.emit(playback("playing")).await;
        assert!(!emitter.branding_visible().await);

        emitter.emit(playback("seeked")).await;
        assert!(!emitter.branding_visible().await);

        emitter.emit(playback("paused")).await;
        assert!(emitter.branding_visible().await);

        let branding: Vec<_> = emitter
            .recent()
            .await
            .into_iter()
            .filter_map(|r| match r.event {
                ReceiverEvent::Branding { visible } => Some(visible),
                _ => None,
            })
            .collect();
        assert_eq!(branding, vec![false, true]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let emitter = EventEmitter::default();
        for attempt in 0..(HISTORY_LIMIT as u32 + 10) {
            emitter.emit(ReceiverEvent::StallRecovery { attempt }).await;
        }
        let recent = emitter.recent().await;
        assert_eq!(recent.len(), HISTORY_LIMIT);
        assert_eq!(recent[0].sequence, 11);
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = ReceiverEventRecord {
            id: Uuid::nil(),
            session_id: SessionId(Uuid::nil()),
            timestamp: Utc::now(),
            sequence: 7,
            event: ReceiverEvent::LoadFailed {
                code: "MISSING_CONTENT_ID".into(),
                message: "no url".into(),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "load_failed");
        assert_eq!(json["code"], "MISSING_CONTENT_ID");
        assert_eq!(json["sequence"], 7);
    }
}
