//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use castello_core::player::{Player, PlayerError, ReadyState};
use castello_core::types::{DrmCustomData, LoadCommand, SourceDescriptor};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Player that records commands and reports scripted properties
#[derive(Default)]
pub struct MockPlayer {
    loads: AtomicU32,
    unloads: AtomicU32,
    pub loaded: Mutex<Vec<SourceDescriptor>>,
    pub seeks: Mutex<Vec<f64>>,
    duration: Mutex<f64>,
    ready_state: Mutex<Option<ReadyState>>,
}

impl MockPlayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> u32 {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn set_duration(&self, seconds: f64) {
        *self.duration.lock().unwrap() = seconds;
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        *self.ready_state.lock().unwrap() = Some(state);
    }

    pub fn last_source(&self) -> Option<SourceDescriptor> {
        self.loaded.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Player for MockPlayer {
    async fn load(&self, source: &SourceDescriptor) -> Result<(), PlayerError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.loaded.lock().unwrap().push(source.clone());
        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn unload(&self) -> Result<(), PlayerError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn seek(&self, seconds: f64) -> Result<(), PlayerError> {
        self.seeks.lock().unwrap().push(seconds);
        Ok(())
    }

    fn current_time(&self) -> f64 {
        0.0
    }

    fn duration(&self) -> f64 {
        *self.duration.lock().unwrap()
    }

    fn is_paused(&self) -> bool {
        false
    }

    fn ready_state(&self) -> ReadyState {
        self.ready_state.lock().unwrap().unwrap_or(ReadyState::HaveNothing)
    }
}

/// The reference DRM load: DASH, license server `lic.example`, media `m1`
pub fn drm_command(license_server: &str) -> LoadCommand {
    let drm = DrmCustomData::from_parts(Some(license_server), Some("m1"), Some("t1"), None)
        .expect("all DRM fields present");
    LoadCommand::new("https://cdn/a.mpd", "application/dash+xml").with_drm(drm)
}
