use super::{Renderer, RendererKind, RendererListener};
use crate::models::Track;
use crate::playback::service::PlaybackState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

/// Manually advanced clock shared by any number of [`TestRenderer`]s
#[derive(Clone, Default)]
pub struct VirtualClock {
    now_ms: Arc<AtomicU64>,
    renderers: Arc<Mutex<Vec<Weak<Mutex<TestShared>>>>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    /// Move time forward, emitting progress and completions from every
    /// playing renderer attached to this clock
    pub fn advance(&self, ms: u64) {
        let now = self.now_ms.fetch_add(ms, Ordering::SeqCst) + ms;

        let renderers: Vec<Arc<Mutex<TestShared>>> = {
            let mut list = self.renderers.lock().unwrap();
            list.retain(|r| r.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };

        for renderer in renderers {
            renderer.lock().unwrap().tick(now);
        }
    }

    fn attach(&self, shared: &Arc<Mutex<TestShared>>) {
        self.renderers.lock().unwrap().push(Arc::downgrade(shared));
    }
}

struct TestShared {
    state: PlaybackState,
    track: Option<Track>,
    /// Position at `anchor_ms` on the clock
    position_ms: u64,
    anchor_ms: u64,
    initial_position_ms: Option<u64>,
    listener: Option<RendererListener>,
    fail_next_play: Option<String>,
    calls: Vec<String>,
}

impl TestShared {
    fn position_at(&self, now_ms: u64) -> u64 {
        let mut position = self.position_ms;
        if self.state == PlaybackState::Playing {
            position += now_ms.saturating_sub(self.anchor_ms);
        }
        match &self.track {
            Some(track) => position.min(track.duration_ms),
            None => 0,
        }
    }

    fn reanchor(&mut self, now_ms: u64) {
        self.position_ms = self.position_at(now_ms);
        self.anchor_ms = now_ms;
    }

    fn tick(&mut self, now_ms: u64) {
        if self.state != PlaybackState::Playing {
            return;
        }

        let position = self.position_at(now_ms);
        let duration = self.track.as_ref().map(|t| t.duration_ms).unwrap_or(0);
        trace!(position, duration, "Test renderer tick");

        if let Some(listener) = &self.listener {
            listener.on_progress(position);
        }

        if position >= duration {
            self.position_ms = duration;
            self.anchor_ms = now_ms;
            self.state = PlaybackState::Stopped;
            if let Some(listener) = &self.listener {
                listener.on_completed();
            }
        }
    }
}

/// Deterministic renderer whose playback time comes from a [`VirtualClock`]
///
/// Records every call it receives so tests can assert on what the
/// coordinator did to it.
pub struct TestRenderer {
    clock: VirtualClock,
    shared: Arc<Mutex<TestShared>>,
}

impl TestRenderer {
    pub fn new(clock: &VirtualClock) -> Self {
        let shared = Arc::new(Mutex::new(TestShared {
            state: PlaybackState::Idle,
            track: None,
            position_ms: 0,
            anchor_ms: clock.now_ms(),
            initial_position_ms: None,
            listener: None,
            fail_next_play: None,
            calls: Vec::new(),
        }));
        clock.attach(&shared);

        Self {
            clock: clock.clone(),
            shared,
        }
    }

    /// Observer handle that stays valid after the renderer is moved into
    /// the coordinator
    pub fn probe(&self) -> TestRendererProbe {
        TestRendererProbe {
            clock: self.clock.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Make the next `play` fail with `message`
    pub fn fail_next_play(&self, message: impl Into<String>) {
        self.shared.lock().unwrap().fail_next_play = Some(message.into());
    }

    fn record(&self, call: String) {
        self.shared.lock().unwrap().calls.push(call);
    }
}

/// Read side of a [`TestRenderer`]
#[derive(Clone)]
pub struct TestRendererProbe {
    clock: VirtualClock,
    shared: Arc<Mutex<TestShared>>,
}

impl TestRendererProbe {
    pub fn calls(&self) -> Vec<String> {
        self.shared.lock().unwrap().calls.clone()
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.lock().unwrap().state
    }

    pub fn position(&self) -> u64 {
        self.shared.lock().unwrap().position_at(self.clock.now_ms())
    }

    pub fn track(&self) -> Option<Track> {
        self.shared.lock().unwrap().track.clone()
    }

    /// Position installed by the last `play`/`prepare`
    pub fn initial_position_ms(&self) -> Option<u64> {
        self.shared.lock().unwrap().initial_position_ms
    }

    pub fn has_listener(&self) -> bool {
        self.shared.lock().unwrap().listener.is_some()
    }

    /// Simulate a backend-side failure
    pub fn inject_failure(&self, message: &str) {
        let mut shared = self.shared.lock().unwrap();
        shared.state = PlaybackState::Error;
        if let Some(listener) = &shared.listener {
            listener.on_failed(message);
        }
    }
}

#[async_trait]
impl Renderer for TestRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Test
    }

    async fn play(&mut self, track: &Track, start_ms: u64) {
        self.record(format!("play:{}@{}", track.queue_item_id, start_ms));
        let now = self.clock.now_ms();
        let mut shared = self.shared.lock().unwrap();

        shared.track = Some(track.clone());
        shared.position_ms = start_ms;
        shared.anchor_ms = now;
        shared.initial_position_ms = Some(start_ms);

        if let Some(message) = shared.fail_next_play.take() {
            shared.state = PlaybackState::Error;
            if let Some(listener) = &shared.listener {
                listener.on_failed(message);
            }
            return;
        }

        shared.state = PlaybackState::Playing;
    }

    async fn prepare(&mut self, track: &Track, position_ms: u64) {
        self.record(format!("prepare:{}@{}", track.queue_item_id, position_ms));
        let now = self.clock.now_ms();
        let mut shared = self.shared.lock().unwrap();

        shared.track = Some(track.clone());
        shared.position_ms = position_ms;
        shared.anchor_ms = now;
        shared.initial_position_ms = Some(position_ms);
        shared.state = PlaybackState::Paused;
    }

    async fn resume(&mut self) {
        self.record("resume".to_string());
        let now = self.clock.now_ms();
        let mut shared = self.shared.lock().unwrap();
        if shared.track.is_some() {
            shared.reanchor(now);
            shared.state = PlaybackState::Playing;
        }
    }

    async fn pause(&mut self) {
        self.record("pause".to_string());
        let now = self.clock.now_ms();
        let mut shared = self.shared.lock().unwrap();
        shared.reanchor(now);
        if shared.track.is_some() {
            shared.state = PlaybackState::Paused;
        }
    }

    async fn stop(&mut self) {
        self.record("stop".to_string());
        let mut shared = self.shared.lock().unwrap();
        shared.state = PlaybackState::Stopped;
        shared.track = None;
        shared.position_ms = 0;
    }

    async fn seek_to(&mut self, position_ms: u64) {
        self.record(format!("seek:{}", position_ms));
        let now = self.clock.now_ms();
        let mut shared = self.shared.lock().unwrap();
        shared.position_ms = position_ms;
        shared.anchor_ms = now;
    }

    fn current_position(&self) -> u64 {
        self.shared
            .lock()
            .unwrap()
            .position_at(self.clock.now_ms())
    }

    fn state(&self) -> PlaybackState {
        self.shared.lock().unwrap().state
    }

    fn current_track(&self) -> Option<Track> {
        self.shared.lock().unwrap().track.clone()
    }

    fn set_listener(&mut self, listener: Option<RendererListener>) {
        self.shared.lock().unwrap().listener = listener;
    }
}
