use super::{Renderer, RendererKind, RendererListener};
use crate::config::Config;
use crate::models::Track;
use crate::playback::service::PlaybackState;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Audio device not available")]
    DeviceNotFound,
    #[error("Unsupported source: {0}")]
    Unsupported(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Notifications from the audio engine, sent from whatever thread it runs on
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Enough data buffered to produce sound
    Ready,
    /// Output starved, waiting on the network
    Buffering,
    Position(u64),
    Completed,
    Failed(String),
}

/// Audio focus arbitration from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    Gain,
    Loss,
    LossTransient,
    LossTransientCanDuck,
}

/// Decode/output pipeline the local renderer drives
pub trait AudioEngine: Send + Sync {
    /// Open `source_uri` positioned at `start_ms`, paused
    fn load(&self, source_uri: &str, start_ms: u64) -> Result<(), EngineError>;
    fn start(&self) -> Result<(), EngineError>;
    fn pause(&self);
    fn stop(&self);
    fn seek(&self, position_ms: u64) -> Result<(), EngineError>;
    fn position_ms(&self) -> u64;
    fn set_volume(&self, volume: f32);
}

/// Keep-awake handle held while streaming (wifi/cpu lock)
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Holds a [`WakeLock`] until dropped
pub struct WakeGuard {
    lock: Arc<dyn WakeLock>,
}

impl WakeGuard {
    pub fn acquire(lock: Arc<dyn WakeLock>) -> Self {
        lock.acquire();
        debug!("Wake lock acquired");
        Self { lock }
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        self.lock.release();
        debug!("Wake lock released");
    }
}

/// Cloneable sender the engine uses to report events
#[derive(Debug, Clone)]
pub struct EngineEventSender(tokio_mpsc::UnboundedSender<EngineEvent>);

impl EngineEventSender {
    pub fn send(&self, event: EngineEvent) {
        let _ = self.0.send(event);
    }
}

pub type EngineEvents = tokio_mpsc::UnboundedReceiver<EngineEvent>;

/// Channel connecting an engine to the renderer that owns it
pub fn engine_channel() -> (EngineEventSender, EngineEvents) {
    let (tx, rx) = tokio_mpsc::unbounded_channel();
    (EngineEventSender(tx), rx)
}

struct LocalShared {
    state: PlaybackState,
    track: Option<Track>,
    listener: Option<RendererListener>,
    /// The user wants sound; survives a transient focus loss
    intent_to_play: bool,
    paused_by_focus: bool,
    ducked: bool,
    volume: f32,
    wake: Option<WakeGuard>,
}

impl LocalShared {
    fn notify_state(&self) {
        if let Some(listener) = &self.listener {
            listener.on_state(self.state);
        }
    }
}

/// Renderer backed by the local decode/output engine
pub struct LocalRenderer {
    engine: Arc<dyn AudioEngine>,
    wake_lock: Arc<dyn WakeLock>,
    shared: Arc<Mutex<LocalShared>>,
    focus_tx: tokio_mpsc::UnboundedSender<FocusChange>,
    pump: JoinHandle<()>,
}

impl LocalRenderer {
    /// Create the renderer and spawn its event pump on the current runtime
    pub fn new(
        engine: Arc<dyn AudioEngine>,
        engine_events: EngineEvents,
        wake_lock: Arc<dyn WakeLock>,
        duck_volume: f32,
    ) -> Self {
        let shared = Arc::new(Mutex::new(LocalShared {
            state: PlaybackState::Idle,
            track: None,
            listener: None,
            intent_to_play: false,
            paused_by_focus: false,
            ducked: false,
            volume: 1.0,
            wake: None,
        }));
        let (focus_tx, focus_rx) = tokio_mpsc::unbounded_channel();

        let pump = tokio::spawn(run_pump(
            engine.clone(),
            wake_lock.clone(),
            shared.clone(),
            engine_events,
            focus_rx,
            duck_volume.clamp(0.0, 1.0),
        ));

        Self {
            engine,
            wake_lock,
            shared,
            focus_tx,
            pump,
        }
    }

    /// Renderer using the configured duck volume
    pub fn from_config(
        config: &Config,
        engine: Arc<dyn AudioEngine>,
        engine_events: EngineEvents,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self::new(engine, engine_events, wake_lock, config.duck_volume)
    }

    /// Sender for audio focus changes, e.g. from the platform audio manager
    pub fn focus_sender(&self) -> tokio_mpsc::UnboundedSender<FocusChange> {
        self.focus_tx.clone()
    }

    pub fn set_volume(&self, volume: f32) {
        let mut shared = self.shared.lock().unwrap();
        shared.volume = volume.clamp(0.0, 1.0);
        if !shared.ducked {
            self.engine.set_volume(shared.volume);
        }
    }

    pub fn holds_wake_lock(&self) -> bool {
        self.shared.lock().unwrap().wake.is_some()
    }

    fn fail(&self, shared: &mut LocalShared, err: EngineError) {
        error!("Local playback failed: {}", err);
        shared.state = PlaybackState::Error;
        shared.intent_to_play = false;
        shared.wake = None;
        if let Some(listener) = &shared.listener {
            listener.on_failed(err.to_string());
        }
    }

    fn start_streaming(&self, shared: &mut LocalShared) {
        if shared.wake.is_none() {
            shared.wake = Some(WakeGuard::acquire(self.wake_lock.clone()));
        }
        shared.intent_to_play = true;
        shared.paused_by_focus = false;
    }
}

#[async_trait]
impl Renderer for LocalRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Local
    }

    async fn play(&mut self, track: &Track, start_ms: u64) {
        let mut shared = self.shared.lock().unwrap();
        info!("Local renderer playing {} from {}ms", track.display_name(), start_ms);

        shared.track = Some(track.clone());
        let started = self
            .engine
            .load(&track.source_uri, start_ms)
            .and_then(|_| self.engine.start());

        match started {
            Ok(()) => {
                self.start_streaming(&mut shared);
                shared.state = PlaybackState::Buffering;
            }
            Err(e) => self.fail(&mut shared, e),
        }
    }

    async fn prepare(&mut self, track: &Track, position_ms: u64) {
        let mut shared = self.shared.lock().unwrap();
        shared.track = Some(track.clone());

        match self.engine.load(&track.source_uri, position_ms) {
            Ok(()) => shared.state = PlaybackState::Paused,
            Err(e) => self.fail(&mut shared, e),
        }
    }

    async fn resume(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.track.is_none() {
            warn!("Local renderer asked to resume with nothing loaded");
            return;
        }

        match self.engine.start() {
            Ok(()) => {
                self.start_streaming(&mut shared);
                shared.state = PlaybackState::Playing;
            }
            Err(e) => self.fail(&mut shared, e),
        }
    }

    async fn pause(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        self.engine.pause();
        shared.intent_to_play = false;
        shared.paused_by_focus = false;
        shared.wake = None;
        if shared.track.is_some() && shared.state != PlaybackState::Error {
            shared.state = PlaybackState::Paused;
        }
    }

    async fn stop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        self.engine.stop();
        shared.intent_to_play = false;
        shared.paused_by_focus = false;
        shared.wake = None;
        shared.track = None;
        shared.state = PlaybackState::Stopped;
    }

    async fn seek_to(&mut self, position_ms: u64) {
        let mut shared = self.shared.lock().unwrap();
        if shared.track.is_none() {
            return;
        }
        if let Err(e) = self.engine.seek(position_ms) {
            self.fail(&mut shared, e);
        }
    }

    fn current_position(&self) -> u64 {
        if self.shared.lock().unwrap().track.is_some() {
            self.engine.position_ms()
        } else {
            0
        }
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

impl Drop for LocalRenderer {
    fn drop(&mut self) {
        self.pump.abort();
        let mut shared = self.shared.lock().unwrap();
        if shared.state.is_active() {
            self.engine.stop();
        }
        shared.wake = None;
    }
}

async fn run_pump(
    engine: Arc<dyn AudioEngine>,
    wake_lock: Arc<dyn WakeLock>,
    shared: Arc<Mutex<LocalShared>>,
    mut engine_events: EngineEvents,
    mut focus_rx: tokio_mpsc::UnboundedReceiver<FocusChange>,
    duck_volume: f32,
) {
    loop {
        tokio::select! {
            event = engine_events.recv() => match event {
                Some(event) => handle_engine_event(&shared, event),
                None => {
                    debug!("Engine event channel closed");
                    break;
                }
            },
            Some(change) = focus_rx.recv() => {
                handle_focus_change(&engine, &wake_lock, &shared, change, duck_volume);
            }
        }
    }
}

fn handle_engine_event(shared: &Arc<Mutex<LocalShared>>, event: EngineEvent) {
    let mut shared = shared.lock().unwrap();

    match event {
        EngineEvent::Ready => {
            if shared.state == PlaybackState::Buffering && shared.intent_to_play {
                shared.state = PlaybackState::Playing;
                shared.notify_state();
            }
        }
        EngineEvent::Buffering => {
            if shared.state == PlaybackState::Playing {
                shared.state = PlaybackState::Buffering;
                shared.notify_state();
            }
        }
        EngineEvent::Position(position_ms) => {
            if let Some(listener) = &shared.listener {
                listener.on_progress(position_ms);
            }
        }
        EngineEvent::Completed => {
            if !shared.state.is_active() {
                return;
            }
            shared.state = PlaybackState::Stopped;
            shared.intent_to_play = false;
            shared.wake = None;
            if let Some(listener) = &shared.listener {
                listener.on_completed();
            }
        }
        EngineEvent::Failed(message) => {
            error!("Audio engine failure: {}", message);
            shared.state = PlaybackState::Error;
            shared.intent_to_play = false;
            shared.wake = None;
            if let Some(listener) = &shared.listener {
                listener.on_failed(message);
            }
        }
    }
}

fn handle_focus_change(
    engine: &Arc<dyn AudioEngine>,
    wake_lock: &Arc<dyn WakeLock>,
    shared: &Arc<Mutex<LocalShared>>,
    change: FocusChange,
    duck_volume: f32,
) {
    let mut shared = shared.lock().unwrap();
    debug!(?change, state = ?shared.state, "Audio focus changed");

    match change {
        FocusChange::LossTransientCanDuck => {
            if !shared.ducked {
                engine.set_volume(duck_volume.min(shared.volume));
                shared.ducked = true;
            }
        }
        FocusChange::LossTransient => {
            if shared.state.is_active() {
                engine.pause();
                shared.state = PlaybackState::Paused;
                shared.paused_by_focus = true;
                shared.wake = None;
                shared.notify_state();
            }
        }
        FocusChange::Loss => {
            shared.intent_to_play = false;
            shared.paused_by_focus = false;
            if shared.state.is_active() {
                engine.pause();
                shared.state = PlaybackState::Paused;
                shared.wake = None;
                shared.notify_state();
            }
        }
        FocusChange::Gain => {
            if shared.ducked {
                engine.set_volume(shared.volume);
                shared.ducked = false;
            }
            if shared.paused_by_focus && shared.intent_to_play {
                shared.paused_by_focus = false;
                match engine.start() {
                    Ok(()) => {
                        shared.wake = Some(WakeGuard::acquire(wake_lock.clone()));
                        shared.state = PlaybackState::Playing;
                        shared.notify_state();
                    }
                    Err(e) => {
                        error!("Failed to resume after focus gain: {}", e);
                        shared.state = PlaybackState::Error;
                        shared.intent_to_play = false;
                        if let Some(listener) = &shared.listener {
                            listener.on_failed(e.to_string());
                        }
                    }
                }
            }
        }
    }
}
