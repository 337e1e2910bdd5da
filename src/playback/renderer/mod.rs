//! Pluggable playback backends.
//!
//! A [`Renderer`] is anything that can play a [`Track`]: the local audio
//! engine, a remote cast receiver, or the clock-driven [`TestRenderer`].
//! The coordinator owns exactly one at a time as a `Box<dyn Renderer>`;
//! handing off to another backend moves ownership.
//!
//! Renderer methods never return errors. A backend that fails moves its
//! `state()` to [`PlaybackState::Error`] and reports through its listener.

mod local;
mod remote;
mod test_renderer;

pub use local::{
    engine_channel, AudioEngine, EngineError, EngineEvent, EngineEventSender, EngineEvents,
    FocusChange, LocalRenderer, WakeGuard, WakeLock,
};
pub use remote::{
    CastError, CastEvent, CastMedia, CastPlayerState, CastSession, CastStatus, IdleReason,
    RemoteRenderer,
};
pub use test_renderer::{TestRenderer, TestRendererProbe, VirtualClock};

use crate::models::Track;
use crate::playback::service::PlaybackState;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc as tokio_mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    Local,
    Remote,
    Test,
}

impl fmt::Display for RendererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RendererKind::Local => write!(f, "local"),
            RendererKind::Remote => write!(f, "remote"),
            RendererKind::Test => write!(f, "test"),
        }
    }
}

/// What the active renderer is doing right now
#[derive(Debug, Clone, PartialEq)]
pub struct RendererSnapshot {
    pub state: PlaybackState,
    pub current_track: Option<Track>,
    pub position_ms: u64,
    pub connected: bool,
}

/// Callbacks from a renderer to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum RendererEvent {
    Progress(u64),
    /// The renderer changed state on its own (buffering, focus loss, ...)
    StateChanged(PlaybackState),
    Completed,
    Failed(String),
    /// A remote receiver came back with this track at this position
    Resynced { track: Track, position_ms: u64 },
}

/// Sending half handed to a renderer
///
/// Events are stamped with the generation of the renderer they were
/// installed on, so the owner can discard callbacks from a renderer it has
/// already replaced. Safe to use from any thread.
#[derive(Debug, Clone)]
pub struct RendererListener {
    generation: u64,
    tx: tokio_mpsc::UnboundedSender<(u64, RendererEvent)>,
}

impl RendererListener {
    pub fn new(generation: u64, tx: tokio_mpsc::UnboundedSender<(u64, RendererEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn on_progress(&self, position_ms: u64) {
        self.send(RendererEvent::Progress(position_ms));
    }

    pub fn on_completed(&self) {
        self.send(RendererEvent::Completed);
    }

    pub fn on_state(&self, state: PlaybackState) {
        self.send(RendererEvent::StateChanged(state));
    }

    pub fn on_failed(&self, message: impl Into<String>) {
        self.send(RendererEvent::Failed(message.into()));
    }

    pub fn on_resynced(&self, track: Track, position_ms: u64) {
        self.send(RendererEvent::Resynced { track, position_ms });
    }

    fn send(&self, event: RendererEvent) {
        // Owner gone means the session is shutting down
        let _ = self.tx.send((self.generation, event));
    }
}

#[async_trait]
pub trait Renderer: Send {
    fn kind(&self) -> RendererKind;

    /// Load `track` and start playing it from `start_ms`
    async fn play(&mut self, track: &Track, start_ms: u64);

    /// Load `track` at `position_ms` without starting it
    ///
    /// Used on hand-off so the new backend holds the old one's track and
    /// position before anything is started.
    async fn prepare(&mut self, track: &Track, position_ms: u64);

    async fn resume(&mut self);

    async fn pause(&mut self);

    /// Stop and release everything held for the current track
    async fn stop(&mut self);

    async fn seek_to(&mut self, position_ms: u64);

    fn current_position(&self) -> u64;

    fn state(&self) -> PlaybackState;

    fn current_track(&self) -> Option<Track>;

    /// Install or remove the callback target. Removing it silences the
    /// renderer before it is torn down.
    fn set_listener(&mut self, listener: Option<RendererListener>);

    fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    fn connected(&self) -> bool {
        true
    }

    fn snapshot(&self) -> RendererSnapshot {
        RendererSnapshot {
            state: self.state(),
            current_track: self.current_track(),
            position_ms: self.current_position(),
            connected: self.connected(),
        }
    }
}
