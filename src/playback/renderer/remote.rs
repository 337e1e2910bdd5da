use super::{Renderer, RendererKind, RendererListener};
use crate::models::Track;
use crate::playback::service::PlaybackState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CastError {
    #[error("Receiver not connected")]
    NotConnected,
    #[error("Cast session error: {0}")]
    Session(String),
    #[error("Custom data error: {0}")]
    CustomData(#[from] serde_json::Error),
}

/// Media load request for the receiver
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CastMedia {
    pub content_id: String,
    pub content_type: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub image_url: Option<String>,
    pub duration_ms: u64,
    pub start_ms: u64,
    pub autoplay: bool,
    /// Round-tripped untouched by the receiver
    pub custom_data: serde_json::Value,
}

impl CastMedia {
    fn for_track(track: &Track, start_ms: u64, autoplay: bool) -> Result<Self, CastError> {
        Ok(Self {
            content_id: track.source_uri.clone(),
            content_type: content_type_for(&track.source_uri).to_string(),
            title: track.title.clone(),
            artist: track.artist_title.clone(),
            album: track.album_title.clone(),
            image_url: track.art_uri.clone(),
            duration_ms: track.duration_ms,
            start_ms,
            autoplay,
            custom_data: serde_json::to_value(track)?,
        })
    }
}

fn content_type_for(uri: &str) -> &'static str {
    let path = uri.split('?').next().unwrap_or(uri).to_ascii_lowercase();
    if path.ends_with(".flac") {
        "audio/flac"
    } else if path.ends_with(".m4a") || path.ends_with(".aac") {
        "audio/mp4"
    } else if path.ends_with(".ogg") || path.ends_with(".opus") {
        "audio/ogg"
    } else {
        "audio/mpeg"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CastPlayerState {
    Idle,
    Buffering,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdleReason {
    Finished,
    Error,
    Cancelled,
    Interrupted,
}

/// Media status pushed by the receiver
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastStatus {
    pub player_state: CastPlayerState,
    #[serde(default)]
    pub idle_reason: Option<IdleReason>,
    pub position_ms: u64,
    #[serde(default)]
    pub custom_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CastEvent {
    Connected,
    Disconnected,
    Status(CastStatus),
}

/// Session to a remote playback receiver
#[async_trait]
pub trait CastSession: Send + Sync {
    async fn load(&self, media: CastMedia) -> Result<(), CastError>;
    async fn play(&self) -> Result<(), CastError>;
    async fn pause(&self) -> Result<(), CastError>;
    async fn stop(&self) -> Result<(), CastError>;
    async fn seek(&self, position_ms: u64) -> Result<(), CastError>;
    fn is_connected(&self) -> bool;
}

struct RemoteShared {
    state: PlaybackState,
    track: Option<Track>,
    position_ms: u64,
    /// When `position_ms` was last known exactly
    position_at: Instant,
    connected: bool,
    /// Set on disconnect, cleared by the first status after reconnecting
    awaiting_resync: bool,
    listener: Option<RendererListener>,
}

impl RemoteShared {
    fn position_now(&self) -> u64 {
        let mut position = self.position_ms;
        if self.state == PlaybackState::Playing && self.connected {
            position += self.position_at.elapsed().as_millis() as u64;
        }
        match &self.track {
            Some(track) if track.duration_ms > 0 => position.min(track.duration_ms),
            _ => position,
        }
    }

    fn set_position(&mut self, position_ms: u64) {
        self.position_ms = position_ms;
        self.position_at = Instant::now();
    }

    fn fail(&mut self, message: String) {
        error!("Remote playback failed: {}", message);
        self.state = PlaybackState::Error;
        if let Some(listener) = &self.listener {
            listener.on_failed(message);
        }
    }
}

/// Renderer driving a cast receiver
pub struct RemoteRenderer {
    session: Arc<dyn CastSession>,
    shared: Arc<Mutex<RemoteShared>>,
    pump: JoinHandle<()>,
}

impl RemoteRenderer {
    pub fn new(
        session: Arc<dyn CastSession>,
        events: tokio_mpsc::UnboundedReceiver<CastEvent>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(RemoteShared {
            state: PlaybackState::Idle,
            track: None,
            position_ms: 0,
            position_at: Instant::now(),
            connected: session.is_connected(),
            awaiting_resync: false,
            listener: None,
        }));

        let pump = tokio::spawn(run_pump(shared.clone(), events));

        Self {
            session,
            shared,
            pump,
        }
    }

    async fn load(&mut self, track: &Track, start_ms: u64, autoplay: bool) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.track = Some(track.clone());
            shared.set_position(start_ms);
            shared.state = if autoplay {
                PlaybackState::Buffering
            } else {
                PlaybackState::Paused
            };
        }

        let result = match CastMedia::for_track(track, start_ms, autoplay) {
            Ok(media) => self.session.load(media).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.shared.lock().unwrap().fail(e.to_string());
        }
    }
}

#[async_trait]
impl Renderer for RemoteRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Remote
    }

    async fn play(&mut self, track: &Track, start_ms: u64) {
        info!("Casting {} from {}ms", track.display_name(), start_ms);
        self.load(track, start_ms, true).await;
    }

    async fn prepare(&mut self, track: &Track, position_ms: u64) {
        self.load(track, position_ms, false).await;
    }

    async fn resume(&mut self) {
        if self.shared.lock().unwrap().track.is_none() {
            warn!("Remote renderer asked to resume with nothing loaded");
            return;
        }

        match self.session.play().await {
            Ok(()) => {
                let mut shared = self.shared.lock().unwrap();
                let position = shared.position_now();
                shared.set_position(position);
                shared.state = PlaybackState::Playing;
            }
            Err(e) => self.shared.lock().unwrap().fail(e.to_string()),
        }
    }

    async fn pause(&mut self) {
        {
            let mut shared = self.shared.lock().unwrap();
            let position = shared.position_now();
            shared.set_position(position);
            if shared.track.is_some() && shared.state != PlaybackState::Error {
                shared.state = PlaybackState::Paused;
            }
        }

        if let Err(e) = self.session.pause().await {
            self.shared.lock().unwrap().fail(e.to_string());
        }
    }

    async fn stop(&mut self) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.state = PlaybackState::Stopped;
            shared.track = None;
            shared.set_position(0);
        }

        // Best effort, the receiver may already be gone
        if let Err(e) = self.session.stop().await {
            debug!("Remote stop failed: {}", e);
        }
    }

    async fn seek_to(&mut self, position_ms: u64) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.track.is_none() {
                return;
            }
            shared.set_position(position_ms);
        }

        if let Err(e) = self.session.seek(position_ms).await {
            self.shared.lock().unwrap().fail(e.to_string());
        }
    }

    fn current_position(&self) -> u64 {
        self.shared.lock().unwrap().position_now()
    }

    fn state(&self) -> PlaybackState {
        self.shared.lock().unwrap().state
    }

    fn current_track(&self) -> Option<Track> {
        self.shared.lock().unwrap().track.clone()
    }

    fn connected(&self) -> bool {
        self.shared.lock().unwrap().connected
    }

    fn set_listener(&mut self, listener: Option<RendererListener>) {
        self.shared.lock().unwrap().listener = listener;
    }
}

impl Drop for RemoteRenderer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn run_pump(
    shared: Arc<Mutex<RemoteShared>>,
    mut events: tokio_mpsc::UnboundedReceiver<CastEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut shared = shared.lock().unwrap();
        match event {
            CastEvent::Disconnected => {
                info!("Cast receiver disconnected");
                let position = shared.position_now();
                shared.set_position(position);
                shared.connected = false;
                shared.awaiting_resync = true;
                if let Some(listener) = &shared.listener {
                    listener.on_state(shared.state);
                }
            }
            CastEvent::Connected => {
                info!("Cast receiver connected");
                shared.connected = true;
                let position = shared.position_ms;
                shared.set_position(position);
            }
            CastEvent::Status(status) => handle_status(&mut shared, status),
        }
    }
    debug!("Cast event channel closed");
}

fn handle_status(shared: &mut RemoteShared, status: CastStatus) {
    if shared.awaiting_resync {
        shared.awaiting_resync = false;
        resync(shared, &status);
    }

    let previous = shared.state;
    match (status.player_state, status.idle_reason) {
        (CastPlayerState::Playing, _) => shared.state = PlaybackState::Playing,
        (CastPlayerState::Paused, _) => shared.state = PlaybackState::Paused,
        (CastPlayerState::Buffering, _) => shared.state = PlaybackState::Buffering,
        (CastPlayerState::Idle, Some(IdleReason::Finished)) => {
            if previous.is_active() {
                shared.state = PlaybackState::Stopped;
                shared.set_position(0);
                if let Some(listener) = &shared.listener {
                    listener.on_completed();
                }
            }
            return;
        }
        (CastPlayerState::Idle, Some(IdleReason::Error)) => {
            shared.fail("Receiver reported a playback error".to_string());
            return;
        }
        (CastPlayerState::Idle, Some(IdleReason::Cancelled)) => {
            shared.state = PlaybackState::Stopped;
        }
        // Interrupted by our own load, or an idle status without a reason
        (CastPlayerState::Idle, _) => return,
    }

    shared.set_position(status.position_ms);

    if let Some(listener) = &shared.listener {
        if shared.state != previous {
            listener.on_state(shared.state);
        }
        listener.on_progress(status.position_ms);
    }
}

/// Re-adopt the track the receiver kept playing while we were away
fn resync(shared: &mut RemoteShared, status: &CastStatus) {
    let Some(custom_data) = &status.custom_data else {
        return;
    };

    let track: Track = match serde_json::from_value(custom_data.clone()) {
        Ok(track) => track,
        Err(e) => {
            warn!("Ignoring receiver custom data: {}", e);
            return;
        }
    };

    let same_item = shared
        .track
        .as_ref()
        .is_some_and(|t| t.queue_item_id == track.queue_item_id);
    if !same_item {
        info!("Receiver is playing {}, adopting it", track.display_name());
    }

    shared.track = Some(track.clone());
    shared.set_position(status.position_ms);
    if let Some(listener) = &shared.listener {
        listener.on_resynced(track, status.position_ms);
    }
}
