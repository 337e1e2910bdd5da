use crate::models::{QueueItemId, Track};
use crate::playback::feed::Feed;
use crate::playback::queue::TrackQueue;
use crate::playback::renderer::{Renderer, RendererEvent, RendererKind, RendererListener};
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Renderer failure: {0}")]
    RendererFailure(String),
    #[error("Queue item not found: {0}")]
    QueueItemNotFound(QueueItemId),
    #[error("Queue is empty")]
    EmptyQueue,
    #[error("Playback session closed")]
    SessionClosed,
}

/// Current playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlaybackState {
    /// Nothing has been played in this session yet
    #[default]
    Idle,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Error,
}

impl PlaybackState {
    /// Sound is coming out or about to
    pub fn is_active(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Buffering)
    }

    /// Label used in timeline reports
    pub fn label(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "none",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Error => "error",
        }
    }
}

/// Authoritative record published by the coordinator after every transition
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub state: PlaybackState,
    /// Track the state refers to; kept after a stop so it can be reported
    pub track: Option<Track>,
    pub position_ms: u64,
    pub error: Option<String>,
    pub renderer: RendererKind,
    pub connected: bool,
}

/// Side effects announced ahead of the state change they belong to
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackAnnouncement {
    Starting(Track),
    Stopped,
}

/// Playback commands sent to the coordinator
pub enum PlaybackCommand {
    Play,
    Pause,
    TogglePlayPause,
    Stop,
    Seek(u64),
    SkipNext,
    SkipPrevious,
    PlayFromQueueItem(QueueItemId),
    SetQueue {
        tracks: Vec<Track>,
        start_id: Option<QueueItemId>,
        autoplay: bool,
    },
    SwitchRenderer {
        renderer: Box<dyn Renderer>,
        resume_playing: bool,
        ack: oneshot::Sender<()>,
    },
    Snapshot(oneshot::Sender<PlayerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

impl PlaybackCommand {
    fn name(&self) -> &'static str {
        match self {
            PlaybackCommand::Play => "play",
            PlaybackCommand::Pause => "pause",
            PlaybackCommand::TogglePlayPause => "toggle",
            PlaybackCommand::Stop => "stop",
            PlaybackCommand::Seek(_) => "seek",
            PlaybackCommand::SkipNext => "skip_next",
            PlaybackCommand::SkipPrevious => "skip_previous",
            PlaybackCommand::PlayFromQueueItem(_) => "play_from_queue_item",
            PlaybackCommand::SetQueue { .. } => "set_queue",
            PlaybackCommand::SwitchRenderer { .. } => "switch_renderer",
            PlaybackCommand::Snapshot(_) => "snapshot",
            PlaybackCommand::Shutdown(_) => "shutdown",
        }
    }
}

/// Handle to the coordinator for sending commands
#[derive(Clone)]
pub struct PlaybackHandle {
    command_tx: tokio_mpsc::UnboundedSender<PlaybackCommand>,
    snapshots: Feed<PlayerSnapshot>,
    announcements: Feed<PlaybackAnnouncement>,
    queue: TrackQueue,
}

impl PlaybackHandle {
    pub fn play(&self) {
        self.send(PlaybackCommand::Play);
    }

    pub fn pause(&self) {
        self.send(PlaybackCommand::Pause);
    }

    pub fn toggle_play_pause(&self) {
        self.send(PlaybackCommand::TogglePlayPause);
    }

    pub fn stop(&self) {
        self.send(PlaybackCommand::Stop);
    }

    pub fn seek_to(&self, position_ms: u64) {
        self.send(PlaybackCommand::Seek(position_ms));
    }

    pub fn skip_next(&self) {
        self.send(PlaybackCommand::SkipNext);
    }

    pub fn skip_previous(&self) {
        self.send(PlaybackCommand::SkipPrevious);
    }

    pub fn play_from_queue_item(&self, id: QueueItemId) {
        self.send(PlaybackCommand::PlayFromQueueItem(id));
    }

    pub fn set_queue(&self, tracks: Vec<Track>, start_id: Option<QueueItemId>, autoplay: bool) {
        self.send(PlaybackCommand::SetQueue {
            tracks,
            start_id,
            autoplay,
        });
    }

    /// Hand playback over to `renderer`. Resolves once the switch is done.
    pub async fn switch_renderer(
        &self,
        renderer: Box<dyn Renderer>,
        resume_playing: bool,
    ) -> Result<(), PlaybackError> {
        let (ack, done) = oneshot::channel();
        self.command_tx
            .send(PlaybackCommand::SwitchRenderer {
                renderer,
                resume_playing,
                ack,
            })
            .map_err(|_| PlaybackError::SessionClosed)?;
        done.await.map_err(|_| PlaybackError::SessionClosed)
    }

    /// Current state with the renderer's live position
    pub async fn snapshot(&self) -> Result<PlayerSnapshot, PlaybackError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(PlaybackCommand::Snapshot(tx))
            .map_err(|_| PlaybackError::SessionClosed)?;
        rx.await.map_err(|_| PlaybackError::SessionClosed)
    }

    /// Stop playback, release the renderer and end the coordinator task
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(PlaybackCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe_snapshots(&self) -> tokio_mpsc::UnboundedReceiver<PlayerSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_announcements(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackAnnouncement> {
        self.announcements.subscribe()
    }

    pub fn latest_snapshot(&self) -> Option<PlayerSnapshot> {
        self.snapshots.latest()
    }

    pub fn queue(&self) -> &TrackQueue {
        &self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    fn send(&self, command: PlaybackCommand) {
        if self.command_tx.send(command).is_err() {
            debug!("Playback command dropped, coordinator has shut down");
        }
    }
}

/// Single writer for playback state
///
/// Runs as one task. Commands from the handle and callbacks from the active
/// renderer are both funnelled through its loop, so no two transitions can
/// interleave, including a renderer switch.
pub struct PlaybackCoordinator {
    queue: TrackQueue,
    renderer: Box<dyn Renderer>,
    generation: u64,
    state: PlaybackState,
    track: Option<Track>,
    error: Option<String>,
    command_rx: tokio_mpsc::UnboundedReceiver<PlaybackCommand>,
    event_tx: tokio_mpsc::UnboundedSender<(u64, RendererEvent)>,
    event_rx: tokio_mpsc::UnboundedReceiver<(u64, RendererEvent)>,
    snapshots: Feed<PlayerSnapshot>,
    announcements: Feed<PlaybackAnnouncement>,
}

impl PlaybackCoordinator {
    /// Spawn the coordinator on the current runtime
    pub fn start(queue: TrackQueue, mut renderer: Box<dyn Renderer>) -> PlaybackHandle {
        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
        let (event_tx, event_rx) = tokio_mpsc::unbounded_channel();
        let snapshots = Feed::new("player");
        let announcements = Feed::new("announcements");

        let generation = 1;
        renderer.set_listener(Some(RendererListener::new(generation, event_tx.clone())));

        let handle = PlaybackHandle {
            command_tx,
            snapshots: snapshots.clone(),
            announcements: announcements.clone(),
            queue: queue.clone(),
        };

        let coordinator = PlaybackCoordinator {
            queue,
            renderer,
            generation,
            state: PlaybackState::Idle,
            track: None,
            error: None,
            command_rx,
            event_tx,
            event_rx,
            snapshots,
            announcements,
        };
        coordinator.publish();

        tokio::spawn(coordinator.run());
        handle
    }

    async fn run(mut self) {
        info!(renderer = %self.renderer.kind(), "Playback coordinator started");
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => match command {
                    Some(PlaybackCommand::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some((generation, event)) = self.event_rx.recv() => {
                    if generation != self.generation {
                        trace!(generation, current = self.generation, "Dropping event from replaced renderer");
                        continue;
                    }
                    self.handle_renderer_event(event).await;
                }
            }
        }

        self.shutdown().await;
        info!("Playback coordinator stopped");

        // Close the command channel before acknowledging
        drop(self);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn handle_command(&mut self, command: PlaybackCommand) {
        debug!(command = command.name(), state = ?self.state, "Handling command");

        match command {
            PlaybackCommand::Play => self.play().await,
            PlaybackCommand::Pause => self.pause().await,
            PlaybackCommand::TogglePlayPause => {
                if self.state.is_active() {
                    self.pause().await;
                } else {
                    self.play().await;
                }
            }
            PlaybackCommand::Stop => {
                if self.state == PlaybackState::Idle || self.track.is_none() {
                    debug!(state = ?self.state, "Stop ignored, nothing loaded");
                } else {
                    self.stop(None).await;
                }
            }
            PlaybackCommand::Seek(position_ms) => self.seek(position_ms).await,
            PlaybackCommand::SkipNext => self.skip_next().await,
            PlaybackCommand::SkipPrevious => self.skip_previous().await,
            PlaybackCommand::PlayFromQueueItem(id) => self.play_from_queue_item(id).await,
            PlaybackCommand::SetQueue {
                tracks,
                start_id,
                autoplay,
            } => {
                self.queue.set_queue(tracks, start_id);
                if autoplay {
                    self.start_current().await;
                }
            }
            PlaybackCommand::SwitchRenderer {
                renderer,
                resume_playing,
                ack,
            } => {
                self.switch_renderer(renderer, resume_playing).await;
                let _ = ack.send(());
            }
            PlaybackCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            PlaybackCommand::Shutdown(_) => unreachable!("handled in run loop"),
        }
    }

    /// Start or resume the queue's current track
    async fn play(&mut self) {
        let Some(track) = self.queue.current_track() else {
            warn!("{}", PlaybackError::EmptyQueue);
            return;
        };

        let loaded = self
            .renderer
            .current_track()
            .is_some_and(|t| t.queue_item_id == track.queue_item_id);

        if loaded && self.renderer.state().is_active() && self.state.is_active() {
            return;
        }

        self.announcements
            .publish(PlaybackAnnouncement::Starting(track.clone()));

        if loaded && self.renderer.state() == PlaybackState::Paused {
            self.renderer.resume().await;
        } else {
            self.renderer.play(&track, 0).await;
        }

        self.track = Some(track);
        self.enter_renderer_state();
    }

    /// Play the queue's current track from the beginning
    async fn start_current(&mut self) {
        let Some(track) = self.queue.current_track() else {
            warn!("{}", PlaybackError::EmptyQueue);
            return;
        };

        info!("Starting {}", track.display_name());
        self.announcements
            .publish(PlaybackAnnouncement::Starting(track.clone()));
        self.renderer.play(&track, 0).await;
        self.track = Some(track);
        self.enter_renderer_state();
    }

    /// Adopt the renderer's state right after asking it to start
    ///
    /// Callers have already announced `Starting`, so a renderer that failed
    /// on the spot gets the matching `Stopped` here.
    fn enter_renderer_state(&mut self) {
        self.state = match self.renderer.state() {
            PlaybackState::Playing => PlaybackState::Playing,
            // Failure details follow through the listener
            PlaybackState::Error => {
                self.announcements.publish(PlaybackAnnouncement::Stopped);
                PlaybackState::Error
            }
            _ => PlaybackState::Buffering,
        };
        if self.state != PlaybackState::Error {
            self.error = None;
        }
        self.publish();
    }

    async fn pause(&mut self) {
        if !self.state.is_active() {
            debug!(state = ?self.state, "Pause ignored");
            return;
        }

        self.renderer.pause().await;
        self.announcements.publish(PlaybackAnnouncement::Stopped);
        self.state = PlaybackState::Paused;
        self.publish();
    }

    async fn stop(&mut self, error: Option<String>) {
        self.renderer.stop().await;
        // Paused and failed players have already announced
        if self.state.is_active() {
            self.announcements.publish(PlaybackAnnouncement::Stopped);
        }

        self.state = match &error {
            Some(message) => {
                warn!("Playback stopped: {}", message);
                PlaybackState::Error
            }
            None => PlaybackState::Stopped,
        };
        self.error = error;
        self.publish();
    }

    async fn seek(&mut self, position_ms: u64) {
        if self.renderer.current_track().is_none() {
            debug!("Seek ignored, nothing loaded");
            return;
        }
        self.renderer.seek_to(position_ms).await;
        self.publish();
    }

    async fn skip_next(&mut self) {
        if self.queue.is_empty() {
            warn!("{}", PlaybackError::EmptyQueue);
            return;
        }

        if self.queue.next() {
            self.start_current().await;
        } else {
            self.stop(Some("cannot skip".to_string())).await;
        }
    }

    async fn skip_previous(&mut self) {
        if self.queue.is_empty() {
            warn!("{}", PlaybackError::EmptyQueue);
            return;
        }

        if self.queue.previous() {
            self.start_current().await;
        } else if self.renderer.current_track().is_some() {
            // Nowhere to go back to, restart the current track
            self.seek(0).await;
        }
    }

    async fn play_from_queue_item(&mut self, id: QueueItemId) {
        if !self.queue.contains(id) {
            warn!("{}", PlaybackError::QueueItemNotFound(id));
            return;
        }

        if self.queue.set_position(id) {
            self.start_current().await;
        } else {
            self.play().await;
        }
    }

    async fn switch_renderer(&mut self, mut renderer: Box<dyn Renderer>, resume_playing: bool) {
        let old = self.renderer.snapshot();
        info!(
            from = %self.renderer.kind(),
            to = %renderer.kind(),
            state = ?old.state,
            position_ms = old.position_ms,
            "Switching renderer"
        );

        // Silence the old renderer before stopping it so its stop is not
        // reported back as a playback event
        self.renderer.set_listener(None);
        self.renderer.stop().await;

        self.generation += 1;
        renderer.set_listener(Some(RendererListener::new(
            self.generation,
            self.event_tx.clone(),
        )));

        let track = old
            .current_track
            .clone()
            .or_else(|| self.queue.current_track());
        if let Some(track) = &track {
            renderer.prepare(track, old.position_ms).await;
        }

        // Old renderer released here
        drop(std::mem::replace(&mut self.renderer, renderer));
        if track.is_some() {
            self.track = track;
        }

        match old.state {
            PlaybackState::Playing if resume_playing => self.play().await,
            PlaybackState::Playing | PlaybackState::Buffering | PlaybackState::Paused => {
                if self.state.is_active() {
                    self.announcements.publish(PlaybackAnnouncement::Stopped);
                }
                self.state = PlaybackState::Paused;
                self.publish();
            }
            PlaybackState::Idle | PlaybackState::Stopped | PlaybackState::Error => {
                if self.state.is_active() {
                    self.announcements.publish(PlaybackAnnouncement::Stopped);
                    self.state = PlaybackState::Stopped;
                }
                self.publish();
            }
        }
    }

    async fn handle_renderer_event(&mut self, event: RendererEvent) {
        match event {
            RendererEvent::Progress(position_ms) => {
                trace!(position_ms, "Renderer progress");
            }
            RendererEvent::StateChanged(_) => self.sync_renderer_state(),
            RendererEvent::Completed => self.on_completed().await,
            RendererEvent::Failed(message) => {
                if self.state == PlaybackState::Error
                    && self.error.as_deref() == Some(message.as_str())
                {
                    return;
                }
                error!("{}", PlaybackError::RendererFailure(message.clone()));
                if self.state.is_active() {
                    self.announcements.publish(PlaybackAnnouncement::Stopped);
                }
                self.state = PlaybackState::Error;
                self.error = Some(message);
                self.publish();
            }
            RendererEvent::Resynced { track, position_ms } => {
                let id = track.queue_item_id;
                if self.queue.contains(id) {
                    self.queue.set_position(id);
                } else {
                    warn!("{}", PlaybackError::QueueItemNotFound(id));
                }
                info!(position_ms, "Renderer resynced to {}", track.display_name());
                self.track = Some(track);
                self.sync_renderer_state();
                self.publish();
            }
        }
    }

    /// Follow a state change the renderer made on its own
    ///
    /// The event payload may be stale by the time it is processed, so the
    /// renderer's current state is read instead.
    fn sync_renderer_state(&mut self) {
        let renderer_state = self.renderer.state();
        let following = matches!(
            self.state,
            PlaybackState::Playing | PlaybackState::Buffering | PlaybackState::Paused
        );

        let next = match renderer_state {
            PlaybackState::Playing | PlaybackState::Buffering | PlaybackState::Paused
                if following =>
            {
                renderer_state
            }
            _ => {
                // Connection flag may still have changed
                self.publish();
                return;
            }
        };

        if next == self.state {
            self.publish();
            return;
        }

        match (self.state.is_active(), next.is_active()) {
            (true, false) => {
                self.announcements.publish(PlaybackAnnouncement::Stopped);
            }
            (false, true) => {
                if let Some(track) = &self.track {
                    self.announcements
                        .publish(PlaybackAnnouncement::Starting(track.clone()));
                }
            }
            _ => {}
        }

        debug!(from = ?self.state, to = ?next, "Renderer changed state");
        self.state = next;
        self.publish();
    }

    async fn on_completed(&mut self) {
        if !self.state.is_active() {
            debug!(state = ?self.state, "Ignoring completion");
            return;
        }

        if self.queue.has_next() {
            // Repeat-one keeps the position, so replay the same item
            self.queue.next();
            self.start_current().await;
        } else {
            info!("End of queue");
            self.queue.reset_to_start();
            self.stop(None).await;
        }
    }

    async fn shutdown(&mut self) {
        self.renderer.set_listener(None);
        self.renderer.stop().await;
        if self.state.is_active() {
            self.announcements.publish(PlaybackAnnouncement::Stopped);
        }
        if self.state != PlaybackState::Idle {
            self.state = PlaybackState::Stopped;
        }
        self.publish();
    }

    fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            state: self.state,
            track: self.track.clone(),
            position_ms: self.renderer.current_position(),
            error: self.error.clone(),
            renderer: self.renderer.kind(),
            connected: self.renderer.connected(),
        }
    }

    fn publish(&self) {
        self.snapshots.publish(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::renderer::{TestRenderer, TestRendererProbe, VirtualClock};
    use crate::test_support::sample_track;
    use std::time::Duration;

    struct Fixture {
        handle: PlaybackHandle,
        clock: VirtualClock,
        probe: TestRendererProbe,
        snapshots: tokio_mpsc::UnboundedReceiver<PlayerSnapshot>,
    }

    fn abc() -> Vec<Track> {
        vec![
            sample_track(1, 30_000),
            sample_track(2, 40_000),
            sample_track(3, 20_000),
        ]
    }

    fn fixture() -> Fixture {
        let clock = VirtualClock::new();
        let renderer = TestRenderer::new(&clock);
        let probe = renderer.probe();
        let queue = TrackQueue::with_seed(11);
        let handle = PlaybackCoordinator::start(queue, Box::new(renderer));
        let snapshots = handle.subscribe_snapshots();
        Fixture {
            handle,
            clock,
            probe,
            snapshots,
        }
    }

    async fn wait_for_state(
        rx: &mut tokio_mpsc::UnboundedReceiver<PlayerSnapshot>,
        state: PlaybackState,
    ) -> PlayerSnapshot {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = rx.recv().await.expect("coordinator alive");
                if snapshot.state == state {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", state))
    }

    #[tokio::test]
    async fn test_play_on_empty_queue_is_noop() {
        let f = fixture();
        f.handle.play();

        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Idle);
        assert!(f.probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_set_queue_autoplay_starts_requested_track() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(2), true);

        let snapshot = wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        assert_eq!(snapshot.track.unwrap().queue_item_id, 2);
        assert_eq!(f.probe.calls(), vec!["play:2@0".to_string()]);
    }

    #[tokio::test]
    async fn test_announces_before_state_change() {
        let f = fixture();
        let mut announcements = f.handle.subscribe_announcements();
        f.handle.set_queue(abc(), None, true);
        f.handle.pause();
        f.handle.snapshot().await.unwrap();

        assert_eq!(
            announcements.recv().await,
            Some(PlaybackAnnouncement::Starting(sample_track(1, 30_000)))
        );
        assert_eq!(
            announcements.recv().await,
            Some(PlaybackAnnouncement::Stopped)
        );
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_position() {
        let mut f = fixture();
        f.handle.set_queue(abc(), None, true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.clock.advance(4_000);
        f.handle.pause();
        let paused = wait_for_state(&mut f.snapshots, PlaybackState::Paused).await;
        assert_eq!(paused.position_ms, 4_000);

        f.handle.play();
        let resumed = wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        assert_eq!(resumed.position_ms, 4_000);
        assert_eq!(f.probe.calls().last().unwrap(), "resume");
    }

    #[tokio::test]
    async fn test_skip_next_at_end_stops_with_error() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(3), true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.handle.skip_next();
        let stopped = wait_for_state(&mut f.snapshots, PlaybackState::Error).await;
        assert_eq!(stopped.error.as_deref(), Some("cannot skip"));
    }

    #[tokio::test]
    async fn test_skip_previous_at_start_restarts_track() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(1), true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        f.clock.advance(3_000);

        f.handle.skip_previous();
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.position_ms, 0);
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert_eq!(f.probe.calls().last().unwrap(), "seek:0");
    }

    #[tokio::test]
    async fn test_completion_advances_then_stops_at_end() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(2), true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.clock.advance(40_000);
        let snapshot = wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        assert_eq!(snapshot.track.unwrap().queue_item_id, 3);

        f.clock.advance(20_000);
        let stopped = wait_for_state(&mut f.snapshots, PlaybackState::Stopped).await;
        assert_eq!(stopped.track.unwrap().queue_item_id, 3);
        assert_eq!(f.handle.queue().position(), 0);
    }

    #[tokio::test]
    async fn test_completion_wraps_with_repeat_all() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(3), true);
        f.handle.queue().repeat();
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.clock.advance(20_000);
        let snapshot = wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        assert_eq!(snapshot.track.unwrap().queue_item_id, 1);
    }

    #[tokio::test]
    async fn test_completion_replays_with_repeat_one() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(3), true);
        f.handle.queue().repeat();
        f.handle.queue().repeat();
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.clock.advance(20_000);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        assert_eq!(
            f.probe.calls(),
            vec!["play:3@0".to_string(), "play:3@0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_renderer_failure_surfaces_as_error_state() {
        let mut f = fixture();
        f.handle.set_queue(abc(), None, true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.probe.inject_failure("stream died");
        let snapshot = wait_for_state(&mut f.snapshots, PlaybackState::Error).await;
        assert_eq!(snapshot.error.as_deref(), Some("stream died"));

        // Coordinator is still accepting commands
        f.handle.play();
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
    }

    #[tokio::test]
    async fn test_unknown_queue_item_is_ignored() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(1), true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.handle.play_from_queue_item(42);
        f.handle.play_from_queue_item(3);
        let snapshot = wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        assert_eq!(snapshot.track.unwrap().queue_item_id, 3);
        assert_eq!(
            f.probe.calls(),
            vec!["play:1@0".to_string(), "play:3@0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_switch_renderer_preserves_position_and_resumes() {
        let mut f = fixture();
        f.handle.set_queue(abc(), Some(2), true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;
        f.clock.advance(8_250);

        let before = f.probe.position();
        let next = TestRenderer::new(&f.clock);
        let next_probe = next.probe();
        f.handle.switch_renderer(Box::new(next), true).await.unwrap();

        assert_eq!(next_probe.initial_position_ms(), Some(before));
        assert_eq!(
            next_probe.calls(),
            vec!["prepare:2@8250".to_string(), "resume".to_string()]
        );
        assert_eq!(f.probe.calls().last().unwrap(), "stop");
        assert!(!f.probe.has_listener());

        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert_eq!(snapshot.position_ms, 8_250);
    }

    #[tokio::test]
    async fn test_switch_renderer_without_resume_pauses() {
        let mut f = fixture();
        f.handle.set_queue(abc(), None, true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        let next = TestRenderer::new(&f.clock);
        let next_probe = next.probe();
        f.handle.switch_renderer(Box::new(next), false).await.unwrap();

        assert_eq!(next_probe.state(), PlaybackState::Paused);
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Paused);
    }

    #[tokio::test]
    async fn test_switch_renderer_while_stopped_stays_stopped() {
        let f = fixture();
        f.handle.set_queue(abc(), None, false);

        let next = TestRenderer::new(&f.clock);
        let next_probe = next.probe();
        f.handle.switch_renderer(Box::new(next), true).await.unwrap();

        assert_eq!(next_probe.calls(), vec!["prepare:1@0".to_string()]);
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_events_from_replaced_renderer_are_dropped() {
        let mut f = fixture();
        f.handle.set_queue(abc(), None, true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        let next = TestRenderer::new(&f.clock);
        f.handle.switch_renderer(Box::new(next), true).await.unwrap();

        // Old renderer has no listener anymore; a failure on it changes nothing
        f.probe.inject_failure("late failure");
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Playing);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_start_announces_stopped() {
        let clock = VirtualClock::new();
        let renderer = TestRenderer::new(&clock);
        renderer.fail_next_play("no route");
        let handle = PlaybackCoordinator::start(TrackQueue::with_seed(11), Box::new(renderer));
        let mut announcements = handle.subscribe_announcements();
        let mut snapshots = handle.subscribe_snapshots();

        handle.set_queue(abc(), None, true);
        let failed = wait_for_state(&mut snapshots, PlaybackState::Error).await;
        assert_eq!(failed.track.unwrap().queue_item_id, 1);

        assert_eq!(
            announcements.recv().await,
            Some(PlaybackAnnouncement::Starting(sample_track(1, 30_000)))
        );
        assert_eq!(
            announcements.recv().await,
            Some(PlaybackAnnouncement::Stopped)
        );

        // The listener's failure event fills in the message without a
        // second announcement
        tokio::time::timeout(Duration::from_secs(2), async {
            while snapshots.recv().await.expect("coordinator alive").error.is_none() {}
        })
        .await
        .expect("failure message");
        assert_eq!(
            handle.snapshot().await.unwrap().error.as_deref(),
            Some("no route")
        );
        assert!(announcements.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_with_nothing_loaded_is_noop() {
        let f = fixture();
        let mut announcements = f.handle.subscribe_announcements();

        f.handle.stop();
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Idle);
        assert!(f.probe.calls().is_empty());
        assert!(announcements.try_recv().is_err());

        // Loaded but never started is still nothing to stop
        f.handle.set_queue(abc(), None, false);
        f.handle.stop();
        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Idle);
        assert!(announcements.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_after_pause_announces_once() {
        let mut f = fixture();
        let mut announcements = f.handle.subscribe_announcements();
        f.handle.set_queue(abc(), None, true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.handle.pause();
        f.handle.stop();
        wait_for_state(&mut f.snapshots, PlaybackState::Stopped).await;

        let mut seen = Vec::new();
        while let Ok(announcement) = announcements.try_recv() {
            seen.push(announcement);
        }
        assert_eq!(
            seen,
            vec![
                PlaybackAnnouncement::Starting(sample_track(1, 30_000)),
                PlaybackAnnouncement::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_renderer_initiated_pause_announces_stopped() {
        use crate::playback::renderer::{engine_channel, EngineEvent, FocusChange, LocalRenderer};
        use crate::test_support::{MockAudioEngine, MockWakeLock};
        use std::sync::Arc;

        let (engine_tx, engine_rx) = engine_channel();
        let renderer = LocalRenderer::new(
            Arc::new(MockAudioEngine::new()),
            engine_rx,
            Arc::new(MockWakeLock::new()),
            0.2,
        );
        let focus = renderer.focus_sender();
        let handle = PlaybackCoordinator::start(TrackQueue::with_seed(11), Box::new(renderer));
        let mut snapshots = handle.subscribe_snapshots();
        let mut announcements = handle.subscribe_announcements();

        handle.set_queue(abc(), None, true);
        wait_for_state(&mut snapshots, PlaybackState::Buffering).await;
        engine_tx.send(EngineEvent::Ready);
        wait_for_state(&mut snapshots, PlaybackState::Playing).await;

        focus.send(FocusChange::LossTransient).unwrap();
        wait_for_state(&mut snapshots, PlaybackState::Paused).await;

        assert!(matches!(
            announcements.recv().await,
            Some(PlaybackAnnouncement::Starting(_))
        ));
        assert_eq!(
            announcements.recv().await,
            Some(PlaybackAnnouncement::Stopped)
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_renderer() {
        let mut f = fixture();
        f.handle.set_queue(abc(), None, true);
        wait_for_state(&mut f.snapshots, PlaybackState::Playing).await;

        f.handle.shutdown().await;
        assert_eq!(f.probe.state(), PlaybackState::Stopped);
        assert!(f.handle.is_closed());
        assert_eq!(
            f.handle.snapshot().await.unwrap_err(),
            PlaybackError::SessionClosed
        );
    }
}
