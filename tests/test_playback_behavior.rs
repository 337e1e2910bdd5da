#![cfg(feature = "test-utils")]

mod support;
use std::time::Duration;

use crate::support::{abc_queue, next_value, tracing_init, wait_for_state};
use tokio::sync::mpsc::UnboundedReceiver;
use tonearm::playback::renderer::{TestRenderer, TestRendererProbe, VirtualClock};
use tonearm::playback::{
    PlaybackAnnouncement, PlaybackSession, PlaybackState, PlayerSnapshot, RepeatMode, TrackQueue,
};
use tonearm::Config;

/// Session on a clock-driven renderer with the A/B/C queue loaded
struct PlaybackTestFixture {
    session: PlaybackSession,
    clock: VirtualClock,
    probe: TestRendererProbe,
    snapshots: UnboundedReceiver<PlayerSnapshot>,
}

impl PlaybackTestFixture {
    fn new() -> Self {
        tracing_init();

        let clock = VirtualClock::new();
        let renderer = TestRenderer::new(&clock);
        let probe = renderer.probe();
        let session = PlaybackSession::start_with_queue(
            &Config::default(),
            TrackQueue::with_seed(42),
            Box::new(renderer),
            None,
        );
        session.queue().set_queue(abc_queue(), None);
        let snapshots = session.handle().subscribe_snapshots();

        Self {
            session,
            clock,
            probe,
            snapshots,
        }
    }

    async fn wait_for_state(&mut self, state: PlaybackState) -> PlayerSnapshot {
        wait_for_state(&mut self.snapshots, state).await
    }

    fn current_id(&self) -> Option<u64> {
        self.session
            .queue()
            .current_track()
            .map(|t| t.queue_item_id)
    }
}

#[tokio::test]
async fn test_abc_walkthrough() {
    let mut fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();

    handle.play_from_queue_item(2);
    let playing = fixture.wait_for_state(PlaybackState::Playing).await;
    assert_eq!(playing.track.unwrap().queue_item_id, 2);

    assert!(fixture.session.queue().next());
    assert_eq!(fixture.current_id(), Some(3));

    // Already on the last item with repeat off
    assert!(!fixture.session.queue().next());
    assert_eq!(fixture.current_id(), Some(3));

    assert_eq!(fixture.session.bus().repeat(), RepeatMode::All);
    assert!(fixture.session.queue().next());
    assert_eq!(fixture.current_id(), Some(1));

    fixture.session.shutdown().await;
}

#[tokio::test]
async fn test_completion_at_end_stops_and_resets() {
    let mut fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();

    handle.play_from_queue_item(3);
    fixture.wait_for_state(PlaybackState::Playing).await;

    fixture.clock.advance(20_000);
    let stopped = fixture.wait_for_state(PlaybackState::Stopped).await;
    assert_eq!(stopped.track.unwrap().queue_item_id, 3);
    assert_eq!(fixture.session.queue().position(), 0);
    assert_eq!(fixture.probe.state(), PlaybackState::Stopped);

    fixture.session.shutdown().await;
}

#[tokio::test]
async fn test_queue_plays_through() {
    let mut fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();

    handle.play();
    fixture.wait_for_state(PlaybackState::Playing).await;

    fixture.clock.advance(30_000);
    let second = fixture.wait_for_state(PlaybackState::Playing).await;
    assert_eq!(second.track.unwrap().queue_item_id, 2);

    fixture.clock.advance(40_000);
    let third = fixture.wait_for_state(PlaybackState::Playing).await;
    assert_eq!(third.track.unwrap().queue_item_id, 3);

    fixture.clock.advance(20_000);
    fixture.wait_for_state(PlaybackState::Stopped).await;

    assert_eq!(
        fixture.probe.calls(),
        vec!["play:1@0", "play:2@0", "play:3@0"]
    );
    fixture.session.shutdown().await;
}

#[tokio::test]
async fn test_skip_past_end_reports_error() {
    let mut fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();

    handle.play_from_queue_item(3);
    fixture.wait_for_state(PlaybackState::Playing).await;

    handle.skip_next();
    let failed = fixture.wait_for_state(PlaybackState::Error).await;
    assert_eq!(failed.error.as_deref(), Some("cannot skip"));

    fixture.session.shutdown().await;
}

#[tokio::test]
async fn test_switch_renderer_keeps_exact_position() {
    let mut fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();

    handle.play_from_queue_item(2);
    fixture.wait_for_state(PlaybackState::Playing).await;
    fixture.clock.advance(12_345);

    let expected = fixture.probe.position();
    let next = TestRenderer::new(&fixture.clock);
    let next_probe = next.probe();
    handle.switch_renderer(Box::new(next), true).await.unwrap();

    assert_eq!(next_probe.initial_position_ms(), Some(expected));
    assert_eq!(next_probe.state(), PlaybackState::Playing);
    assert_eq!(fixture.probe.state(), PlaybackState::Stopped);

    // Time keeps flowing on the new renderer only
    fixture.clock.advance(1_000);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.position_ms, expected + 1_000);
    assert_eq!(fixture.probe.position(), 0);

    fixture.session.shutdown().await;
}

#[tokio::test]
async fn test_announcements_bracket_playback() {
    let mut fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();
    let mut announcements = handle.subscribe_announcements();

    handle.play();
    fixture.wait_for_state(PlaybackState::Playing).await;
    handle.stop();
    fixture.wait_for_state(PlaybackState::Stopped).await;

    assert!(matches!(
        next_value(&mut announcements).await,
        PlaybackAnnouncement::Starting(track) if track.queue_item_id == 1
    ));
    assert_eq!(
        next_value(&mut announcements).await,
        PlaybackAnnouncement::Stopped
    );

    fixture.session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_progress_ticks_every_second_from_seek_position() {
    let fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();
    let mut progress = fixture.session.bus().subscribe_progress();

    handle.play();
    handle.seek_to(5_000);

    while next_value(&mut progress).await != 5_000 {}
    for expected in [6_000, 7_000, 8_000] {
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(next_value(&mut progress).await, expected);
    }

    fixture.session.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_renderer() {
    let mut fixture = PlaybackTestFixture::new();
    let handle = fixture.session.handle().clone();

    handle.play();
    fixture.wait_for_state(PlaybackState::Playing).await;

    fixture.session.shutdown().await;
    assert_eq!(fixture.probe.state(), PlaybackState::Stopped);
    assert!(fixture.probe.track().is_none());
    assert!(handle.snapshot().await.is_err());
}
