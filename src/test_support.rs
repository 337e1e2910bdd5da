// Test support utilities for both unit and integration tests

use crate::models::{QueueItemId, Track};
use crate::playback::renderer::{
    AudioEngine, CastError, CastMedia, CastSession, EngineError, WakeLock,
};
use crate::playback::timeline::{ReportError, TimelineClient, TimelineReport};
use std::sync::Mutex;

/// Track with predictable fields derived from `id`
pub fn sample_track(id: QueueItemId, duration_ms: u64) -> Track {
    Track {
        queue_item_id: id,
        key: format!("/library/metadata/{}", id),
        title: format!("Track {}", id),
        artist_title: "Test Artist".to_string(),
        album_title: "Test Album".to_string(),
        duration_ms,
        source_uri: format!("http://server/{}.flac", id),
        art_uri: None,
    }
}

#[derive(Default)]
struct EngineCalls {
    loaded: Option<(String, u64)>,
    position_ms: u64,
    started: bool,
    stopped: bool,
    volume: f32,
    fail_next_load: Option<EngineError>,
}

/// In-memory audio engine that records what it was told to do
///
/// Position only moves on load and seek.
#[derive(Default)]
pub struct MockAudioEngine {
    calls: Mutex<EngineCalls>,
}

impl MockAudioEngine {
    #[allow(unused)] // Used in tests
    pub fn new() -> Self {
        let engine = Self::default();
        engine.calls.lock().unwrap().volume = 1.0;
        engine
    }

    pub fn fail_next_load(&self, error: EngineError) {
        self.calls.lock().unwrap().fail_next_load = Some(error);
    }

    pub fn loaded(&self) -> Option<(String, u64)> {
        self.calls.lock().unwrap().loaded.clone()
    }

    pub fn started(&self) -> bool {
        self.calls.lock().unwrap().started
    }

    pub fn stopped(&self) -> bool {
        self.calls.lock().unwrap().stopped
    }

    pub fn volume(&self) -> f32 {
        self.calls.lock().unwrap().volume
    }
}

impl AudioEngine for MockAudioEngine {
    fn load(&self, source_uri: &str, start_ms: u64) -> Result<(), EngineError> {
        let mut calls = self.calls.lock().unwrap();
        if let Some(error) = calls.fail_next_load.take() {
            return Err(error);
        }
        calls.loaded = Some((source_uri.to_string(), start_ms));
        calls.position_ms = start_ms;
        calls.started = false;
        calls.stopped = false;
        Ok(())
    }

    fn start(&self) -> Result<(), EngineError> {
        self.calls.lock().unwrap().started = true;
        Ok(())
    }

    fn pause(&self) {
        self.calls.lock().unwrap().started = false;
    }

    fn stop(&self) {
        let mut calls = self.calls.lock().unwrap();
        calls.started = false;
        calls.stopped = true;
    }

    fn seek(&self, position_ms: u64) -> Result<(), EngineError> {
        self.calls.lock().unwrap().position_ms = position_ms;
        Ok(())
    }

    fn position_ms(&self) -> u64 {
        self.calls.lock().unwrap().position_ms
    }

    fn set_volume(&self, volume: f32) {
        self.calls.lock().unwrap().volume = volume;
    }
}

#[derive(Default)]
struct WakeCounts {
    acquired: usize,
    released: usize,
}

/// Wake lock that only counts
#[derive(Default)]
pub struct MockWakeLock {
    counts: Mutex<WakeCounts>,
}

impl MockWakeLock {
    #[allow(unused)] // Used in tests
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> bool {
        let counts = self.counts.lock().unwrap();
        counts.acquired > counts.released
    }

    pub fn acquire_count(&self) -> usize {
        self.counts.lock().unwrap().acquired
    }

    pub fn release_count(&self) -> usize {
        self.counts.lock().unwrap().released
    }
}

impl WakeLock for MockWakeLock {
    fn acquire(&self) {
        self.counts.lock().unwrap().acquired += 1;
    }

    fn release(&self) {
        self.counts.lock().unwrap().released += 1;
    }
}

#[derive(Default)]
struct CastCalls {
    loads: Vec<CastMedia>,
    plays: usize,
    pauses: usize,
    stops: usize,
    seeks: Vec<u64>,
    fail_next: Option<String>,
}

/// Cast session that accepts everything unless told to fail
#[derive(Default)]
pub struct MockCastSession {
    calls: Mutex<CastCalls>,
}

impl MockCastSession {
    #[allow(unused)] // Used in tests
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next session call fail with `message`
    pub fn fail_next(&self, message: &str) {
        self.calls.lock().unwrap().fail_next = Some(message.to_string());
    }

    pub fn last_load(&self) -> Option<CastMedia> {
        self.calls.lock().unwrap().loads.last().cloned()
    }

    pub fn play_calls(&self) -> usize {
        self.calls.lock().unwrap().plays
    }

    pub fn pause_calls(&self) -> usize {
        self.calls.lock().unwrap().pauses
    }

    pub fn stop_calls(&self) -> usize {
        self.calls.lock().unwrap().stops
    }

    pub fn seeks(&self) -> Vec<u64> {
        self.calls.lock().unwrap().seeks.clone()
    }

    fn check(&self) -> Result<std::sync::MutexGuard<'_, CastCalls>, CastError> {
        let mut calls = self.calls.lock().unwrap();
        match calls.fail_next.take() {
            Some(message) => Err(CastError::Session(message)),
            None => Ok(calls),
        }
    }
}

#[async_trait::async_trait]
impl CastSession for MockCastSession {
    async fn load(&self, media: CastMedia) -> Result<(), CastError> {
        self.check()?.loads.push(media);
        Ok(())
    }

    async fn play(&self) -> Result<(), CastError> {
        self.check()?.plays += 1;
        Ok(())
    }

    async fn pause(&self) -> Result<(), CastError> {
        self.check()?.pauses += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<(), CastError> {
        self.check()?.stops += 1;
        Ok(())
    }

    async fn seek(&self, position_ms: u64) -> Result<(), CastError> {
        self.check()?.seeks.push(position_ms);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct TimelineCalls {
    attempts: Vec<TimelineReport>,
    delivered: Vec<TimelineReport>,
}

/// Timeline client that records reports instead of sending them
#[derive(Default)]
pub struct MockTimelineClient {
    calls: Mutex<TimelineCalls>,
    /// 1-based attempt number that fails
    fail_on: Option<usize>,
}

impl MockTimelineClient {
    #[allow(unused)] // Used in tests
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `attempt`-th report (1-based) with a 503
    pub fn failing_on(attempt: usize) -> Self {
        Self {
            fail_on: Some(attempt),
            ..Self::default()
        }
    }

    /// Every report the reporter tried to send, failed ones included
    pub fn attempts(&self) -> Vec<TimelineReport> {
        self.calls.lock().unwrap().attempts.clone()
    }

    pub fn delivered(&self) -> Vec<TimelineReport> {
        self.calls.lock().unwrap().delivered.clone()
    }
}

#[async_trait::async_trait]
impl TimelineClient for MockTimelineClient {
    async fn report(&self, report: &TimelineReport) -> Result<(), ReportError> {
        let mut calls = self.calls.lock().unwrap();
        calls.attempts.push(report.clone());
        if self.fail_on == Some(calls.attempts.len()) {
            return Err(ReportError::Status(503));
        }
        calls.delivered.push(report.clone());
        Ok(())
    }
}
