use crate::models::QueueItemId;
use crate::playback::feed::Feed;
use crate::playback::queue::{QueueMode, QueueSnapshot, RepeatMode};
use crate::playback::service::{PlaybackHandle, PlaybackState, PlayerSnapshot};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Progress value tagged with the queue item it was measured on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemProgress {
    pub queue_item_id: QueueItemId,
    pub position_ms: u64,
}

/// The plain and item-tagged progress feeds, always published together
#[derive(Clone)]
struct ProgressFeeds {
    plain: Feed<u64>,
    tagged: Feed<ItemProgress>,
}

impl ProgressFeeds {
    fn publish(&self, queue_item_id: QueueItemId, position_ms: u64) {
        self.tagged.publish(ItemProgress {
            queue_item_id,
            position_ms,
        });
        self.plain.publish(position_ms);
    }
}

/// Read-side projection of the coordinator plus a command relay
///
/// `state` is distinct-until-changed. `progress` is computed locally from
/// the last published position and elapsed time, so the renderer is never
/// polled per tick. Ticking pauses while the renderer reports itself
/// disconnected. Both replay their latest value to new subscribers.
pub struct StateBus {
    handle: PlaybackHandle,
    state: Feed<PlaybackState>,
    progress: ProgressFeeds,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    projection: JoinHandle<()>,
}

impl StateBus {
    pub fn new(handle: PlaybackHandle, tick_interval: Duration) -> Self {
        let state = Feed::distinct("state");
        let progress = ProgressFeeds {
            plain: Feed::new("progress"),
            tagged: Feed::new("item_progress"),
        };
        let ticker: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        let snapshots = handle.subscribe_snapshots();
        let projection = tokio::spawn(project(
            snapshots,
            state.clone(),
            progress.clone(),
            ticker.clone(),
            tick_interval,
        ));

        Self {
            handle,
            state,
            progress,
            ticker,
            projection,
        }
    }

    pub fn subscribe_state(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackState> {
        self.state.subscribe()
    }

    pub fn subscribe_progress(&self) -> tokio_mpsc::UnboundedReceiver<u64> {
        self.progress.plain.subscribe()
    }

    /// Progress together with the queue item it belongs to
    pub fn subscribe_item_progress(&self) -> tokio_mpsc::UnboundedReceiver<ItemProgress> {
        self.progress.tagged.subscribe()
    }

    pub fn subscribe_queue(&self) -> tokio_mpsc::UnboundedReceiver<QueueSnapshot> {
        self.handle.queue().subscribe_queue()
    }

    pub fn subscribe_mode(&self) -> tokio_mpsc::UnboundedReceiver<QueueMode> {
        self.handle.queue().subscribe_mode()
    }

    pub fn subscribe_snapshots(&self) -> tokio_mpsc::UnboundedReceiver<PlayerSnapshot> {
        self.handle.subscribe_snapshots()
    }

    pub fn state(&self) -> PlaybackState {
        self.state.latest().unwrap_or_default()
    }

    pub fn progress(&self) -> u64 {
        self.progress.plain.latest().unwrap_or(0)
    }

    pub fn play(&self) {
        self.handle.play();
    }

    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn toggle_play_pause(&self) {
        self.handle.toggle_play_pause();
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn seek_to(&self, position_ms: u64) {
        self.handle.seek_to(position_ms);
    }

    pub fn skip_next(&self) {
        self.handle.skip_next();
    }

    pub fn skip_previous(&self) {
        self.handle.skip_previous();
    }

    pub fn play_from_queue_item(&self, id: QueueItemId) {
        self.handle.play_from_queue_item(id);
    }

    pub fn shuffle(&self) {
        self.handle.queue().shuffle();
    }

    pub fn repeat(&self) -> RepeatMode {
        self.handle.queue().repeat()
    }

    pub fn handle(&self) -> &PlaybackHandle {
        &self.handle
    }

    /// Stop projecting and cancel the ticker
    pub fn close(&self) {
        self.projection.abort();
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.abort();
        }
    }
}

impl Drop for StateBus {
    fn drop(&mut self) {
        self.close();
    }
}

/// `tokio::time::interval` panics on a zero period
const MIN_TICK: Duration = Duration::from_millis(1);

async fn project(
    mut snapshots: tokio_mpsc::UnboundedReceiver<PlayerSnapshot>,
    state: Feed<PlaybackState>,
    progress: ProgressFeeds,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
) {
    while let Some(snapshot) = snapshots.recv().await {
        {
            let mut ticker = ticker.lock().unwrap();
            if let Some(previous) = ticker.take() {
                previous.abort();
            }

            match &snapshot.track {
                Some(track) if snapshot.state == PlaybackState::Playing && snapshot.connected => {
                    let limit = Some(track.duration_ms).filter(|d| *d > 0);
                    trace!(base_ms = snapshot.position_ms, "Starting progress ticker");
                    *ticker = Some(tokio::spawn(tick(
                        progress.clone(),
                        track.queue_item_id,
                        snapshot.position_ms,
                        limit,
                        tick_interval,
                    )));
                }
                Some(track) => {
                    if !snapshot.connected {
                        debug!(position_ms = snapshot.position_ms, "Renderer disconnected, progress frozen");
                    }
                    progress.publish(track.queue_item_id, snapshot.position_ms);
                }
                None => {}
            }
        }

        if state.publish(snapshot.state) {
            debug!(state = ?snapshot.state, "Playback state changed");
        }
    }
}

async fn tick(
    progress: ProgressFeeds,
    queue_item_id: QueueItemId,
    base_ms: u64,
    limit_ms: Option<u64>,
    every: Duration,
) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(every.max(MIN_TICK));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // First tick completes immediately
        interval.tick().await;
        let mut position = base_ms + started.elapsed().as_millis() as u64;
        if let Some(limit) = limit_ms {
            position = position.min(limit);
        }
        progress.publish(queue_item_id, position);
    }
}
