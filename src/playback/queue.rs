use crate::models::{QueueItemId, Track};
use crate::playback::feed::Feed;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShuffleMode {
    #[default]
    Off,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

impl RepeatMode {
    /// Off -> All -> One -> Off
    pub fn cycled(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::Off,
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatMode::Off => write!(f, "off"),
            RepeatMode::All => write!(f, "repeat-all"),
            RepeatMode::One => write!(f, "repeat-one"),
        }
    }
}

/// Value of the `queue` feed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueSnapshot {
    pub tracks: Arc<Vec<Track>>,
    pub position: usize,
}

impl QueueSnapshot {
    pub fn current_track(&self) -> Option<&Track> {
        self.tracks.get(self.position)
    }
}

/// Value of the `mode` feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMode {
    pub shuffle: ShuffleMode,
    pub repeat: RepeatMode,
}

struct QueueInner {
    tracks: Arc<Vec<Track>>,
    /// Index of each item in the order it was enqueued, used to unshuffle
    canonical: HashMap<QueueItemId, usize>,
    position: usize,
    shuffle: ShuffleMode,
    repeat: RepeatMode,
    rng: StdRng,
}

impl QueueInner {
    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            tracks: self.tracks.clone(),
            position: self.position,
        }
    }

    fn mode(&self) -> QueueMode {
        QueueMode {
            shuffle: self.shuffle,
            repeat: self.repeat,
        }
    }

    fn index_of(&self, id: QueueItemId) -> Option<usize> {
        self.tracks.iter().position(|t| t.queue_item_id == id)
    }
}

/// Ordered playback list with a current position and shuffle/repeat modes
///
/// Cloning yields another handle to the same queue. Every mutation runs
/// under one lock and publishes its resulting snapshot before releasing it,
/// so readers never see a half-applied shuffle and subscribers see
/// snapshots in mutation order.
#[derive(Clone)]
pub struct TrackQueue {
    inner: Arc<Mutex<QueueInner>>,
    queue_feed: Feed<QueueSnapshot>,
    mode_feed: Feed<QueueMode>,
}

impl Default for TrackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Queue with a fixed shuffle seed, for reproducible shuffles
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        let inner = QueueInner {
            tracks: Arc::new(Vec::new()),
            canonical: HashMap::new(),
            position: 0,
            shuffle: ShuffleMode::Off,
            repeat: RepeatMode::Off,
            rng,
        };

        let queue_feed = Feed::new("queue");
        let mode_feed = Feed::distinct("mode");
        queue_feed.publish(inner.snapshot());
        mode_feed.publish(inner.mode());

        Self {
            inner: Arc::new(Mutex::new(inner)),
            queue_feed,
            mode_feed,
        }
    }

    /// Replace the whole list and start at `start_id` (or the first track)
    pub fn set_queue(&self, tracks: Vec<Track>, start_id: Option<QueueItemId>) {
        let mut inner = self.inner.lock().unwrap();

        inner.canonical = tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.queue_item_id, i))
            .collect();
        inner.tracks = Arc::new(tracks);
        let start = start_id.and_then(|id| inner.index_of(id)).unwrap_or(0);
        inner.position = start;
        inner.shuffle = ShuffleMode::Off;

        debug!(
            tracks = inner.tracks.len(),
            position = inner.position,
            "Queue replaced"
        );

        self.queue_feed.publish(inner.snapshot());
        self.mode_feed.publish(inner.mode());
    }

    /// Current track, or None when the queue is empty
    pub fn current_track(&self) -> Option<Track> {
        let inner = self.inner.lock().unwrap();
        inner.tracks.get(inner.position).cloned()
    }

    /// Current track of a queue known to be non-empty
    ///
    /// # Panics
    /// Panics on an empty queue; check [`TrackQueue::is_empty`] first.
    pub fn current_track_unchecked(&self) -> Track {
        let inner = self.inner.lock().unwrap();
        match inner.tracks.get(inner.position) {
            Some(track) => track.clone(),
            None => panic!("current_track_unchecked called on an empty queue"),
        }
    }

    /// Jump to a queue item. Returns true if the position changed.
    pub fn set_position(&self, id: QueueItemId) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.index_of(id) {
            Some(index) if index != inner.position => {
                inner.position = index;
                self.queue_feed.publish(inner.snapshot());
                true
            }
            Some(_) => false,
            None => {
                debug!(queue_item_id = id, "Queue item not in queue");
                false
            }
        }
    }

    /// Whether the queue currently holds `id`
    pub fn contains(&self, id: QueueItemId) -> bool {
        self.inner.lock().unwrap().index_of(id).is_some()
    }

    /// Advance one track. Returns whether the position effectively moved.
    pub fn next(&self) -> bool {
        self.step(Direction::Forward)
    }

    /// Go back one track. Returns whether the position effectively moved.
    pub fn previous(&self) -> bool {
        self.step(Direction::Backward)
    }

    fn step(&self, direction: Direction) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.tracks.len();

        if len == 0 || inner.repeat == RepeatMode::One {
            return false;
        }

        let position = inner.position;
        let (candidate, boundary) = match direction {
            Direction::Forward if position + 1 < len => (Some(position + 1), len - 1),
            Direction::Forward => (None, len - 1),
            Direction::Backward if position > 0 => (Some(position - 1), 0),
            Direction::Backward => (None, 0),
        };

        let moved = match (candidate, inner.repeat) {
            (Some(index), _) => {
                inner.position = index;
                true
            }
            (None, RepeatMode::All) => {
                inner.position = match direction {
                    Direction::Forward => 0,
                    Direction::Backward => len - 1,
                };
                true
            }
            (None, _) => {
                // Clamped at the boundary; the snapshot is still re-published
                // below so observers refresh, matching the established behaviour.
                inner.position = boundary;
                debug!(?direction, position = boundary, "Queue at boundary");
                false
            }
        };

        self.queue_feed.publish(inner.snapshot());
        moved
    }

    /// Toggle shuffle. Keeps the current track current.
    pub fn shuffle(&self) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let current_id = inner.tracks.get(inner.position).map(|t| t.queue_item_id);

        match inner.shuffle {
            ShuffleMode::Off => {
                Arc::make_mut(&mut inner.tracks).shuffle(&mut inner.rng);
                inner.shuffle = ShuffleMode::All;
            }
            ShuffleMode::All => {
                let canonical = &inner.canonical;
                Arc::make_mut(&mut inner.tracks).sort_by_key(|t| {
                    canonical
                        .get(&t.queue_item_id)
                        .copied()
                        .unwrap_or(usize::MAX)
                });
                inner.shuffle = ShuffleMode::Off;
            }
        }

        if let Some(index) = current_id.and_then(|id| inner.index_of(id)) {
            inner.position = index;
        }

        debug!(shuffle = ?inner.shuffle, position = inner.position, "Shuffle toggled");
        self.queue_feed.publish(inner.snapshot());
        self.mode_feed.publish(inner.mode());
    }

    /// Cycle the repeat mode Off -> All -> One -> Off
    pub fn repeat(&self) -> RepeatMode {
        let mut inner = self.inner.lock().unwrap();
        inner.repeat = inner.repeat.cycled();
        debug!(repeat = %inner.repeat, "Repeat mode changed");
        self.mode_feed.publish(inner.mode());
        inner.repeat
    }

    pub fn has_next(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.tracks.is_empty() {
            return false;
        }
        inner.position + 1 < inner.tracks.len() || inner.repeat != RepeatMode::Off
    }

    /// Move back to the first position, used when playback runs off the end
    pub fn reset_to_start(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.position = 0;
        self.queue_feed.publish(inner.snapshot());
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tracks.len()
    }

    pub fn position(&self) -> usize {
        self.inner.lock().unwrap().position
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.lock().unwrap().snapshot()
    }

    pub fn mode(&self) -> QueueMode {
        self.inner.lock().unwrap().mode()
    }

    pub fn subscribe_queue(&self) -> tokio_mpsc::UnboundedReceiver<QueueSnapshot> {
        self.queue_feed.subscribe()
    }

    pub fn subscribe_mode(&self) -> tokio_mpsc::UnboundedReceiver<QueueMode> {
        self.mode_feed.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: QueueItemId, duration_ms: u64) -> Track {
        Track {
            queue_item_id: id,
            key: format!("/library/metadata/{}", id),
            title: format!("Track {}", id),
            artist_title: "Artist".to_string(),
            album_title: "Album".to_string(),
            duration_ms,
            source_uri: format!("http://server/{}.flac", id),
            art_uri: None,
        }
    }

    fn abc() -> Vec<Track> {
        vec![track(1, 30_000), track(2, 40_000), track(3, 20_000)]
    }

    fn ids(queue: &TrackQueue) -> Vec<QueueItemId> {
        queue
            .snapshot()
            .tracks
            .iter()
            .map(|t| t.queue_item_id)
            .collect()
    }

    #[test]
    fn test_set_queue_starts_at_requested_item() {
        let queue = TrackQueue::with_seed(1);
        for start in [1, 2, 3] {
            queue.set_queue(abc(), Some(start));
            assert_eq!(queue.current_track().unwrap().queue_item_id, start);
        }

        queue.set_queue(abc(), Some(99));
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn test_set_queue_clears_shuffle() {
        let queue = TrackQueue::with_seed(1);
        queue.set_queue(abc(), None);
        queue.shuffle();
        assert_eq!(queue.mode().shuffle, ShuffleMode::All);

        queue.set_queue(abc(), None);
        assert_eq!(queue.mode().shuffle, ShuffleMode::Off);
    }

    #[test]
    fn test_set_position() {
        let queue = TrackQueue::with_seed(1);
        queue.set_queue(abc(), Some(1));

        assert!(queue.set_position(3));
        assert_eq!(queue.current_track().unwrap().queue_item_id, 3);
        assert!(!queue.set_position(3));
        assert!(!queue.set_position(42));
        assert_eq!(queue.position(), 2);
    }

    #[test]
    fn test_next_and_previous_with_repeat_off() {
        let queue = TrackQueue::with_seed(1);
        queue.set_queue(abc(), Some(2));

        assert!(queue.next());
        assert_eq!(queue.current_track().unwrap().queue_item_id, 3);
        assert!(!queue.next());
        assert_eq!(queue.current_track().unwrap().queue_item_id, 3);

        assert!(queue.previous());
        assert!(queue.previous());
        assert!(!queue.previous());
        assert_eq!(queue.position(), 0);
    }

    #[test]
    fn test_repeat_all_wraps() {
        let queue = TrackQueue::with_seed(1);
        queue.set_queue(abc(), Some(3));
        queue.repeat();
        assert_eq!(queue.mode().repeat, RepeatMode::All);

        assert!(queue.next());
        assert_eq!(queue.current_track().unwrap().queue_item_id, 1);
        assert!(queue.previous());
        assert_eq!(queue.current_track().unwrap().queue_item_id, 3);
    }

    #[test]
    fn test_repeat_one_never_moves() {
        let queue = TrackQueue::with_seed(1);
        queue.set_queue(abc(), Some(1));
        queue.repeat();
        queue.repeat();
        assert_eq!(queue.mode().repeat, RepeatMode::One);

        assert!(!queue.next());
        assert!(!queue.previous());
        assert_eq!(queue.position(), 0);
        assert!(queue.has_next());
    }

    #[test]
    fn test_repeat_cycles_back_to_off() {
        let queue = TrackQueue::new();
        assert_eq!(queue.repeat(), RepeatMode::All);
        assert_eq!(queue.repeat(), RepeatMode::One);
        assert_eq!(queue.repeat(), RepeatMode::Off);
    }

    #[test]
    fn test_has_next() {
        let queue = TrackQueue::with_seed(1);
        assert!(!queue.has_next());

        queue.set_queue(abc(), Some(2));
        assert!(queue.has_next());
        queue.next();
        assert!(!queue.has_next());
        queue.repeat();
        assert!(queue.has_next());
    }

    #[test]
    fn test_shuffle_is_permutation_preserving_current() {
        let queue = TrackQueue::with_seed(7);
        let tracks: Vec<Track> = (1..=20).map(|i| track(i, 1000)).collect();
        queue.set_queue(tracks, Some(5));

        queue.shuffle();
        assert_eq!(queue.current_track().unwrap().queue_item_id, 5);
        let mut shuffled = ids(&queue);
        shuffled.sort();
        assert_eq!(shuffled, (1..=20).collect::<Vec<_>>());

        queue.shuffle();
        assert_eq!(queue.mode().shuffle, ShuffleMode::Off);
        assert_eq!(ids(&queue), (1..=20).collect::<Vec<_>>());
        assert_eq!(queue.current_track().unwrap().queue_item_id, 5);
    }

    #[test]
    fn test_same_seed_shuffles_identically() {
        let a = TrackQueue::with_seed(99);
        let b = TrackQueue::with_seed(99);
        let tracks: Vec<Track> = (1..=10).map(|i| track(i, 1000)).collect();
        a.set_queue(tracks.clone(), None);
        b.set_queue(tracks, None);

        a.shuffle();
        b.shuffle();
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_boundary_step_republishes_snapshot() {
        let queue = TrackQueue::with_seed(1);
        queue.set_queue(abc(), Some(3));
        let mut rx = queue.subscribe_queue();
        let _ = rx.try_recv();

        assert!(!queue.next());
        let snapshot = rx.try_recv().expect("boundary step publishes");
        assert_eq!(snapshot.position, 2);
    }

    #[test]
    fn test_mode_feed_is_distinct() {
        let queue = TrackQueue::with_seed(1);
        let mut rx = queue.subscribe_mode();
        assert_eq!(rx.try_recv().unwrap(), QueueMode::default());

        queue.set_queue(abc(), None);
        assert!(rx.try_recv().is_err());

        queue.repeat();
        assert_eq!(rx.try_recv().unwrap().repeat, RepeatMode::All);
    }

    #[test]
    #[should_panic(expected = "empty queue")]
    fn test_current_track_unchecked_panics_when_empty() {
        TrackQueue::new().current_track_unchecked();
    }

    #[test]
    fn test_end_to_end_navigation() {
        let queue = TrackQueue::with_seed(3);
        queue.set_queue(abc(), Some(2));

        assert!(queue.next());
        assert_eq!(queue.current_track().unwrap().queue_item_id, 3);
        assert!(queue.previous());
        assert_eq!(queue.current_track().unwrap().queue_item_id, 2);

        queue.shuffle();
        queue.shuffle();
        assert_eq!(ids(&queue), vec![1, 2, 3]);
        assert_eq!(queue.current_track().unwrap().queue_item_id, 2);
    }
}
