#![allow(dead_code)]

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tonearm::playback::{PlaybackState, PlayerSnapshot};
use tonearm::test_support::sample_track;
use tonearm::Track;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A, B and C: 30s, 40s and 20s long
pub fn abc_queue() -> Vec<Track> {
    vec![
        sample_track(1, 30_000),
        sample_track(2, 40_000),
        sample_track(3, 20_000),
    ]
}

/// Next value from a feed, failing the test after two seconds
pub async fn next_value<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timeout waiting for feed value")
        .expect("Feed closed")
}

/// Skip snapshots until one is in `state`
pub async fn wait_for_state(
    rx: &mut UnboundedReceiver<PlayerSnapshot>,
    state: PlaybackState,
) -> PlayerSnapshot {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(snapshot) if snapshot.state == state => return snapshot,
                Some(_) => continue,
                None => panic!("Snapshot feed closed while waiting for {:?}", state),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timeout waiting for {:?}", state))
}
