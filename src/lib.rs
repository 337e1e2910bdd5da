// Library exports for the binary and integration tests

pub mod config;
pub mod models;
pub mod playback;

#[cfg(feature = "media-controls")]
pub mod media_controls;

pub use config::Config;
pub use models::{QueueItemId, Track};
pub use playback::PlaybackSession;

// Test support (unit tests, or integration tests with the test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
