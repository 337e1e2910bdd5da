use crate::config::Config;
use crate::playback::bus::StateBus;
use crate::playback::queue::TrackQueue;
use crate::playback::renderer::Renderer;
use crate::playback::service::{PlaybackCoordinator, PlaybackHandle};
use crate::playback::timeline::{TimelineClient, TimelineReporter};
use std::sync::Arc;
use tracing::info;

/// Everything one playback session owns
///
/// Created at session start, torn down by [`PlaybackSession::shutdown`].
/// Callers hold it (or an `Arc` of it) instead of looking services up.
pub struct PlaybackSession {
    queue: TrackQueue,
    handle: PlaybackHandle,
    bus: StateBus,
    reporter: Option<TimelineReporter>,
}

impl PlaybackSession {
    /// Start a session on `renderer`. Timeline reporting is off when
    /// `timeline_client` is None.
    pub fn start(
        config: &Config,
        renderer: Box<dyn Renderer>,
        timeline_client: Option<Arc<dyn TimelineClient>>,
    ) -> Self {
        Self::start_with_queue(config, TrackQueue::new(), renderer, timeline_client)
    }

    pub fn start_with_queue(
        config: &Config,
        queue: TrackQueue,
        renderer: Box<dyn Renderer>,
        timeline_client: Option<Arc<dyn TimelineClient>>,
    ) -> Self {
        info!(
            renderer = %renderer.kind(),
            reporting = timeline_client.is_some(),
            "Starting playback session"
        );

        let handle = PlaybackCoordinator::start(queue.clone(), renderer);
        let bus = StateBus::new(handle.clone(), config.progress_interval);
        let reporter = timeline_client.map(|client| {
            TimelineReporter::attach(&bus, client, config.report_interval.as_millis() as u64)
        });

        Self {
            queue,
            handle,
            bus,
            reporter,
        }
    }

    pub fn queue(&self) -> &TrackQueue {
        &self.queue
    }

    pub fn handle(&self) -> &PlaybackHandle {
        &self.handle
    }

    pub fn bus(&self) -> &StateBus {
        &self.bus
    }

    pub fn is_reporting(&self) -> bool {
        self.reporter.as_ref().is_some_and(|r| r.is_running())
    }

    /// Stop the coordinator and release its renderer, then cancel the
    /// reporter and the progress ticker
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
        if let Some(reporter) = &self.reporter {
            reporter.stop();
        }
        self.bus.close();
        info!("Playback session ended");
    }
}
