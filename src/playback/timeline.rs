use crate::config::Config;
use crate::models::{QueueItemId, Track};
use crate::playback::bus::{ItemProgress, StateBus};
use crate::playback::service::{PlaybackState, PlayerSnapshot};
use async_trait::async_trait;
use reqwest::{Client, Error as ReqwestError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] ReqwestError),
    #[error("Server returned status {0}")]
    Status(u16),
    #[error("Server rejected the token")]
    Unauthorized,
}

/// One status push to the catalog server
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineReport {
    pub queue_item_id: QueueItemId,
    pub track_key: String,
    pub state: PlaybackState,
    pub position_ms: u64,
    pub duration_ms: u64,
}

impl TimelineReport {
    fn new(track: &Track, state: PlaybackState, position_ms: u64) -> Self {
        Self {
            queue_item_id: track.queue_item_id,
            track_key: track.key.clone(),
            state,
            position_ms,
            duration_ms: track.duration_ms,
        }
    }

    /// Trailing id of the track key, e.g. `123` for `/library/metadata/123`
    pub fn rating_key(&self) -> &str {
        self.track_key
            .rsplit('/')
            .next()
            .unwrap_or(self.track_key.as_str())
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ratingKey", self.rating_key().to_string()),
            ("key", self.track_key.clone()),
            ("state", self.state.label().to_string()),
            ("time", self.position_ms.to_string()),
            ("duration", self.duration_ms.to_string()),
            ("playQueueItemID", self.queue_item_id.to_string()),
        ]
    }
}

#[async_trait]
pub trait TimelineClient: Send + Sync {
    async fn report(&self, report: &TimelineReport) -> Result<(), ReportError>;
}

/// Reports to `GET {server}/:/timeline`
pub struct HttpTimelineClient {
    client: Client,
    server_url: String,
    token: Option<String>,
    client_id: String,
}

impl HttpTimelineClient {
    pub fn new(
        server_url: String,
        token: Option<String>,
        client_id: String,
        timeout: Duration,
    ) -> Result<Self, ReportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            token,
            client_id,
        })
    }

    /// None when no server is configured
    pub fn from_config(config: &Config) -> Result<Option<Self>, ReportError> {
        let Some(server_url) = config.server_url.clone() else {
            return Ok(None);
        };
        Self::new(
            server_url,
            config.token.clone(),
            config.client_id.clone(),
            config.report_timeout,
        )
        .map(Some)
    }
}

#[async_trait]
impl TimelineClient for HttpTimelineClient {
    async fn report(&self, report: &TimelineReport) -> Result<(), ReportError> {
        let url = format!("{}/:/timeline", self.server_url);

        let mut request = self
            .client
            .get(&url)
            .query(&report.query())
            .header("X-Plex-Client-Identifier", &self.client_id)
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.header("X-Plex-Token", token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else if status == 401 {
            Err(ReportError::Unauthorized)
        } else {
            Err(ReportError::Status(status.as_u16()))
        }
    }
}

/// Pushes throttled status reports for the life of a session
///
/// A report goes out each time playback progress enters a new
/// `interval_ms` bucket of the current queue item, and once whenever the
/// player enters `Paused` or `Stopped`. Failed reports are logged and
/// dropped; they never stop the reporter.
pub struct TimelineReporter {
    task: JoinHandle<()>,
}

impl TimelineReporter {
    pub fn attach(bus: &StateBus, client: Arc<dyn TimelineClient>, interval_ms: u64) -> Self {
        Self::start(
            bus.subscribe_snapshots(),
            bus.subscribe_item_progress(),
            client,
            interval_ms,
        )
    }

    pub fn start(
        snapshots: tokio_mpsc::UnboundedReceiver<PlayerSnapshot>,
        progress: tokio_mpsc::UnboundedReceiver<ItemProgress>,
        client: Arc<dyn TimelineClient>,
        interval_ms: u64,
    ) -> Self {
        let task = tokio::spawn(run(snapshots, progress, client, interval_ms.max(1)));
        Self { task }
    }

    /// Unsubscribe and abort any report still in flight
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for TimelineReporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut snapshots: tokio_mpsc::UnboundedReceiver<PlayerSnapshot>,
    mut progress: tokio_mpsc::UnboundedReceiver<ItemProgress>,
    client: Arc<dyn TimelineClient>,
    interval_ms: u64,
) {
    // Dropped with the task, which aborts everything still in flight
    let mut in_flight = JoinSet::new();
    let mut state = PlaybackState::Idle;
    let mut track: Option<Track> = None;
    let mut last_bucket: Option<(QueueItemId, u64)> = None;

    loop {
        tokio::select! {
            biased;
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else { break };
                let entered = snapshot.state != state;
                state = snapshot.state;
                track = snapshot.track;

                if entered && matches!(state, PlaybackState::Paused | PlaybackState::Stopped) {
                    if let Some(track) = &track {
                        send(&mut in_flight, &client, TimelineReport::new(track, state, snapshot.position_ms));
                    }
                }
            }
            position = progress.recv() => {
                let Some(ItemProgress { queue_item_id, position_ms }) = position else { break };
                if state != PlaybackState::Playing {
                    continue;
                }
                let Some(track) = &track else { continue };
                // A tick measured on the previous item can arrive after the switch
                if queue_item_id != track.queue_item_id {
                    trace!(queue_item_id, position_ms, "Dropping progress for another item");
                    continue;
                }

                let bucket = position_ms / interval_ms;
                let key = (track.queue_item_id, bucket);
                if bucket >= 1 && last_bucket != Some(key) {
                    last_bucket = Some(key);
                    send(&mut in_flight, &client, TimelineReport::new(track, state, position_ms));
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    info!("Timeline reporter stopped");
}

fn send(in_flight: &mut JoinSet<()>, client: &Arc<dyn TimelineClient>, report: TimelineReport) {
    debug!(
        item = report.queue_item_id,
        state = report.state.label(),
        time = report.position_ms,
        "Reporting timeline"
    );

    let client = client.clone();
    in_flight.spawn(async move {
        if let Err(e) = client.report(&report).await {
            warn!(
                item = report.queue_item_id,
                time = report.position_ms,
                "Timeline report failed: {}",
                e
            );
        }
    });
}
