use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Stable identity of one enqueued track instance. Survives reordering.
pub type QueueItemId = u64;

#[derive(Error, Debug)]
pub enum QueueFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid queue file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate queue item id: {0}")]
    DuplicateId(QueueItemId),
}

/// A playable track as handed to us by the catalog client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub queue_item_id: QueueItemId,
    /// Catalog key, reported back in timeline updates
    pub key: String,
    pub title: String,
    pub artist_title: String,
    pub album_title: String,
    pub duration_ms: u64,
    #[serde(rename = "sourceURI")]
    pub source_uri: String,
    #[serde(rename = "artURI", default)]
    pub art_uri: Option<String>,
}

impl Track {
    /// Human readable "Artist - Title" line for logs and media metadata
    pub fn display_name(&self) -> String {
        if self.artist_title.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist_title, self.title)
        }
    }
}

/// Load a queue from a JSON array of tracks
///
/// Queue item ids must be unique within the file.
pub fn load_queue_file(path: &Path) -> Result<Vec<Track>, QueueFileError> {
    let data = std::fs::read_to_string(path)?;
    let tracks: Vec<Track> = serde_json::from_str(&data)?;

    let mut seen = std::collections::HashSet::new();
    for track in &tracks {
        if !seen.insert(track.queue_item_id) {
            return Err(QueueFileError::DuplicateId(track.queue_item_id));
        }
    }

    Ok(tracks)
}
