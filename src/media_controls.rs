use crate::models::Track;
use crate::playback::{PlaybackHandle, PlaybackState, PlayerSnapshot, StateBus};
use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig,
    SeekDirection,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, trace};

/// Wire system media keys to the session
///
/// Key presses become playback commands; state, metadata and position
/// follow the bus. Returns the MediaControls handle, which must be kept
/// alive for as long as the session runs.
pub fn setup_media_controls(
    bus: &StateBus,
    runtime_handle: tokio::runtime::Handle,
) -> Result<Arc<Mutex<MediaControls>>, souvlaki::Error> {
    let config = PlatformConfig {
        dbus_name: "tonearm",
        display_name: "tonearm",
        hwnd: None,
    };

    let mut controls = MediaControls::new(config)?;

    let position_ms = Arc::new(AtomicU64::new(0));
    let playback = bus.handle().clone();
    let position_for_keys = position_ms.clone();

    controls.attach(move |event: MediaControlEvent| {
        handle_event(&playback, &position_for_keys, event);
    })?;

    let controls_shared = Arc::new(Mutex::new(controls));

    {
        let controls_shared = controls_shared.clone();
        let mut snapshots = bus.subscribe_snapshots();
        let mut progress = bus.subscribe_progress();

        runtime_handle.spawn(async move {
            let mut state = PlaybackState::Idle;
            let mut current: Option<Track> = None;

            loop {
                tokio::select! {
                    snapshot = snapshots.recv() => {
                        let Some(snapshot) = snapshot else { break };
                        state = snapshot.state;
                        position_ms.store(snapshot.position_ms, Ordering::SeqCst);

                        if snapshot.track != current {
                            update_metadata(&controls_shared, &snapshot);
                            current = snapshot.track.clone();
                        }
                        set_playback(&controls_shared, state, snapshot.position_ms);
                    }
                    position = progress.recv() => {
                        let Some(position) = position else { break };
                        position_ms.store(position, Ordering::SeqCst);
                        set_playback(&controls_shared, state, position);
                    }
                }
            }

            info!("Media controls detached");
        });
    }

    info!("Media controls initialized");
    Ok(controls_shared)
}

fn handle_event(playback: &PlaybackHandle, position_ms: &AtomicU64, event: MediaControlEvent) {
    match event {
        MediaControlEvent::Toggle => {
            info!("Media key event received: Toggle");
            playback.toggle_play_pause();
        }
        MediaControlEvent::Play => {
            info!("Media control event received: Play");
            playback.play();
        }
        MediaControlEvent::Pause => {
            info!("Media control event received: Pause");
            playback.pause();
        }
        MediaControlEvent::Next => {
            info!("Media key event received: Next");
            playback.skip_next();
        }
        MediaControlEvent::Previous => {
            info!("Media key event received: Previous");
            playback.skip_previous();
        }
        MediaControlEvent::Stop => {
            info!("Media key event received: Stop");
            playback.stop();
        }
        MediaControlEvent::SetPosition(MediaPosition(position)) => {
            info!("Media control: SetPosition requested: {:?}", position);
            playback.seek_to(position.as_millis() as u64);
        }
        MediaControlEvent::SeekBy(direction, by) => {
            let current = position_ms.load(Ordering::SeqCst);
            let by = by.as_millis() as u64;
            let target = match direction {
                SeekDirection::Forward => current + by,
                SeekDirection::Backward => current.saturating_sub(by),
            };
            info!("Media control: Seek by {:?} to {}ms", direction, target);
            playback.seek_to(target);
        }
        _ => {
            info!("Media key event received: {:?}", event);
        }
    }
}

fn set_playback(controls: &Arc<Mutex<MediaControls>>, state: PlaybackState, position_ms: u64) {
    let progress = Some(MediaPosition(Duration::from_millis(position_ms)));
    let playback = match state {
        PlaybackState::Playing | PlaybackState::Buffering => MediaPlayback::Playing { progress },
        PlaybackState::Paused => MediaPlayback::Paused { progress },
        PlaybackState::Idle | PlaybackState::Stopped | PlaybackState::Error => {
            MediaPlayback::Stopped
        }
    };

    let mut controls = controls.lock().unwrap();
    if let Err(e) = controls.set_playback(playback) {
        error!("Failed to set playback state: {:?}", e);
    } else {
        trace!("Media controls: state {:?} at {}ms", state, position_ms);
    }
}

fn update_metadata(controls: &Arc<Mutex<MediaControls>>, snapshot: &PlayerSnapshot) {
    let mut controls = controls.lock().unwrap();

    let result = match &snapshot.track {
        Some(track) => controls.set_metadata(MediaMetadata {
            title: Some(track.title.as_str()),
            artist: Some(track.artist_title.as_str()).filter(|a| !a.is_empty()),
            album: Some(track.album_title.as_str()).filter(|a| !a.is_empty()),
            cover_url: track.art_uri.as_deref(),
            duration: Some(Duration::from_millis(track.duration_ms)),
        }),
        None => controls.set_metadata(MediaMetadata::default()),
    };

    if let Err(e) = result {
        error!("Failed to set media metadata: {:?}", e);
    }
}
