use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use tonearm::models::{load_queue_file, QueueItemId};
use tonearm::playback::renderer::{TestRenderer, VirtualClock};
use tonearm::playback::{
    HttpTimelineClient, PlaybackSession, PlaybackState, RepeatMode, TimelineClient,
};
use tonearm::Config;

/// How often the simulated renderer's clock catches up with wall time
const CLOCK_STEP: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() {
    // Use RUST_LOG env var if set, otherwise default to info for our own logs
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "tonearm=info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let args: Vec<String> = env::args().collect();

    let mut queue_path: Option<PathBuf> = None;
    let mut start_id: Option<QueueItemId> = None;
    let mut shuffle = false;
    let mut repeat = RepeatMode::Off;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--start" => {
                let Some(id) = args.get(i + 1).and_then(|v| v.parse::<QueueItemId>().ok()) else {
                    error!("--start requires a queue item id");
                    print_usage(&args[0]);
                    std::process::exit(1);
                };
                start_id = Some(id);
                i += 2;
            }
            "--shuffle" => {
                shuffle = true;
                i += 1;
            }
            "--repeat" => {
                repeat = match args.get(i + 1).map(String::as_str) {
                    Some("off") => RepeatMode::Off,
                    Some("all") => RepeatMode::All,
                    Some("one") => RepeatMode::One,
                    _ => {
                        error!("--repeat requires one of off, all, one");
                        print_usage(&args[0]);
                        std::process::exit(1);
                    }
                };
                i += 2;
            }
            arg if arg.starts_with("--") => {
                error!("Unknown argument: {}", arg);
                print_usage(&args[0]);
                std::process::exit(1);
            }
            path => {
                queue_path = Some(PathBuf::from(path));
                i += 1;
            }
        }
    }

    let Some(queue_path) = queue_path else {
        error!("No queue file specified");
        print_usage(&args[0]);
        std::process::exit(1);
    };

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let tracks = match load_queue_file(&queue_path) {
        Ok(tracks) if tracks.is_empty() => {
            error!("Queue file {} has no tracks", queue_path.display());
            std::process::exit(1);
        }
        Ok(tracks) => tracks,
        Err(e) => {
            error!("Failed to load {}: {}", queue_path.display(), e);
            std::process::exit(1);
        }
    };

    let timeline_client: Option<Arc<dyn TimelineClient>> =
        match HttpTimelineClient::from_config(&config) {
            Ok(client) => client.map(|c| Arc::new(c) as Arc<dyn TimelineClient>),
            Err(e) => {
                error!("Failed to create timeline client: {}", e);
                std::process::exit(1);
            }
        };

    let clock = VirtualClock::new();
    let session = PlaybackSession::start(
        &config,
        Box::new(TestRenderer::new(&clock)),
        timeline_client,
    );

    #[cfg(feature = "media-controls")]
    let _media_controls = match tonearm::media_controls::setup_media_controls(
        session.bus(),
        tokio::runtime::Handle::current(),
    ) {
        Ok(controls) => Some(controls),
        Err(e) => {
            warn!("Media controls unavailable: {:?}", e);
            None
        }
    };

    let queue = session.queue();
    queue.set_queue(tracks, start_id);
    if shuffle {
        queue.shuffle();
    }
    while queue.mode().repeat != repeat {
        queue.repeat();
    }
    info!(
        tracks = queue.len(),
        shuffle,
        repeat = %repeat,
        "Queue loaded from {}",
        queue_path.display()
    );

    let driver = tokio::spawn(drive_clock(clock));
    let mut state = session.bus().subscribe_state();
    session.handle().play();

    let mut started = false;
    loop {
        tokio::select! {
            next = state.recv() => match next {
                Some(PlaybackState::Playing) => started = true,
                Some(PlaybackState::Stopped) if started => {
                    info!("Queue finished");
                    break;
                }
                Some(PlaybackState::Error) => {
                    warn!("Playback failed");
                    break;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    driver.abort();
    session.shutdown().await;
}

/// Advance the renderer clock in step with real time
async fn drive_clock(clock: VirtualClock) {
    let started = Instant::now();
    let mut advanced = 0u64;
    let mut interval = tokio::time::interval(CLOCK_STEP);

    loop {
        interval.tick().await;
        let elapsed = started.elapsed().as_millis() as u64;
        clock.advance(elapsed - advanced);
        advanced = elapsed;
    }
}

fn print_usage(program_name: &str) {
    eprintln!("Usage:");
    eprintln!(
        "  {} <queue.json> [--start <id>] [--shuffle] [--repeat off|all|one]",
        program_name
    );
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TONEARM_SERVER_URL, TONEARM_TOKEN, TONEARM_CLIENT_ID enable timeline reporting");
    eprintln!("  TONEARM_PROGRESS_INTERVAL_MS, TONEARM_REPORT_INTERVAL_MS, TONEARM_REPORT_TIMEOUT_MS");
    eprintln!("  TONEARM_DUCK_VOLUME applies to local audio renderers only, not this simulated player");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} queue.json", program_name);
    eprintln!("  {} queue.json --start 3 --repeat all", program_name);
}
