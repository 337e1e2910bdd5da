pub mod bus;
pub mod feed;
pub mod queue;
pub mod renderer;
pub mod service;
pub mod session;
pub mod timeline;

pub use bus::{ItemProgress, StateBus};
pub use feed::Feed;
pub use queue::{QueueMode, QueueSnapshot, RepeatMode, ShuffleMode, TrackQueue};
pub use renderer::{Renderer, RendererEvent, RendererKind, RendererListener, RendererSnapshot};
pub use service::{
    PlaybackAnnouncement, PlaybackCoordinator, PlaybackError, PlaybackHandle, PlaybackState,
    PlayerSnapshot,
};
pub use session::PlaybackSession;
pub use timeline::{
    HttpTimelineClient, ReportError, TimelineClient, TimelineReport, TimelineReporter,
};
