pub mod coordinator;
pub mod progress;
pub mod watch;

pub use coordinator::{DownloadCoordinator, DownloadOutcome, DownloadPolicy};
pub use progress::{FileProgress, MediaKind, MediaPhase, MediaTracker, START_THRESHOLD_BYTES};
pub use watch::MediaWatch;
