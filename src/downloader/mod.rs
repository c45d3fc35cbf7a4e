pub mod error;
pub mod progress;
pub mod session;
pub mod slice;
pub mod slice_manager;
pub mod target_file;

pub use error::{DownloadError, DownloadResult};
pub use progress::{ProgressCallback, ProgressProbe, SpeedCalculator, SpeedCallback};
pub use session::{DownloadCallbacks, Downloader, ResultCallback, SessionState, VerboseCallback};
pub use slice::{Slice, SliceStatus};
pub use slice_manager::{plan_slices, SliceManager, SliceOutcome, DEFAULT_SLICE_SIZE};
pub use target_file::TargetFile;
