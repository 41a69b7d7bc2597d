mod buffers;
mod overrides;
mod rate_limit;

pub use buffers::{
    CaptureBuffers, CaptureError, CaptureStats, Captured, IngestOutcome, KindStats,
    MAX_OBSERVE_LIMIT,
};
pub use overrides::{CaptureOverrides, OverrideError, OVERRIDE_KEYS};
pub use rate_limit::{RateLimitError, ScreenshotRateLimiter};
