pub mod context;
pub mod error_history;
pub mod meta;

pub use context::SessionContext;
pub use error_history::{
    enforce_error_history_cap, evict_stale_errors, ErrorHistoryEntry, MAX_ERROR_HISTORY,
    stale_error_threshold,
};
pub use meta::{ProjectId, SessionMeta};
