mod store;

pub use store::{
    SessionStats, SessionStore, FLUSH_INTERVAL, MAX_ENTRY_BYTES, MAX_PROJECT_BYTES,
};
