mod store;

pub use store::{
    AnnotationError, AnnotationStore, DETAIL_TTL, MAX_DETAILS, MAX_NAMED_SESSIONS, MAX_SESSIONS,
    SESSION_TTL,
};
