pub mod cursor;
pub mod entries;
pub mod ring;

pub use entries::{
    CaptureFilter, CaptureKind, CaptureRecord, EnhancedAction, LogEntry, LogLevel, NetworkBody,
    PerformanceSnapshot, WaterfallEntry, WebSocketEvent,
};
pub use cursor::{paginate, Cursor, CursorError, Page, PageMeta, PageRequest};
pub use ring::RingBuffer;
