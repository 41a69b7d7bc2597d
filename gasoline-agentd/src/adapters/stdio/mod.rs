mod framing;

pub use framing::{write_frame, Frame, FrameReader, Framing, FramingError, MAX_FRAME_BYTES};
