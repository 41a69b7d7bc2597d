use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message accepted on stdin; matches the daemon's POST body cap.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

const CONTENT_LENGTH: &str = "content-length:";
/// Header lines stay readable even under a tiny frame limit.
const MIN_LINE_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One JSON document per `\n`-terminated line.
    Line,
    /// LSP-style `Content-Length: N` header block followed by N bytes.
    ContentLength,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::Line => "line",
            Framing::ContentLength => "content_length",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub framing: Framing,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("stdin read failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid Content-Length header: {0:?}")]
    BadHeader(String),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("stream ended inside a Content-Length framed message")]
    Truncated,
}

impl FramingError {
    /// Whether the reader can keep going after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FramingError::BadHeader(_) | FramingError::TooLarge { .. })
    }

    /// Framing the offending message most likely used, for the error reply.
    pub fn framing(&self) -> Framing {
        match self {
            FramingError::BadHeader(_) | FramingError::Truncated => Framing::ContentLength,
            FramingError::TooLarge { .. } | FramingError::Io(_) => Framing::Line,
        }
    }
}

/// Reads messages in either framing, deciding per message.
///
/// A line starting with `Content-Length:` opens a header block; anything else
/// non-blank is a complete line-framed message.
pub struct FrameReader<R> {
    inner: R,
    max_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_limit(inner: R, max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }

    /// Next message, or `None` at end of input.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = trim_ascii(&line);
            if trimmed.is_empty() {
                continue;
            }
            if is_content_length(trimmed) {
                let length = parse_length(trimmed)?;
                return self.read_body(length).await.map(Some);
            }
            if trimmed.len() > self.max_bytes {
                return Err(FramingError::TooLarge {
                    size: trimmed.len(),
                    limit: self.max_bytes,
                });
            }
            return Ok(Some(Frame {
                framing: Framing::Line,
                payload: trimmed.to_vec(),
            }));
        }
    }

    /// Reads one line without buffering more than the frame limit (plus room
    /// for a `\r\n` terminator). An overlong line is drained through its
    /// newline and reported as too large.
    async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<usize, FramingError> {
        let cap = self.max_bytes.max(MIN_LINE_BYTES) as u64 + 2;
        let read = (&mut self.inner).take(cap).read_until(b'\n', line).await?;
        if read as u64 == cap && line.last() != Some(&b'\n') {
            let skipped = self.skip_line().await?;
            return Err(FramingError::TooLarge {
                size: read + skipped,
                limit: self.max_bytes,
            });
        }
        Ok(read)
    }

    async fn skip_line(&mut self) -> io::Result<usize> {
        let mut skipped = 0;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(skipped);
            }
            let (used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            self.inner.consume(used);
            skipped += used;
            if done {
                return Ok(skipped);
            }
        }
    }

    async fn read_body(&mut self, length: usize) -> Result<Frame, FramingError> {
        // remaining headers (Content-Type etc.) up to the blank separator line
        let mut header = Vec::new();
        loop {
            header.clear();
            if self.read_line(&mut header).await? == 0 {
                return Err(FramingError::Truncated);
            }
            if trim_ascii(&header).is_empty() {
                break;
            }
        }
        if length > self.max_bytes {
            // consume the body so the stream stays aligned
            let mut skipped = (&mut self.inner).take(length as u64);
            tokio::io::copy(&mut skipped, &mut tokio::io::sink()).await?;
            return Err(FramingError::TooLarge {
                size: length,
                limit: self.max_bytes,
            });
        }
        let mut payload = vec![0u8; length];
        self.inner.read_exact(&mut payload).await.map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                FramingError::Truncated
            } else {
                FramingError::Io(err)
            }
        })?;
        Ok(Frame {
            framing: Framing::ContentLength,
            payload,
        })
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}

fn is_content_length(line: &[u8]) -> bool {
    line.len() >= CONTENT_LENGTH.len()
        && line[..CONTENT_LENGTH.len()].eq_ignore_ascii_case(CONTENT_LENGTH.as_bytes())
}

fn parse_length(line: &[u8]) -> Result<usize, FramingError> {
    let raw = String::from_utf8_lossy(&line[CONTENT_LENGTH.len()..]);
    raw.trim()
        .parse::<usize>()
        .map_err(|_| FramingError::BadHeader(String::from_utf8_lossy(line).into_owned()))
}

/// Writes one message in `framing` and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    framing: Framing,
    payload: &[u8],
) -> io::Result<()> {
    match framing {
        Framing::Line => {
            writer.write_all(payload).await?;
            writer.write_all(b"\n").await?;
        }
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                payload.len()
            );
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(payload).await?;
        }
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader(input: &'static [u8]) -> FrameReader<BufReader<&'static [u8]>> {
        FrameReader::new(BufReader::new(input))
    }

    #[tokio::test]
    async fn reads_line_framed_messages() {
        let mut frames = reader(b"{\"a\":1}\n\n  {\"b\":2}\r\n");
        let first = frames.next_frame().await.unwrap().unwrap();
        assert_eq!(first.framing, Framing::Line);
        assert_eq!(first.payload, b"{\"a\":1}");
        let second = frames.next_frame().await.unwrap().unwrap();
        assert_eq!(second.payload, b"{\"b\":2}");
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_content_length_messages_back_to_back() {
        let mut frames = reader(
            b"Content-Length: 7\r\nContent-Type: application/json\r\n\r\n{\"a\":1}content-length: 2\r\n\r\n{}",
        );
        let first = frames.next_frame().await.unwrap().unwrap();
        assert_eq!(first.framing, Framing::ContentLength);
        assert_eq!(first.payload, b"{\"a\":1}");
        let second = frames.next_frame().await.unwrap().unwrap();
        assert_eq!(second.framing, Framing::ContentLength);
        assert_eq!(second.payload, b"{}");
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mixed_framings_are_tracked_per_message() {
        let mut frames = reader(b"{\"x\":1}\nContent-Length: 2\r\n\r\n{}{\"y\":2}\n");
        let kinds: Vec<Framing> = {
            let mut kinds = Vec::new();
            while let Some(frame) = frames.next_frame().await.unwrap() {
                kinds.push(frame.framing);
            }
            kinds
        };
        assert_eq!(kinds, [Framing::Line, Framing::ContentLength, Framing::Line]);
    }

    #[tokio::test]
    async fn bad_length_is_recoverable() {
        let mut frames = reader(b"Content-Length: abc\r\n{\"ok\":true}\n");
        let err = frames.next_frame().await.unwrap_err();
        assert!(err.is_recoverable());
        let next = frames.next_frame().await.unwrap().unwrap();
        assert_eq!(next.payload, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn truncated_body_is_reported() {
        let mut frames = reader(b"Content-Length: 50\r\n\r\n{}");
        assert!(matches!(
            frames.next_frame().await,
            Err(FramingError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversize_body_is_skipped() {
        let mut frames = FrameReader::with_limit(
            BufReader::new(b"Content-Length: 10\r\n\r\n0123456789{}\n".as_slice()),
            4,
        );
        assert!(matches!(
            frames.next_frame().await,
            Err(FramingError::TooLarge { size: 10, limit: 4 })
        ));
        assert_eq!(frames.next_frame().await.unwrap().unwrap().payload, b"{}");
    }

    #[tokio::test]
    async fn overlong_line_is_dropped_without_buffering_it() {
        let mut input = vec![b'x'; 1000];
        input.extend_from_slice(b"\nabcd\r\nabcde\n{}\n");
        let mut frames = FrameReader::with_limit(BufReader::with_capacity(64, input.as_slice()), 4);

        let err = frames.next_frame().await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, FramingError::TooLarge { size: 1001, limit: 4 }));
        assert_eq!(frames.next_frame().await.unwrap().unwrap().payload, b"abcd");
        assert!(matches!(
            frames.next_frame().await,
            Err(FramingError::TooLarge { size: 5, limit: 4 })
        ));
        assert_eq!(frames.next_frame().await.unwrap().unwrap().payload, b"{}");
        assert!(frames.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_matching_framing() {
        let mut out = Vec::new();
        write_frame(&mut out, Framing::ContentLength, b"{}").await.unwrap();
        assert_eq!(
            out,
            b"Content-Length: 2\r\nContent-Type: application/json\r\n\r\n{}"
        );
        let mut line = Vec::new();
        write_frame(&mut line, Framing::Line, b"{}").await.unwrap();
        assert_eq!(line, b"{}\n");
    }
}
