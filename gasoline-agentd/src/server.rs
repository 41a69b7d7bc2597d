//! Accept loop for the daemon's HTTP surface. Connections are served by
//! hyper directly so slow or idle clients can be cut off.

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

/// Time a client gets to deliver a complete request head.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Keep-alive connections with no traffic for this long are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound on producing a response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(65);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionLimits {
    pub header_read: Duration,
    pub idle: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            header_read: HEADER_READ_TIMEOUT,
            idle: IDLE_TIMEOUT,
        }
    }
}

/// Serves `app` until `shutdown` resolves, then asks every open connection
/// to finish its in-flight request and waits for them.
pub(crate) async fn serve(
    listener: TcpListener,
    app: Router,
    limits: ConnectionLimits,
    shutdown: impl Future<Output = ()> + Send,
) {
    let (stop_tx, _) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    connections.spawn(serve_connection(
                        stream,
                        app.clone(),
                        limits,
                        stop_tx.subscribe(),
                    ));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    stop_tx.send_replace(true);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    app: Router,
    limits: ConnectionLimits,
    mut stop_rx: watch::Receiver<bool>,
) {
    let activity = Arc::new(Activity::new());
    let io = TokioIo::new(Tracked {
        inner: stream,
        activity: Arc::clone(&activity),
    });
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.header_read)
        .keep_alive(true);
    let conn = builder.serve_connection_with_upgrades(io, TowerToHyperService::new(app));
    tokio::pin!(conn);

    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    debug!(%err, "connection closed with error");
                }
                break;
            }
            _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; }, if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = activity.idle_for(limits.idle), if !closing => {
                debug!("closing idle connection");
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock().expect("connection activity poisoned") = Instant::now();
    }

    /// Resolves once nothing has been read or written for `limit`.
    async fn idle_for(&self, limit: Duration) {
        loop {
            let deadline = *self.last.lock().expect("connection activity poisoned") + limit;
            if Instant::now() >= deadline {
                return;
            }
            time::sleep_until(deadline).await;
        }
    }
}

/// Socket wrapper that records the time of the last byte moved.
struct Tracked {
    inner: TcpStream,
    activity: Arc<Activity>,
}

impl AsyncRead for Tracked {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if buf.filled().len() > before {
            self.activity.touch();
        }
        polled
    }
}

impl AsyncWrite for Tracked {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, data);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            self.activity.touch();
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    async fn start(limits: ConnectionLimits) -> (u16, oneshot::Sender<()>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/", get(|| async { "ok" }));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, app, limits, async {
            let _ = stop_rx.await;
        }));
        (port, stop_tx, server)
    }

    #[tokio::test]
    async fn partial_request_line_is_cut_off_after_header_timeout() {
        let (port, stop_tx, server) = start(ConnectionLimits::default()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: 127.0").await.unwrap();

        let started = std::time::Instant::now();
        let mut buf = Vec::new();
        let closed = time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf)).await;
        assert!(closed.is_ok(), "connection still open after 10s");
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(4500), "closed after {waited:?}");
        assert!(!String::from_utf8_lossy(&buf).contains("200 OK"));

        let _ = stop_tx.send(());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn idle_keep_alive_connection_is_closed() {
        let limits = ConnectionLimits {
            header_read: HEADER_READ_TIMEOUT,
            idle: Duration::from_millis(300),
        };
        let (port, stop_tx, server) = start(limits).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .expect("idle connection closed")
            .unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("ok"), "{response}");

        let _ = stop_tx.send(());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_open_connections() {
        let (port, stop_tx, server) = start(ConnectionLimits::default()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .unwrap();
        let mut head = [0u8; 12];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"HTTP/1.1 200");

        let _ = stop_tx.send(());
        time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server drained")
            .unwrap();
    }
}
