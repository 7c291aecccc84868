//! Multiplexed session: many byte streams over one reader and one writer.
//!
//! The wire protocol is yamux. A driver task owns the connection and keeps
//! polling it, so frames for idle streams and keepalive traffic are handled
//! even when nobody is reading. Flow control is per stream: a stalled stream
//! only exhausts its own window and never holds up the others.

use crate::error::MuxError;
use futures::future::poll_fn;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yamux::{Config, Connection, ConnectionError, Mode};

/// The client side initiates the session and numbers its streams odd, the
/// server side numbers them even.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn mode(self) -> Mode {
        match self {
            Role::Client => Mode::Client,
            Role::Server => Mode::Server,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Joins the two halves of the container's stdio into one duplex socket.
struct Stdio<R, W> {
    reader: R,
    writer: W,
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for Stdio<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for Stdio<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

enum Command {
    Open(oneshot::Sender<Result<Stream, MuxError>>),
    Close(oneshot::Sender<()>),
}

enum Event {
    Outbound(Result<yamux::Stream, ConnectionError>),
    Inbound(Option<Result<yamux::Stream, ConnectionError>>),
    Close,
}

/// What the driver reports back once the connection is gone.
#[derive(Default)]
struct Outcome {
    reason: Mutex<Option<String>>,
    done: CancellationToken,
}

struct Shared {
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    outcome: Arc<Outcome>,
}

impl Shared {
    fn closed_error(&self) -> MuxError {
        let reason = lock(&self.outcome.reason)
            .clone()
            .unwrap_or_else(|| "session closed".to_string());
        MuxError::SessionClosed(reason)
    }
}

/// Owns the connection until it ends. Open requests queue up until yamux
/// hands out a stream for them.
async fn drive<T>(
    mut conn: Connection<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::UnboundedSender<Stream>,
    role: Role,
    outcome: Arc<Outcome>,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    let mut opening: VecDeque<oneshot::Sender<Result<Stream, MuxError>>> = VecDeque::new();
    let mut closing: Vec<oneshot::Sender<()>> = Vec::new();

    let reason = loop {
        let event = poll_fn(|cx| {
            while let Poll::Ready(command) = commands.poll_recv(cx) {
                match command {
                    Some(Command::Open(reply)) => opening.push_back(reply),
                    Some(Command::Close(reply)) => {
                        closing.push(reply);
                        return Poll::Ready(Event::Close);
                    }
                    // every handle is gone
                    None => return Poll::Ready(Event::Close),
                }
            }
            if !opening.is_empty() {
                if let Poll::Ready(result) = conn.poll_new_outbound(cx) {
                    return Poll::Ready(Event::Outbound(result));
                }
            }
            conn.poll_next_inbound(cx).map(Event::Inbound)
        })
        .await;

        match event {
            Event::Outbound(result) => {
                let result = result.map(Stream::new).map_err(MuxError::from);
                if let Ok(stream) = &result {
                    debug!(stream = stream.id(), "outbound stream");
                }
                if let Some(reply) = opening.pop_front() {
                    let _ = reply.send(result);
                }
            }
            Event::Inbound(Some(Ok(stream))) => {
                let stream = Stream::new(stream);
                debug!(stream = stream.id(), "inbound stream");
                // nobody accepting is fine, the stream is reset on drop
                let _ = incoming.send(stream);
            }
            Event::Inbound(Some(Err(err))) => {
                warn!(%err, "session failed");
                break err.to_string();
            }
            Event::Inbound(None) => break "peer went away".to_string(),
            Event::Close => {
                break match poll_fn(|cx| conn.poll_close(cx)).await {
                    Ok(()) => "session closed".to_string(),
                    Err(err) => format!("session closed uncleanly: {err}"),
                };
            }
        }
    };

    debug!(?role, %reason, "session ended");
    lock(&outcome.reason).get_or_insert(reason);
    outcome.done.cancel();
    drop(conn);
    // pending opens see the closed session through their dropped reply
    drop(opening);
    for reply in closing {
        let _ = reply.send(());
    }
}

/// Handle to a running session. Clones share the session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Starts the session driver on the given byte streams.
    pub fn new<R, W>(role: Role, reader: R, writer: W) -> Session
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let outcome = Arc::new(Outcome::default());
        let socket = TokioAsyncReadCompatExt::compat(Stdio { reader, writer });
        let conn = Connection::new(socket, Config::default(), role.mode());
        tokio::spawn(drive(conn, commands_rx, incoming_tx, role, outcome.clone()));
        Session {
            shared: Arc::new(Shared {
                role,
                commands,
                incoming: tokio::sync::Mutex::new(incoming_rx),
                outcome,
            }),
        }
    }

    /// The side that opens the session, usually the simulation container.
    pub fn client<R, W>(reader: R, writer: W) -> Session
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Session::new(Role::Client, reader, writer)
    }

    pub fn server<R, W>(reader: R, writer: W) -> Session
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Session::new(Role::Server, reader, writer)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Opens a new outbound stream. The peer learns about it with the first
    /// bytes written, no round trip is needed before writing.
    pub async fn open(&self) -> Result<Stream, MuxError> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Open(reply))
            .map_err(|_| self.shared.closed_error())?;
        rx.await.map_err(|_| self.shared.closed_error())?
    }

    /// Waits for the next stream opened by the peer. Returns `None` once the
    /// session is gone.
    pub async fn accept(&self) -> Option<Stream> {
        self.shared.incoming.lock().await.recv().await
    }

    /// Tells the peer we are going away and stops the session.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.shared.commands.send(Command::Close(reply)).is_ok() {
            let _ = rx.await;
        }
        self.shared.outcome.done.cancelled().await;
    }

    /// Resolves once the session is torn down, by either side.
    pub async fn closed(&self) {
        self.shared.outcome.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.outcome.done.is_cancelled()
    }

    /// Why the session ended, if it did.
    pub fn close_reason(&self) -> Option<String> {
        lock(&self.shared.outcome.reason).clone()
    }
}

/// One sub-stream of a session. Shutting it down sends FIN; dropping it
/// before that resets the stream, which fails the peer's pending writes.
pub struct Stream {
    id: u32,
    inner: Compat<yamux::Stream>,
}

impl Stream {
    fn new(stream: yamux::Stream) -> Self {
        Self {
            id: stream.id().val(),
            inner: FuturesAsyncReadCompatExt::compat(stream),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
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
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Receive window of a fresh yamux stream.
    const WINDOW: usize = 256 * 1024;

    fn pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let server = Session::server(br, bw);
        let client = Session::client(ar, aw);
        (client, server)
    }

    /// Encodes one yamux frame: version 0, then kind, flags, stream id and
    /// length, all big-endian.
    fn frame(kind: u8, flags: u16, stream: u32, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0, kind];
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&stream.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn request_response() {
        let (client, server) = pair();

        let mut out = client.open().await.unwrap();
        assert_eq!(out.id(), 1);
        out.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        assert_eq!(inbound.id(), 1);
        let mut request = String::new();
        inbound.read_to_string(&mut request).await.unwrap();
        assert_eq!(request, "GET / HTTP/1.1\r\n\r\n");
        inbound.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        inbound.shutdown().await.unwrap();

        let mut response = String::new();
        out.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "HTTP/1.1 200 OK\r\n\r\n");
    }

    #[tokio::test]
    async fn both_sides_open_streams() {
        let (client, server) = pair();

        let mut a = client.open().await.unwrap();
        let mut b = client.open().await.unwrap();
        let mut c = server.open().await.unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (1, 3, 2));
        for stream in [&mut a, &mut b, &mut c] {
            stream.write_all(b"hi").await.unwrap();
        }

        assert_eq!(client.accept().await.unwrap().id(), 2);
        assert_eq!(server.accept().await.unwrap().id(), 1);
        assert_eq!(server.accept().await.unwrap().id(), 3);
        assert_eq!(client.role(), Role::Client);
    }

    #[tokio::test]
    async fn transfer_larger_than_window() {
        let (client, server) = pair();
        let payload: Vec<u8> = (0..(1024 * 1024)).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let mut out = client.open().await.unwrap();
        let writer = tokio::spawn(async move {
            out.write_all(&payload).await.unwrap();
            out.shutdown().await.unwrap();
            out
        });

        let mut inbound = server.accept().await.unwrap();
        let mut received = vec![];
        inbound.read_to_end(&mut received).await.unwrap();
        let _out = writer.await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert!(received == expected);
    }

    #[tokio::test]
    async fn stalled_stream_does_not_block_others() {
        let (client, server) = pair();

        let mut stalled = client.open().await.unwrap();
        let blocked = tokio::spawn(async move {
            let result = stalled.write_all(&vec![7u8; 2 * WINDOW]).await;
            (stalled, result)
        });
        let _unread = server.accept().await.unwrap();

        let mut other = client.open().await.unwrap();
        other.write_all(b"ping").await.unwrap();
        other.shutdown().await.unwrap();
        let mut inbound = server.accept().await.unwrap();

        let exchange = async {
            let mut buf = String::new();
            inbound.read_to_string(&mut buf).await.unwrap();
            inbound.write_all(b"pong").await.unwrap();
            inbound.shutdown().await.unwrap();
            let mut reply = String::new();
            other.read_to_string(&mut reply).await.unwrap();
            (buf, reply)
        };
        let (request, reply) = tokio::time::timeout(Duration::from_secs(5), exchange)
            .await
            .unwrap();
        assert_eq!(request, "ping");
        assert_eq!(reply, "pong");
        assert!(!blocked.is_finished());
    }

    #[tokio::test]
    async fn dropped_reader_fails_blocked_writer() {
        let (client, server) = pair();

        let mut out = client.open().await.unwrap();
        let writer = tokio::spawn(async move {
            let result = out.write_all(&vec![1u8; 4 * WINDOW]).await;
            (out, result)
        });

        let mut inbound = server.accept().await.unwrap();
        let mut head = vec![0u8; 1024];
        inbound.read_exact(&mut head).await.unwrap();
        // the rest stays unread
        drop(inbound);

        let (_out, result) = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer still blocked after the reader went away")
            .unwrap();
        assert!(result.is_err());

        // the session itself carries on
        let mut next = client.open().await.unwrap();
        next.write_all(b"still here").await.unwrap();
        next.shutdown().await.unwrap();
        let mut inbound = server.accept().await.unwrap();
        let mut text = String::new();
        inbound.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "still here");
        assert!(!client.is_closed() && !server.is_closed());
    }

    #[tokio::test]
    async fn go_away_closes_peer() {
        let (client, server) = pair();
        let mut stream = server.open().await.unwrap();
        stream.write_all(b"before").await.unwrap();
        let mut inbound = client.accept().await.unwrap();
        let mut buf = [0u8; 6];
        inbound.read_exact(&mut buf).await.unwrap();

        client.close().await;
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(server.close_reason().is_some());
        assert!(client.is_closed());
        assert!(matches!(server.open().await, Err(MuxError::SessionClosed(_))));
        assert!(matches!(client.open().await, Err(MuxError::SessionClosed(_))));
        assert!(server.accept().await.is_none());
    }

    #[tokio::test]
    async fn idle_session_stays_up() {
        let (client, server) = pair();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.is_closed() && !server.is_closed());

        let mut out = server.open().await.unwrap();
        out.write_all(b"late").await.unwrap();
        out.shutdown().await.unwrap();
        let mut inbound = client.accept().await.unwrap();
        let mut text = String::new();
        inbound.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "late");
    }

    #[tokio::test]
    async fn peer_death_keeps_received_data() {
        let (raw, ours) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        let server = Session::server(reader, writer);

        let (raw_reader, mut raw_writer) = tokio::io::split(raw);
        raw_writer.write_all(&frame(0, 0x1, 1, b"partial response")).await.unwrap();
        let mut stream = server.accept().await.unwrap();
        assert_eq!(stream.id(), 1);

        // no FIN: the peer just disappears
        drop(raw_writer);
        drop(raw_reader);
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"partial response");
        let rest = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(rest, Ok(0) | Err(_)));

        assert!(server.open().await.is_err());
        assert!(server.accept().await.is_none());
    }
}
