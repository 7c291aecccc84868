//! TCP and HTTP surfaces on top of a session.
//!
//! The frontend accepts raw TCP connections and tunnels each through its own
//! sub-stream. The client side serves HTTP on a loopback port and forwards
//! every request, with its target rewritten to the virtual host `hive`, over
//! a fresh sub-stream. Either side can hand inbound sub-streams to a real
//! upstream server.

use crate::error::ProxyError;
use crate::session::{Session, Stream};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::http::{HeaderValue, Uri};
use axum::response::Response;
use axum::Router;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub const VIRTUAL_HOST: &str = "hive";

/// Turns `:8081` into `0.0.0.0:8081`; other forms are passed through.
pub fn listen_addr(addr: &str) -> Result<SocketAddr, ProxyError> {
    let full = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    };
    full.parse()
        .map_err(|_| ProxyError::Address(addr.to_string()))
}

/// Tunnels every TCP connection accepted on `listener` through a new
/// sub-stream until the session ends.
pub async fn run_frontend(session: Session, listener: TcpListener) -> Result<(), ProxyError> {
    info!(addr = %listener.local_addr()?, "frontend listening");
    loop {
        let (conn, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = session.closed() => return Ok(()),
        };
        let stream = match session.open().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%peer, %err, "can't open stream");
                return Err(err.into());
            }
        };
        debug!(%peer, stream = stream.id(), "tunneling connection");
        tokio::spawn(pipe(conn, stream));
    }
}

/// Serves inbound sub-streams by connecting each to `upstream`.
pub async fn serve_upstream(session: Session, upstream: String) {
    while let Some(stream) = session.accept().await {
        let upstream = upstream.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&upstream).await {
                Ok(conn) => pipe(conn, stream).await,
                Err(err) => warn!(%upstream, stream = stream.id(), %err, "can't reach upstream"),
            }
        });
    }
    debug!("session gone, upstream forwarding stopped");
}

async fn pipe(mut conn: TcpStream, mut stream: Stream) {
    let id = stream.id();
    match copy_bidirectional(&mut conn, &mut stream).await {
        Ok((sent, received)) => debug!(stream = id, sent, received, "stream done"),
        Err(err) => debug!(stream = id, %err, "stream aborted"),
    }
}

pub fn client_router(session: Session) -> Router {
    Router::new().fallback(forward).with_state(session)
}

/// Serves the HTTP side until the session ends.
pub async fn run_client(session: Session, listener: TcpListener) -> Result<(), ProxyError> {
    info!(addr = %listener.local_addr()?, "client listening");
    let done = session.clone();
    axum::serve(listener, client_router(session))
        .with_graceful_shutdown(async move { done.closed().await })
        .await?;
    Ok(())
}

async fn forward(State(session): State<Session>, mut req: Request) -> Result<Response, ProxyError> {
    let stream = session.open().await?;
    let id = stream.id();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(stream = id, %err, "proxied connection failed");
        }
    });

    let target = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .parse::<Uri>()?;
    debug!(stream = id, method = %req.method(), %target, "forwarding request");
    *req.uri_mut() = target;
    req.headers_mut()
        .insert(HOST, HeaderValue::from_static(VIRTUAL_HOST));

    let resp = sender.send_request(req).await?;
    Ok(resp.map(Body::new))
}
