use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("multiplexer error: {0}")]
    Connection(#[from] yamux::ConnectionError),
    #[error("session closed: {0}")]
    SessionClosed(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid request target: {0}")]
    Target(#[from] axum::http::uri::InvalidUri),
    #[error("invalid address {0:?}")]
    Address(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
    }
}
