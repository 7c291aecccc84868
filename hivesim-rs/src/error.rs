use thiserror::Error;

/// Classification of failures surfaced by the simulation library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Contract,
    ClientStartup,
    ProtocolMismatch,
    Timeout,
    Corpus,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request failed (status {status}): {message}")]
    Contract { status: u16, message: String },

    #[error("client startup failed: {0}")]
    ClientStartup(String),

    #[error("{0}")]
    ProtocolMismatch(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid test file {path}: {message}")]
    Corpus { path: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Contract { .. } | Error::Config(_) => ErrorKind::Contract,
            Error::ClientStartup(_) => ErrorKind::ClientStartup,
            Error::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Corpus { .. } => ErrorKind::Corpus,
        }
    }

    /// Only transport failures are worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn corpus(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Corpus {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_decode() {
            Error::Contract {
                status: err.status().map(|s| s.as_u16()).unwrap_or_default(),
                message: format!("invalid response: {err}"),
            }
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Contract {
            status: 0,
            message: format!("invalid JSON: {err}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
