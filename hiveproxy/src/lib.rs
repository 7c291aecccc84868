//! Carries the hive host API over a pair of byte streams.
//!
//! A [`Session`] multiplexes independent sub-streams over one reader and one
//! writer (usually stdin and stdout of a container) using yamux. The
//! [`proxy`] module puts TCP and HTTP surfaces on either end of a session.
#![warn(clippy::unwrap_used)]

mod error;
pub mod proxy;
mod session;

pub use error::{MuxError, ProxyError};
pub use session::{Role, Session, Stream};
