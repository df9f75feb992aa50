//! Error types.

use crate::proto::FormatError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket creation or bind failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("no registration reply from {server} within {after:?}")]
    RegisterTimeout { server: SocketAddr, after: Duration },

    #[error("no peer assignment within {0:?}")]
    PeerTimeout(Duration),

    /// The coordinator handed out a peer address we cannot use.
    #[error("invalid peer assignment: {0}")]
    PeerInfo(#[from] FormatError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the failure ends the traversal. Plain I/O errors are transient and
    /// are normally logged and retried where they occur.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
