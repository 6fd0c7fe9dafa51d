//! # Error Taxonomy
//!
//! Every failure the synchronization core can hit is a [`SyncError`]. The
//! variant decides how far the failure is allowed to travel, which
//! [`SyncError::kind`] reports as an [`ErrorKind`]:
//!
//! - [`ErrorKind::RetryItem`] - the current file or directory is recorded as a
//!   failed item and the run continues.
//! - [`ErrorKind::AbortConnection`] - the shared connection can no longer be
//!   trusted; the handler (host) ends, the client drops the connection.
//!
//! A timed-out reply may still arrive later, so a timeout is connection-level:
//! nothing more may be sent on that connection.
//! - [`ErrorKind::AbortProcess`] - startup cannot continue.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::protocol::{Command, DecodeError};

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RetryItem,
    AbortConnection,
    AbortProcess,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// A frame could not be decoded. The stream is out of sync.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A single read exceeded the channel's read timeout. The late reply may
    /// still be in flight.
    #[error("timed out waiting for peer")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Credentials were rejected. Deliberately carries no detail.
    #[error("authentication rejected")]
    AuthenticationFailed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The peer answered `FAILED` to a request.
    #[error("remote refused {command:?} for '{path}'")]
    Refused { command: Command, path: String },

    #[error("unexpected response {got:?} to {request:?}")]
    UnexpectedResponse { request: Command, got: Command },

    #[error("could not connect to {addr} after {attempts} attempts")]
    ConnectFailed { addr: String, attempts: u32 },

    #[error("backup target '{0}' is not ready")]
    NotReady(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn fs(path: &Path, source: io::Error) -> Self {
        SyncError::Filesystem {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Filesystem { .. } | SyncError::Refused { .. } => ErrorKind::RetryItem,
            SyncError::Io(e) if is_connection_loss(e) => ErrorKind::AbortConnection,
            SyncError::Io(_) => ErrorKind::RetryItem,
            SyncError::Decode(_)
            | SyncError::Timeout
            | SyncError::ConnectionClosed
            | SyncError::AuthenticationFailed
            | SyncError::Handshake(_)
            | SyncError::Crypto(_)
            | SyncError::UnexpectedResponse { .. }
            | SyncError::ConnectFailed { .. }
            | SyncError::NotReady(_) => ErrorKind::AbortConnection,
            SyncError::Config(_) => ErrorKind::AbortProcess,
        }
    }

    pub fn is_retryable_item(&self) -> bool {
        self.kind() == ErrorKind::RetryItem
    }

    /// The stream is dead or out of step with the peer. A fresh connection
    /// may still succeed, unlike after a rejected login.
    pub fn breaks_connection(&self) -> bool {
        match self {
            SyncError::Decode(_)
            | SyncError::Timeout
            | SyncError::ConnectionClosed
            | SyncError::Crypto(_)
            | SyncError::UnexpectedResponse { .. } => true,
            SyncError::Io(e) => is_connection_loss(e),
            _ => false,
        }
    }
}

pub(crate) fn is_connection_loss(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

pub type SyncResult<T> = Result<T, SyncError>;
