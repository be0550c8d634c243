//! Typed errors for the runtime.
//!
//! The client API produces exactly one outcome per invocation: a reply
//! (`Ok`/`Queued`/`Dropped` via [`crate::client::InvokeReply`]) or one of
//! the errors below. Composite clients aggregate child outcomes with the
//! precedence `Err > Dropped > Queued > Ok`.

use thiserror::Error;

use crate::header::StatusCode;

/// Errors produced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("operation not supported by this transport kind")]
    Unsupported,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("send timed out")]
    SendTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced by the encryption envelope.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("envelope magic mismatch")]
    BadMagic,
    #[error("ciphertext is not block aligned")]
    BadLength,
    #[error("padding invalid after decrypt")]
    BadPadding,
    #[error("nonce too short: {0} bytes")]
    BadNonce(usize),
    #[error("security association rejected for peer")]
    SaRejected,
    #[error("cipher state not initialised")]
    NotInitialised,
}

/// Errors surfaced by the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection closed (orderly or by reset) during the call. The
    /// socket is closed; the next invoke reconnects.
    #[error("connection closed")]
    Closed,
    /// The method name is not in the service descriptor, locally or at the
    /// server.
    #[error("method not found")]
    MethodNotFound,
    /// Filter table has no entry for the method. A programmer error.
    #[error("no filter entry for method {0}")]
    FilterError(String),
    #[error("reply status {0:?}")]
    BadStatus(StatusCode),
    #[error("reply could not be decoded")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ClientError {
    /// Whether this error should log at debug rather than error level.
    /// Transient connection loss is common in clustered deployments.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Closed)
    }
}
