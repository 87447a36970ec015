//! Error taxonomy for the streaming client core.
//!
//! Mirrors the kinds enumerated in the design's error-handling section:
//! connect, communication, timeout, protocol, overflow, caller misuse and
//! fatal reactor errors. Kept as flat enums (rather than the exception
//! hierarchy the original C++ used) since that's the idiomatic shape for
//! fallible Rust APIs.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Errors surfaced by a single `StreamClient`.
#[derive(Debug)]
pub enum ClientError {
    /// Dial, TLS handshake, or post-connect `start()` failed.
    Connect(io::Error),
    /// A socket read or write reported a system error.
    Communication(io::Error),
    /// A synchronous read or write blocked past the socket timeout.
    Timeout(String),
    /// The decoder raised a protocol-error signal.
    Protocol {
        message: String,
        offset: usize,
        expected: u8,
    },
    /// Growing a buffer would exceed `max_buffer_bytes`.
    Overflow { attempted: usize, ceiling: usize },
    /// A synchronous API was misused (e.g. `send` before `start`).
    CallerError(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ClientError::Connect(ref e) => write!(f, "failed to connect: {}", e),
            ClientError::Communication(ref e) => write!(f, "communication error: {}", e),
            ClientError::Timeout(ref what) => write!(f, "timeout: {}", what),
            ClientError::Protocol {
                ref message,
                offset,
                expected,
            } => write!(
                f,
                "protocol error: {} (offset {}, expected byte 0x{:02x})",
                message, offset, expected
            ),
            ClientError::Overflow {
                attempted,
                ceiling,
            } => write!(
                f,
                "the maximum buffer size is exceeded ({} > {} bytes)",
                attempted, ceiling
            ),
            ClientError::CallerError(ref what) => write!(f, "caller error: {}", what),
        }
    }
}

impl StdError for ClientError {
    fn description(&self) -> &str {
        "stream client error"
    }

    fn cause(&self) -> Option<&dyn StdError> {
        match *self {
            ClientError::Connect(ref e) | ClientError::Communication(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> ClientError {
        ClientError::Communication(e)
    }
}

/// Errors surfaced by a `StreamClientService`.
#[derive(Debug)]
pub enum ServiceError {
    /// `connect()` failed; the service remains in `Idle`.
    Connect(String),
    /// `invoke_client` was called with no live client installed.
    NoActiveConnection,
    /// The reactor exited because a handler propagated an error.
    Fatal(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ServiceError::Connect(ref why) => write!(f, "failed to connect to server: {}", why),
            ServiceError::NoActiveConnection => write!(f, "has no active connection"),
            ServiceError::Fatal(ref why) => write!(f, "fatal error: {}", why),
        }
    }
}

impl StdError for ServiceError {
    fn description(&self) -> &str {
        "stream client service error"
    }
}

impl From<ClientError> for ServiceError {
    fn from(e: ClientError) -> ServiceError {
        ServiceError::Connect(e.to_string())
    }
}
