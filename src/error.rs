//! Failure taxonomy shared by the session, render bridge and coordinator.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Backend process spawn or coordinator listener bind failure. Fatal,
    /// aborts the session.
    #[error("startup failed: {0}")]
    Startup(#[source] io::Error),

    /// The backend reported a version below the minimum we can drive.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed or unexpected reply from the backend. The operation is
    /// treated as failed, the session continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read/write failure on an established connection. Drops only the
    /// affected connection, never the process.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Identity mismatch or malformed message from a peer. The connection
    /// is dropped without a reply.
    #[error("validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
