//! Error types, one enum per concern.

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// Configuration could not be loaded or failed validation. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The listener socket could not be set up.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Ends a single connection. Never affects other sessions.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no activity on connection for {0:?}")]
    Timeout(Duration),
}

/// The HL7 payload could not be decoded at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed HL7 message: {0}")]
    MalformedMessage(String),
}

/// Raised by the raw message store or the observation repository.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage operation cancelled")]
    Cancelled,
}

/// Why a single message was answered with an `AE` acknowledgment.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Malformed(#[from] ParseError),

    #[error("failed to persist observations: {0}")]
    Persistence(#[source] StorageError),
}
