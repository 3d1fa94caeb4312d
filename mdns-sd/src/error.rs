use thiserror::Error;

/// Errors surfaced by the mDNS engine.
///
/// Parse-time errors (`MalformedName`/`MalformedRecord`/`MalformedMessage`)
/// never reach a public API caller — the reactor logs them at `debug!` and
/// drops the offending datagram. Everything else is raised
/// directly from the call that triggered it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed name at offset {offset}: {reason}")]
    MalformedName { offset: usize, reason: &'static str },

    #[error("malformed record {rtype:?} for {name:?}: {reason}")]
    MalformedRecord {
        name: String,
        rtype: u16,
        reason: &'static str,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error("service name too long: {0:?}")]
    ServiceNameTooLong(String),

    #[error("invalid type in name: {0:?}")]
    BadTypeInName(String),

    #[error("non-unique name: {0:?} is already in use on the network")]
    NonUniqueName(String),

    #[error("network error: {0}")]
    NetworkError(#[from] std::io::Error),

    #[error("engine is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
