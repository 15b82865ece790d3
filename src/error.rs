//! Crate-wide error type and result alias.

use serde_derive::{Deserialize, Serialize};

/// A quorum error. Errors are divided into the result taxonomy surfaced to
/// clients (not leader, retry, timeout, and the configuration-change results)
/// and local failures (IO, invalid data). All variants are serializable so
/// they can be returned across the client wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The precondition configuration id of a membership change did not match
    /// the current stable configuration.
    ConfigurationChanged(String),
    /// A membership change was aborted because the listed servers could not
    /// catch up to the leader's log.
    ConfigurationBad(Vec<u64>),
    /// Invalid or corrupt data, typically in storage.
    InvalidData(String),
    /// A malformed or inapplicable request, rejected at dispatch.
    InvalidRequest(String),
    /// An IO error.
    IO(String),
    /// The recipient is not the leader. Carries a non-authoritative hint of
    /// the current leader's id, when known, to help the caller reconnect.
    NotLeader(Option<u64>),
    /// A transient condition, e.g. no quorum or a step-down in progress. The
    /// caller should retry shortly.
    Retry,
    /// The server has shut down.
    Shutdown,
    /// A deadline elapsed while waiting for an operation to complete.
    Timeout,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ConfigurationChanged(msg) => write!(f, "configuration changed: {msg}"),
            Error::ConfigurationBad(ids) => write!(f, "servers unable to catch up: {ids:?}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLeader(Some(id)) => write!(f, "not leader, try server {id}"),
            Error::NotLeader(None) => write!(f, "not leader"),
            Error::Retry => write!(f, "retry"),
            Error::Shutdown => write!(f, "server has shut down"),
            Error::Timeout => write!(f, "timed out"),
        }
    }
}

/// Constructs an Err(Error::InvalidData) via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*)).into()) };
}

/// Constructs an Err(Error::InvalidRequest) via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidRequest(format!($($args)*)).into()) };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidRequest(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidRequest(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::IO(err.to_string())
    }
}

// Channel errors imply the receiving half is gone, which only happens when the
// server is shutting down.
impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Shutdown
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::Shutdown
    }
}

impl From<crossbeam::channel::RecvTimeoutError> for Error {
    fn from(err: crossbeam::channel::RecvTimeoutError) -> Self {
        match err {
            crossbeam::channel::RecvTimeoutError::Timeout => Error::Timeout,
            crossbeam::channel::RecvTimeoutError::Disconnected => Error::Shutdown,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

/// A quorum result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() -> Result<()> {
        // Errors travel in client responses, so they must encode and decode.
        for error in [
            Error::ConfigurationChanged("id 3 is stale".to_string()),
            Error::ConfigurationBad(vec![2, 5]),
            Error::NotLeader(Some(7)),
            Error::NotLeader(None),
            Error::Retry,
            Error::Shutdown,
            Error::Timeout,
        ] {
            let bytes = bincode::serialize(&error)?;
            assert_eq!(bincode::deserialize::<Error>(&bytes)?, error);
        }
        Ok(())
    }
}
