use serde::{Deserialize, Serialize};

/// Tracker errors. UnknownMode and InvalidWType are caller-visible write
/// concern failures and carry wire error codes; the rest are internal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid or unexpected data, e.g. a malformed identity document.
    InvalidData(String),
    /// An IO error, e.g. from the persistence layer.
    IO(String),
    /// An unrecognized getLastError mode (named write concern).
    UnknownMode(String),
    /// A write concern w value that is neither a string nor a number. Holds
    /// a rendering of the offending value.
    InvalidWType(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::UnknownMode(name) => write!(f, "unrecognized getLastError mode: {name}"),
            Error::InvalidWType(_) => write!(f, "w has to be a string or a number"),
        }
    }
}

impl Error {
    /// Returns the protocol error code reported to getLastError callers, or
    /// None for errors that aren't caller-visible.
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::UnknownMode(_) => Some(14830),
            Error::InvalidWType(_) => Some(16250),
            Error::InvalidData(_) | Error::IO(_) => None,
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// A tracker result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        // A poisoned mutex means a thread panicked while holding it. There
        // is no recovering the tracker state, so surface it as an error.
        Error::IO(err.to_string())
    }
}
