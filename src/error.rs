use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The looked-up key has no live version (never written, deleted, or
    /// masked by the reader's snapshot).
    ItemNotFound,
    /// The looked-up key exists but its live version carries no value.
    ItemNoValue,
    /// The key exceeds the configured maximum key size. The mutation was
    /// not applied.
    KeyTooLarge,
    /// The log contains a block that cannot be decoded. Fatal for store
    /// open and for page reloads.
    CorruptLog(String),
    /// An IO error from the log or the lock file.
    Io(String),
    /// The store is shutting down and no longer accepts work.
    ShuttingDown,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ItemNotFound => write!(f, "item not found"),
            Error::ItemNoValue => write!(f, "item has no value"),
            Error::KeyTooLarge => write!(f, "key is too large"),
            Error::CorruptLog(msg) => write!(f, "corrupt log: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::ShuttingDown => write!(f, "store is shutting down"),
        }
    }
}

/// Constructs an Error::CorruptLog for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::CorruptLog(format!($($args)*)) };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
