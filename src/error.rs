use std::fmt::Display;

/// Cache engine errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The key is not present in the log or in any set bucket.
    NotFound,
    /// Admission was declined: the value exceeds the maximum item size, or
    /// the log is saturated while cleaning is already in progress.
    Rejected,
    /// A device read, write, reset or finish failed.
    Device(String),
    /// On-device bytes failed checksum verification or entry decoding.
    /// The engine hides this from lookup callers (reported as `NotFound`)
    /// but counts every occurrence.
    Corrupted(String),
    /// An internal invariant was violated and the engine cannot safely
    /// continue on this path, e.g. the zone write pointer caught up with
    /// the erase pointer.
    BadState(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Rejected => write!(f, "admission rejected"),
            Error::Device(msg) => write!(f, "device error: {msg}"),
            Error::Corrupted(msg) => write!(f, "corrupted data: {msg}"),
            Error::BadState(msg) => write!(f, "bad state: {msg}"),
        }
    }
}

/// Constructs an Error::Corrupted for the given format string.
#[macro_export]
macro_rules! corrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupted(format!($($args)*)) };
}

/// Constructs an Error::BadState for the given format string.
#[macro_export]
macro_rules! badstate {
    ($($args:tt)*) => { $crate::error::Error::BadState(format!($($args)*)) };
}

/// An engine Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Device(err.to_string())
    }
}
