//! Error types for layerio-core

use std::io;
use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Non-blocking channel has no data (or no room) right now
    #[error("Resource temporarily unavailable")]
    WouldBlock,

    /// Error code reported by a channel driver, propagated as-is
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No forward progress, misconfiguration, or an unsupported request
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Channel is owned by a background copy
    #[error("Channel is busy with a background copy")]
    Busy,

    #[error("Channel is closed")]
    Closed,

    #[error("Channel \"{0}\" wasn't opened for reading")]
    NotReadable(String),

    #[error("Channel \"{0}\" wasn't opened for writing")]
    NotWritable(String),

    #[error("Channel \"{0}\" is not seekable")]
    NotSeekable(String),

    #[error("Bad option \"{name}\": should be one of {known}")]
    UnknownOption { name: String, known: String },

    #[error("Bad value for -{option}: {reason}")]
    BadOptionValue { option: String, reason: String },

    #[error("Unknown encoding \"{name}\": should be one of {known}")]
    UnknownEncoding { name: String, known: String },

    #[error("Seek offset {0} does not fit the driver's 32-bit seek")]
    Overflow(i64),

    #[error("Transform failed: {0}")]
    Transform(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    /// Build an unknown-option error from the list of names a layer understands.
    pub fn unknown_option(name: &str, known: &[&str]) -> Self {
        let known = match known.split_last() {
            Some((last, [])) => format!("-{}", last),
            Some((last, rest)) => {
                let head: Vec<String> = rest.iter().map(|n| format!("-{}", n)).collect();
                format!("{}, or -{}", head.join(", "), last)
            }
            None => "nothing".to_string(),
        };
        ChannelError::UnknownOption {
            name: name.to_string(),
            known,
        }
    }

    pub fn bad_value(option: &str, reason: impl Into<String>) -> Self {
        ChannelError::BadOptionValue {
            option: option.trim_start_matches('-').to_string(),
            reason: reason.into(),
        }
    }

    /// Transient "try again later" condition, never an application error.
    pub fn is_would_block(&self) -> bool {
        match self {
            ChannelError::WouldBlock => true,
            ChannelError::Io(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// POSIX-style classification of the error.
    pub fn errno_name(&self) -> &'static str {
        match self {
            ChannelError::WouldBlock => "EAGAIN",
            ChannelError::Busy => "EBUSY",
            ChannelError::Overflow(_) => "EOVERFLOW",
            ChannelError::Io(e) => match e.kind() {
                io::ErrorKind::WouldBlock => "EAGAIN",
                io::ErrorKind::NotFound => "ENOENT",
                io::ErrorKind::PermissionDenied => "EACCES",
                io::ErrorKind::BrokenPipe => "EPIPE",
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => "EINVAL",
                io::ErrorKind::Unsupported => "ENOTSUP",
                _ => "EIO",
            },
            _ => "EINVAL",
        }
    }

    /// Turn a driver result into the channel's taxonomy.
    ///
    /// A `ChannelError` a layer wrapped with [`ChannelError::into_io`] comes
    /// back out unchanged.
    pub(crate) fn from_driver(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            return ChannelError::WouldBlock;
        }
        let wrapped = err
            .get_ref()
            .map_or(false, |inner| inner.is::<ChannelError>());
        if !wrapped {
            return ChannelError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<ChannelError>()) {
            Some(Ok(inner)) => *inner,
            _ => ChannelError::Invalid("unreadable driver error".to_string()),
        }
    }

    /// Carry this error through a driver's `io::Result`.
    pub fn into_io(self) -> io::Error {
        match self {
            ChannelError::Io(err) => err,
            ChannelError::WouldBlock => would_block(),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Shorthand for a driver-side "would block" error.
pub fn would_block() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "operation would block")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChannelError::Closed;
        assert_eq!(err.to_string(), "Channel is closed");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "test");
        let err: ChannelError = io_err.into();
        assert!(matches!(err, ChannelError::Io(_)));
        assert_eq!(err.errno_name(), "ENOENT");
    }

    #[test]
    fn test_would_block_classification() {
        assert!(ChannelError::WouldBlock.is_would_block());
        assert!(ChannelError::from_driver(would_block()).is_would_block());
        assert!(!ChannelError::Busy.is_would_block());
        assert_eq!(ChannelError::Busy.errno_name(), "EBUSY");
        assert_eq!(ChannelError::Invalid("x".into()).errno_name(), "EINVAL");
    }

    #[test]
    fn test_unknown_option_lists_names() {
        let err = ChannelError::unknown_option("-color", &["blocking", "buffering", "encoding"]);
        assert_eq!(
            err.to_string(),
            "Bad option \"-color\": should be one of -blocking, -buffering, or -encoding"
        );
    }

    #[test]
    fn test_wrapped_error_survives_driver_boundary() {
        let io_err = ChannelError::Transform("bad block".into()).into_io();
        assert!(matches!(
            ChannelError::from_driver(io_err),
            ChannelError::Transform(msg) if msg == "bad block"
        ));
        let plain = ChannelError::Io(io::Error::new(io::ErrorKind::NotFound, "x")).into_io();
        assert_eq!(plain.kind(), io::ErrorKind::NotFound);
    }
}
