//! Internal error kinds shared by the tree, the broker client and the
//! filesystem adapter, and their mapping onto FUSE/POSIX errno values.
//!
//! Mirrors the teacher's own error handling: a plain enum plus manual
//! `Display`/`Error` impls and a `From<io::Error>` conversion, no
//! `anyhow`/`thiserror` in the dependency tree.

use std::fmt;
use std::io;

/// The error kinds named in the design's error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Path does not resolve to any node.
    NotFound,
    /// Operation expected a directory component.
    NotADirectory,
    /// Operation expected a file component.
    IsADirectory,
    /// Name collides with an existing child.
    Exists,
    /// Allocation failed.
    NoMemory,
    /// Kernel device or broker socket read/write failed or returned short.
    IoProtocol,
    /// Received frame is malformed or out of expected sequence.
    ProtocolError,
    /// Broker worker has exited.
    NotRunning,
    /// Value outside domain (e.g. topic longer than 65535 bytes).
    InvalidArgument,
}

/// An error carrying one of the kinds above plus a human-readable detail.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    detail: String,
}

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Error {
            kind,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Map this error onto the POSIX errno `fuser` expects in a reply.
    pub fn to_errno(&self) -> i32 {
        match self.kind {
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::NotADirectory => libc::ENOTDIR,
            ErrorKind::IsADirectory => libc::EISDIR,
            ErrorKind::Exists => libc::EEXIST,
            ErrorKind::NoMemory => libc::ENOMEM,
            ErrorKind::IoProtocol => libc::EIO,
            ErrorKind::ProtocolError => libc::EIO,
            ErrorKind::NotRunning => libc::EIO,
            ErrorKind::InvalidArgument => libc::EINVAL,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ErrorKind::IoProtocol, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! bail {
    ($kind:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::new($kind, format!($($arg)*)))
    };
}
pub(crate) use bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_found_to_enoent() {
        let e = Error::new(ErrorKind::NotFound, "no such topic");
        assert_eq!(e.to_errno(), libc::ENOENT);
    }

    #[test]
    fn io_error_becomes_io_protocol() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let e: Error = io_err.into();
        assert_eq!(e.kind(), ErrorKind::IoProtocol);
    }
}
