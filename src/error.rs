//! Kernel error kinds.
//!
//! Every public operation returns a non-negative result or one of these
//! kinds. Drivers hand kinds to the VFS, which surfaces them to callers
//! unchanged. Invariants broken by a caller are kernel bugs and panic
//! instead of returning an error.

use core::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// Malformed argument or request.
    Inval,
    /// Named object does not exist.
    NotFound,
    /// Named object already exists.
    Exists,
    /// Object is in use and the operation cannot proceed.
    Busy,
    /// Directory still has entries.
    NotEmpty,
    /// A fixed-size table is full.
    TooMany,
    /// Path component is not a directory.
    NotDir,
    /// Operation needs a non-directory.
    IsDir,
    /// Out of memory.
    NoMem,
    /// Out of blocks or inodes.
    NoSpace,
    /// Mode bits forbid the operation.
    Access,
    /// Too many levels of symbolic links.
    Loop,
    /// Name or path exceeds the limit.
    NameTooLong,
    /// The backing object cannot service the request.
    Io,
    /// One-shot initialization ran twice.
    AlreadyInit,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Inval => "invalid argument",
            Error::NotFound => "not found",
            Error::Exists => "already exists",
            Error::Busy => "busy",
            Error::NotEmpty => "not empty",
            Error::TooMany => "too many",
            Error::NotDir => "not a directory",
            Error::IsDir => "is a directory",
            Error::NoMem => "no memory",
            Error::NoSpace => "no space",
            Error::Access => "permission denied",
            Error::Loop => "too many links",
            Error::NameTooLong => "name too long",
            Error::Io => "i/o error",
            Error::AlreadyInit => "already initialized",
        };
        write!(f, "{}", msg)
    }
}
