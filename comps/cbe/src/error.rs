// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error types used in this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Not found.
    NotFound,
    /// Invalid arguments.
    InvalidArgs,
    /// The request does not fit the current superblock state.
    InvalidState,
    /// No free channel to accept the request.
    Busy,
    /// The library is deinitialized or not yet initialized.
    NotInitialized,
    /// Out of disk space.
    OutOfDisk,
    /// IO error.
    IoFailed,
    /// Permission denied.
    PermissionDenied,
    /// Encryption operation failed.
    EncryptFailed,
    /// Decryption operation failed.
    DecryptFailed,
    /// MAC (Message Authentication Code) mismatched.
    MacMismatched,
    /// The content of a block does not match its recorded hash.
    HashMismatch,
    /// The key id is unknown to the crypto module.
    KeyNotFound,
    /// The crypto module has no room for another key.
    KeyTableFull,
    /// None of the superblock slots matches the sealed hash.
    NoValidSuperblock,
    /// Every snapshot slot is occupied by a snapshot that must be retained.
    NoFreeSnapshotSlot,
    /// (De)serialization of on-disk metadata failed.
    SerializeFailed,
}

/// The error with an error type and an error message used in this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given error type and no error message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given error type and the error message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error type.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// Returns the error message, if any.
    pub fn msg(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl core::error::Error for Error {}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}

/// The result type used in this crate.
pub type Result<T> = core::result::Result<T, Error>;
