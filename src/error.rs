//! Error model shared by the reactor and its helpers.
//!
//! Kernel results travel through the ring as signed integers; a negative
//! value is `-errno`. [`check`] converts such a result into either the
//! non-negative value or an [`Error`] carrying the operation label and the
//! decoded errno text.

use nix::errno::Errno;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was rejected by the kernel.
    #[error("Operation '{operation}' failed due to: {message}.")]
    Os {
        operation: &'static str,
        /// Positive errno value.
        code: i32,
        message: String,
    },

    /// The submission queue had no room for another entry. Callers batching
    /// under a [`SubmitGuard`](crate::reactor::SubmitGuard) can submit more
    /// often and retry.
    #[error("submission queue is full")]
    RingExhausted,

    /// A buffer slice request fell outside the underlying storage.
    #[error("slice [{offset}, {offset}+{len}) out of range for storage of {storage} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        storage: usize,
    },

    /// A completion arrived whose user_data does not name a registered
    /// operation. This is an internal invariant violation and is fatal for
    /// the run loop.
    #[error("no operation registered for completion user_data {user_data}")]
    UnknownCompletion { user_data: u64 },
}

impl Error {
    /// Build an [`Error::Os`] from a positive errno value.
    pub fn os(operation: &'static str, code: i32) -> Self {
        Error::Os {
            operation,
            code,
            message: Errno::from_raw(code).desc().to_string(),
        }
    }

    pub fn from_errno(operation: &'static str, errno: Errno) -> Self {
        Self::os(operation, errno as i32)
    }

    pub fn io(operation: &'static str, err: std::io::Error) -> Self {
        Self::os(operation, err.raw_os_error().unwrap_or(libc::EIO))
    }

    /// The positive errno value, or 0 for the non-OS variants.
    pub fn code(&self) -> i32 {
        match self {
            Error::Os { code, .. } => *code,
            _ => 0,
        }
    }
}

/// Turn a signed kernel result into the non-negative value or an error
/// labeled with `operation`.
pub fn check(operation: &'static str, result: i32) -> Result<i32> {
    if result < 0 {
        Err(Error::os(operation, -result))
    } else {
        Ok(result)
    }
}

/// Human-readable translation of a negative kernel result, `None` when the
/// result signals success. Used to surface connect failures inside an
/// otherwise successful completion callback.
pub fn try_extract_error(result: i32) -> Option<String> {
    if result >= 0 {
        None
    } else {
        Some(Errno::from_raw(-result).desc().to_string())
    }
}
