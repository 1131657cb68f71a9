//! Error types for the VRG core
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! follow one taxonomy: native object creation, programming errors, render
//! pass synchronization violations, asynchronous GPU failures and memory
//! exhaustion. Nothing is retried internally; errors always reach the caller.

use std::fmt;

/// Result type for VRG operations
pub type Result<T> = std::result::Result<T, Error>;

/// VRG core errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A native object (buffer, image, pool, pipeline...) could not be created
    CreationFailure(String),

    /// The API was used incorrectly (out-of-range index, bind without
    /// pipeline, mismatched copy sizes, missing backing buffer...)
    InvalidUsage(String),

    /// A render-pass attachment is used as a synchronization source without
    /// the store-op that makes its contents visible to later subpasses
    DependencyViolation {
        /// Name of the offending attachment
        attachment: String,
        /// What was wrong with it
        reason: String,
    },

    /// A fence wait, fence poll, submit or present returned a failure code
    AsyncFailure(String),

    /// The memory arena could not satisfy an allocation
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CreationFailure(msg) => write!(f, "Creation failure: {}", msg),
            Error::InvalidUsage(msg) => write!(f, "Invalid usage: {}", msg),
            Error::DependencyViolation { attachment, reason } => {
                write!(f, "Dependency violation on attachment '{}': {}", attachment, reason)
            }
            Error::AsyncFailure(msg) => write!(f, "Async failure: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
        }
    }
}

impl std::error::Error for Error {}

/// Log an error and build an [`Error::InvalidUsage`] from the same message
///
/// # Example
///
/// ```no_run
/// # use vrg_core::vrg_err;
/// let index = 7;
/// let err = vrg_err!("vrg::buffer", "Index {} out of range", index);
/// ```
#[macro_export]
macro_rules! vrg_err {
    ($source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::vrg_error!($source, "{}", message);
        $crate::error::Error::InvalidUsage(message)
    }};
}

/// Log an error and return an [`Error::InvalidUsage`] from the enclosing function
#[macro_export]
macro_rules! vrg_bail {
    ($source:expr, $($arg:tt)*) => {
        return Err($crate::vrg_err!($source, $($arg)*))
    };
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
