//! Failure taxonomy at the device boundary. None of these abort a pass;
//! callers degrade the affected field and move on.

use std::fmt;
use std::io;
use thiserror::Error;

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    NotFound,
    AccessDenied,
    Busy,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::NotFound => write!(f, "not found"),
            Unavailable::AccessDenied => write!(f, "access denied"),
            Unavailable::Busy => write!(f, "busy"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    /// Open failed; the slot is skipped.
    #[error("device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: Unavailable },

    /// The OS declined a geometry/partition/extent query.
    #[error("query unsupported: {0}")]
    QueryUnsupported(&'static str),

    /// A sector read failed mid-probe.
    #[error("read of {len} bytes at offset {offset} failed: {source}")]
    Io {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    /// Resolver-only: the caller's buffer was too small for the answer.
    #[error("buffer too small (required: {required:?})")]
    BufferTooSmall { required: Option<usize> },
}

impl ProbeError {
    pub fn not_found(path: impl Into<String>) -> Self {
        ProbeError::DeviceUnavailable {
            path: path.into(),
            reason: Unavailable::NotFound,
        }
    }

    /// Maps an `open(2)`-style failure onto the unavailable taxonomy.
    pub fn from_open(path: impl Into<String>, err: &io::Error) -> Self {
        let reason = match err.kind() {
            io::ErrorKind::PermissionDenied => Unavailable::AccessDenied,
            io::ErrorKind::NotFound => Unavailable::NotFound,
            _ if is_busy(err) => Unavailable::Busy,
            _ => Unavailable::NotFound,
        };
        ProbeError::DeviceUnavailable {
            path: path.into(),
            reason,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProbeError::DeviceUnavailable { .. })
    }
}

fn is_busy(err: &io::Error) -> bool {
    // EBUSY on unix, ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION on windows
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(16)
    }
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}
