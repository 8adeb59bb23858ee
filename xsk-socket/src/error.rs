use std::{error, fmt, io};

/// Errors produced by the AF_XDP control plane.
#[derive(Debug)]
pub enum XskError {
    /// Invalid argument or configuration.
    Invalid(&'static str),
    /// The umem is still referenced by at least one socket.
    Busy,
    /// An interface or BPF object could not be located.
    NotFound(String),
    /// A system call failed; the original errno is preserved.
    Os { op: &'static str, err: io::Error },
}

impl fmt::Display for XskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XskError::Invalid(what) => write!(f, "invalid argument: {what}"),
            XskError::Busy => write!(f, "umem is busy"),
            XskError::NotFound(what) => write!(f, "not found: {what}"),
            XskError::Os { op, err } => write!(f, "{op}: {err}"),
        }
    }
}

impl error::Error for XskError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            XskError::Os { err, .. } => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for XskError {
    fn from(err: io::Error) -> Self {
        XskError::Os { op: "io", err }
    }
}

impl XskError {
    /// Captures `errno` of the system call that just failed.
    pub(crate) fn last_os(op: &'static str) -> Self {
        XskError::Os {
            op,
            err: io::Error::last_os_error(),
        }
    }

    pub(crate) fn os(op: &'static str, err: io::Error) -> Self {
        XskError::Os { op, err }
    }
}
