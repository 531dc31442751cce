//! Error kinds.
//!
//! There is deliberately no `thiserror`/`anyhow` dependency here; small
//! `Display` impls are written by hand and `Result<_, String>` or `bool`
//! is threaded through otherwise.

use std::fmt;

/// The four error kinds.
#[derive(Debug)]
pub enum Error {
    /// write-would-block, pipe full, pool temporarily empty. Retried on the
    /// next wake; callers generally don't even construct this variant; it
    /// exists so call sites that want to be explicit about "this isn't a
    /// real error" can say so.
    Transient(String),
    /// Bad config command, unknown option, permission denied on bind.
    /// Reported to the controller and the log; state is left unchanged.
    Recoverable(String),
    /// Name table full, variable buffer full. Reported, and the requested
    /// operation fails.
    Resource(String),
    /// Cannot open `/dev/null`, setsid failure, cannot preallocate pools.
    /// Routed through the fatal handler (`shutdown::fatal`).
    Fatal { detail: String, exit_code: i32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transient(d) => write!(f, "transient: {d}"),
            Error::Recoverable(d) => write!(f, "recoverable: {d}"),
            Error::Resource(d) => write!(f, "resource exhausted: {d}"),
            Error::Fatal { detail, exit_code } => {
                write!(f, "fatal ({exit_code}): {detail}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn recoverable(detail: impl Into<String>) -> Error {
        Error::Recoverable(detail.into())
    }

    pub fn resource(detail: impl Into<String>) -> Error {
        Error::Resource(detail.into())
    }

    pub fn fatal(detail: impl Into<String>, exit_code: i32) -> Error {
        Error::Fatal { detail: detail.into(), exit_code }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
