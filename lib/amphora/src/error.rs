// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy shared by all storage drivers.
//!
//! `InUse` and `RequiresCascade` are expected, recoverable conditions that
//! callers branch on; the rest are failures. Backend errors are wrapped
//! with the operation and object name via [`Error::context`] so they can
//! be diagnosed without backend knowledge.

use crate::cmd::CmdError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("in use")]
    InUse,

    #[error("not supported by this storage driver")]
    NotSupported,

    #[error("volume cannot be shrunk")]
    CannotShrink,

    #[error("dependent snapshots must be removed first: {}", .0.join(", "))]
    RequiresCascade(Vec<String>),

    #[error("required tool {0:?} is not installed")]
    ToolMissing(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    ConfigInvalid(Vec<String>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Cmd(#[from] CmdError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to {op} {object}: {source}")]
    Failed {
        op: &'static str,
        object: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps an error with the operation and object it occurred on.
    pub fn context(self, op: &'static str, object: impl Into<String>) -> Self {
        Error::Failed { op, object: object.into(), source: Box::new(self) }
    }

    /// Strips `Failed` wrappers so callers can branch on the underlying
    /// condition regardless of how many layers added context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Failed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self.root(), Error::InUse)
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self.root(), Error::NotSupported)
    }
}

/// Adds [`Error::context`] to `Result` chains.
pub trait ResultExt<T> {
    fn context(self, op: &'static str, object: impl Into<String>)
        -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn context(
        self,
        op: &'static str,
        object: impl Into<String>,
    ) -> Result<T> {
        self.map_err(|e| e.into().context(op, object))
    }
}
