//! Error type shared by the archive engine, node transports and bootstrap.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::artifact::ArtifactType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// `(type, name)` is not present in the package.
    #[error("artifact not found: {kind} '{name}'")]
    NotFound { kind: ArtifactType, name: String },

    /// Stored bytes do not hash to the recorded digest.
    #[error("checksum mismatch for '{path}': expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    /// Could not reach or authenticate against the target.
    #[error("transport to {target} failed: {message}")]
    Transport { target: String, message: String },

    /// The command ran but did not succeed. `command` is the redacted form.
    #[error("command `{command}` failed on {target}: {status}")]
    Execution {
        target: String,
        command: String,
        status: String,
    },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("no running process named '{0}'")]
    ProcessNotFound(String),

    #[error("no connection to port {port} found for process '{process}'")]
    Exhausted { process: String, port: u16 },

    #[error("invalid artifact name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("archive stream already consumed")]
    StreamConsumed,

    #[error("config '{path}': {message}")]
    Config { path: PathBuf, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Error::Malformed {
            what,
            detail: detail.into(),
        }
    }

    pub(crate) fn transport(target: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport {
            target: target.into(),
            message: message.into(),
        }
    }

    /// True for the "artifact absent" kind, used by callers that check for presence.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Attach a lazily built context string to an I/O result.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::Io {
            context: f().into(),
            source,
        })
    }
}
