//! The stable, observable error taxonomy for the repository's public API.
//!
//! Everything below the CLI layer returns [`Result<T>`] with this [`Error`]
//! enum so callers can match on `Error::Locked`, `Error::WrongPassword`, and
//! so on instead of scraping strings. The CLI and other glue code use
//! `anyhow` on top of this, same as the rest of the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("authentication tag mismatch decrypting {0}")]
    Unauthenticated(String),

    #[error("no key unwraps with the given password")]
    WrongPassword,

    #[error("{0} is corrupted: {1}")]
    Corrupted(String, String),

    #[error("repository version {found} is not supported (supported: {min}..={max})")]
    VersionMismatch { found: u32, min: u32, max: u32 },

    #[error("repository is locked: {0}")]
    Locked(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid {what}: {why}")]
    Invalid { what: String, why: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn transport(why: impl std::fmt::Display) -> Self {
        Error::Transport(why.to_string())
    }

    pub fn invalid(what: impl Into<String>, why: impl std::fmt::Display) -> Self {
        Error::Invalid {
            what: what.into(),
            why: why.to_string(),
        }
    }

    /// Transient errors are the ones worth retrying at the backend boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
