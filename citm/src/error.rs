//! The crate-wide error type.
//!
//! Every sub-module defines its own `thiserror`-derived `Error` enum (see
//! [`crate::wire::server`], [`crate::wire::client`], [`crate::keydir`],
//! [`crate::session`]) and converts into this one via `#[from]`, the same
//! shape `email-lib` uses to fold backend-specific errors into
//! `account::Error`.

use std::{any::Any, error, fmt, result};

use thiserror::Error;

/// The global `Result` alias of the crate.
pub type Result<T> = result::Result<T, Error>;

/// The crate-wide error-carrying value threaded through every component.
///
/// Variants are grouped along the error kinds named in the specification:
/// `Cancelled` is the normal shutdown path and must never be logged as an
/// error; `Response` is a fatal peer protocol violation; `Param`/`Value` are
/// malformed persisted data; `Ssl` is a fatal TLS failure; `NotForMe` is not
/// an error at all (the cache is told to skip the message); `Internal` is a
/// programmer error.
#[derive(Debug, Error)]
pub enum Error {
    /// Originated by a local `cancel()` or propagated from a cancelled
    /// collaborator. Not logged as an error.
    #[error("cancelled")]
    Cancelled,

    /// The peer violated the IMAP contract: unexpected tag, wrong response
    /// type, missing `APPENDUID`, missing required capability, etc.
    #[error("protocol violation: {0}")]
    Response(String),

    /// Malformed persisted data. Dropped with a warning on load; fatal on
    /// write.
    #[error("malformed persisted value: {0}")]
    Param(String),

    /// Same family as [`Error::Param`], used where the offending value is
    /// itself the payload rather than a description.
    #[error("invalid value: {0}")]
    Value(String),

    /// TLS negotiation or record-layer failure.
    #[error("tls error: {0}")]
    Ssl(#[source] Box<dyn error::Error + Send + Sync>),

    /// Decryption recipient mismatch. Not an error from the cache's point
    /// of view — it skips the message — but is threaded as an error variant
    /// because it must short-circuit the decryption hook's call chain.
    #[error("message is not for this device")]
    NotForMe,

    /// Programmer error, or a `Fixedsize` buffer invariant violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transport failure below the `Connection` abstraction.
    #[error("io error")]
    Io(#[from] std::io::Error),

    /// A collaborator (`IoCollaborator`, `MailCache`) failed with an error
    /// not known at compile time.
    #[error("collaborator error")]
    Collaborator(#[from] AnyBoxedError),
}

impl Error {
    /// Upgrades any non-cancel error to `Internal`, per the propagation
    /// policy: "on cancellation the component upgrades any non-cancel
    /// error to `Internal` because nothing else was supposed to cancel
    /// it".
    pub fn upgrade_on_cancel(self) -> Self {
        match self {
            Error::Cancelled => Error::Cancelled,
            other => Error::Internal(other.to_string()),
        }
    }

    /// Whether the error represents the normal shutdown path.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// The global, downcastable any-`Error` trait of the crate.
///
/// Used instead of [`Error`] at the two collaborator-trait boundaries
/// (`IoCollaborator`, `MailCache`) where the concrete error type cannot be
/// named in an object-safe trait. Mirrors `email-lib`'s `AnyError`.
pub trait AnyError: error::Error + Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T> AnyError for T
where
    T: error::Error + Any + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The global any boxed `Error` alias of the crate.
pub type AnyBoxedError = Box<dyn AnyError + Send + Sync>;

impl fmt::Display for AnyBoxedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_ref(), f)
    }
}

impl error::Error for AnyBoxedError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        error::Error::source(self.as_ref())
    }
}

/// The global any `Result` alias of the crate.
pub type AnyResult<T> = result::Result<T, AnyBoxedError>;
