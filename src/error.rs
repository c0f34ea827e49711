//! Error handling for remoteslave.
//!
//! Provides a unified error handling system based on gRPC status codes,
//! with mapping from various underlying errors to appropriate categories.
//!
//! # Error Categories
//!
//! Errors are categorized into standard types:
//! * Transport failures (`Unavailable`, `Cancelled`)
//! * Catalog API failures (`FailedPrecondition`)
//! * Protocol drift (`Unimplemented`, `InvalidArgument`)
//! * Local failures (`NotFound`, `PermissionDenied`, `Internal`)
//!
//! On top of these, the player distinguishes a small set of named failures:
//!
//! | Failure | Constructor | Kind |
//! |---|---|---|
//! | connect | [`Error::connect`] | `Unavailable` |
//! | channel closed | [`Error::channel_closed`] | `Cancelled` |
//! | API failure | [`Error::api_failure`] | `FailedPrecondition` |
//! | unrecognized command | [`Error::unrecognized_command`] | `Unimplemented` |
//! | pipeline start | [`Error::pipeline_start`] | from the spawn error |
//!
//! # Example
//!
//! ```rust
//! use remoteslave::error::{Error, ErrorKind, Result};
//!
//! fn do_something() -> Result<()> {
//!     if condition {
//!         return Err(Error::not_found("resource doesn't exist"));
//!     }
//!
//!     let file = std::fs::File::open("file.txt")?;
//!
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
///
/// Provides:
/// * Categorized error types ([`ErrorKind`])
/// * Underlying error details
/// * Conversion from common error types
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// # Example
    /// ```
    /// if let Some(failure) = error.downcast::<ApiFailure>() {
    ///     println!("catalog said: {failure}");
    /// }
    /// ```
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether this error should terminate the process rather than be
    /// logged and ignored.
    ///
    /// Only protocol drift is fatal on its own. Catalog failures are fatal
    /// only in context (the startup state fetch), which the caller decides.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Unimplemented)
    }

    /// Whether retrying the failed operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Unavailable
                | ErrorKind::Cancelled
                | ErrorKind::DeadlineExceeded
                | ErrorKind::Aborted
        )
    }
}

/// Standard result type for remoteslave operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// Only the categories that remoteslave produces are listed; the
/// discriminants keep their gRPC values.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// The pubsub channel went away under a pending read or write.
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    /// A frame, command or setting that does not parse or does not fit.
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    #[error("operation timed out")]
    DeadlineExceeded = 4,

    /// A catalog object, station track or local file that is missing.
    #[error("not found")]
    NotFound = 5,

    #[error("permission denied")]
    PermissionDenied = 7,

    /// The catalog answered, but not with `ok`.
    #[error("invalid state")]
    FailedPrecondition = 9,

    /// The transport dropped mid-stream.
    #[error("operation aborted")]
    Aborted = 10,

    /// A queue index or track position past the end.
    #[error("out of range")]
    OutOfRange = 11,

    /// A remote command this player does not know.
    #[error("not implemented")]
    Unimplemented = 12,

    #[error("internal error")]
    Internal = 13,

    /// The pubsub or catalog service cannot be reached.
    #[error("service unavailable")]
    Unavailable = 14,

    /// A response body that was cut short.
    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

/// A non-ok answer from the catalog API.
///
/// Either the HTTP request itself failed with a status other than 200, or
/// the server answered with a body whose `status` is not `"ok"`.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ApiFailure {
    /// The HTTP status code was not 200.
    #[error("HTTP status {0}")]
    StatusCode(u16),

    /// The response body reported a non-ok status.
    #[error("server status {0}")]
    ServerStatus(String),
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for a failed session lookup or transport handshake.
    ///
    /// Maps to `Unavailable`. The pubsub channel retries these itself when
    /// reconnecting; at startup they are returned to the caller.
    pub fn connect<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::unavailable(error)
    }

    /// Creates an error for writes on a torn-down pubsub channel.
    #[must_use]
    pub fn channel_closed() -> Self {
        Self::cancelled("pubsub channel is closed")
    }

    /// Creates an error for a non-ok catalog API response.
    ///
    /// The [`ApiFailure`] can be recovered with [`Error::downcast`].
    #[must_use]
    pub fn api_failure(failure: ApiFailure) -> Self {
        Self::failed_precondition(failure)
    }

    /// Creates an error for a remote command outside the known command set.
    ///
    /// This is fatal: see [`Error::is_fatal`].
    pub fn unrecognized_command<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unimplemented, error)
    }

    /// Creates an error for a playback process that could not be started.
    #[must_use]
    pub fn pipeline_start(program: &str, err: std::io::Error) -> Self {
        let message = format!("failed to start {program}: {err}");
        let kind = Self::from(err).kind;
        Self::new(kind, message)
    }

    /// Creates an error for cancelled operations.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for operations that failed due to current state.
    pub fn failed_precondition<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FailedPrecondition, error)
    }

    /// Creates an error for internal errors.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Creates an error for invalid arguments, such as malformed frames.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for missing resources.
    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotFound, error)
    }

    /// Creates an error for values outside their valid range.
    pub fn out_of_range<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::OutOfRange, error)
    }

    /// Creates an error for unavailable services.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display, showing both kind and details.
///
/// Format: "{kind}: {details}"
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Maps standard IO errors to their logical equivalents:
/// * `NotFound` -> `NotFound`
/// * `PermissionDenied` -> `PermissionDenied`
/// * `ConnectionReset` -> `Aborted`
/// * etc.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::new(ErrorKind::PermissionDenied, err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::new(ErrorKind::Aborted, err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::new(ErrorKind::DataLoss, err),
            TimedOut => Self::new(ErrorKind::DeadlineExceeded, err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::new(ErrorKind::Unknown, err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
///
/// * Body errors -> `DataLoss`
/// * Decode errors -> `InvalidArgument`
/// * Connect errors -> `Unavailable`
/// * Status errors -> `FailedPrecondition`
/// * Timeout errors -> `DeadlineExceeded`
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() {
            return Self::new(ErrorKind::DataLoss, err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_connect() || err.is_redirect() {
            return Self::unavailable(err);
        }

        if let Some(status) = err.status() {
            return Self::api_failure(ApiFailure::StatusCode(status.as_u16()));
        }

        if err.is_timeout() {
            return Self::new(ErrorKind::DeadlineExceeded, err);
        }

        Self::new(ErrorKind::Unknown, err)
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// * `ConnectionClosed` -> `Cancelled`
/// * `AlreadyClosed` -> `Cancelled`
/// * `Io` -> `Unavailable`
/// * `Capacity` -> `OutOfRange`
/// * Others -> `Unavailable`
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            ConnectionClosed | AlreadyClosed => Self::cancelled(err),
            Io(err) => Self::unavailable(err),
            Capacity(err) => Self::out_of_range(err),
            AttackAttempt => Self::new(ErrorKind::PermissionDenied, err),
            _ => Self::unavailable(err),
        }
    }
}

/// Converts JSON errors through IO error mapping.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

/// Converts TOML errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts header size errors to `OutOfRange`.
impl From<http::header::MaxSizeReached> for Error {
    fn from(e: http::header::MaxSizeReached) -> Self {
        Self::out_of_range(e.to_string())
    }
}

/// Converts invalid header errors to `Internal`.
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts URL parsing errors to `Internal`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::internal(e.to_string())
    }
}
