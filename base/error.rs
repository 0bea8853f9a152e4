// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Error type carrying a machine-readable [`ErrorKind`], an optional
//! human-readable message, and an optional source chain.
//!
//! Constructed via the [`err!`] and [`bail!`] macros:
//!
//! ```
//! use capsync_base::{bail, err, Error, ErrorKind};
//! fn find(id: i64) -> Result<(), Error> {
//!     if id != 42 {
//!         bail!(NotFound, msg("no such row {id}"));
//!     }
//!     Ok(())
//! }
//! let e = find(1).unwrap_err();
//! assert_eq!(e.kind(), ErrorKind::NotFound);
//! assert_eq!(e.to_string(), "NOT_FOUND: no such row 1");
//! ```

use std::error::Error as StdError;
use std::fmt::Display;

/// Error kind, taken from the general-purpose gRPC status code classification.
///
/// The HTTP layer maps these onto status codes and the retry policy maps
/// `Unavailable` to "retry with backoff" and everything else to "surface".
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Cancelled => "CANCELLED",
            Unknown => "UNKNOWN",
            InvalidArgument => "INVALID_ARGUMENT",
            DeadlineExceeded => "DEADLINE_EXCEEDED",
            NotFound => "NOT_FOUND",
            AlreadyExists => "ALREADY_EXISTS",
            PermissionDenied => "PERMISSION_DENIED",
            Unauthenticated => "UNAUTHENTICATED",
            ResourceExhausted => "RESOURCE_EXHAUSTED",
            FailedPrecondition => "FAILED_PRECONDITION",
            Aborted => "ABORTED",
            OutOfRange => "OUT_OF_RANGE",
            Unimplemented => "UNIMPLEMENTED",
            Internal => "INTERNAL",
            Unavailable => "UNAVAILABLE",
            DataLoss => "DATA_LOSS",
        }
    }

    /// True for kinds the checkpointer and workflows may retry with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Aborted)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

/// Error type for all fallible capsync operations; see the module doc.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(
        kind: ErrorKind,
        msg: Option<String>,
        source: Option<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Error(Box::new(ErrorInner { kind, msg, source }))
    }

    pub fn wrap<E: StdError + Send + Sync + 'static>(kind: ErrorKind, source: E) -> Self {
        Error::new(kind, None, Some(Box::new(source)))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Replaces the kind, e.g. to refine a generic conversion at a call site.
    pub fn map_kind(mut self, kind: ErrorKind) -> Self {
        self.0.kind = kind;
        self
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` adapter which renders the full source chain,
    /// for log statements: `error!(err = %e.chain(), "...")`.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.kind)?;
        if let Some(msg) = &self.0.msg {
            write!(f, ": {msg}")?;
        } else if let Some(source) = &self.0.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.chain())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

/// Displays an [`Error`] together with its chain of causes.
pub struct ErrorChain<'a>(&'a Error);

impl Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)?;
        let mut next = self.0.source();
        while let Some(source) = next {
            write!(f, "\ncaused by: {source}")?;
            next = source.source();
        }
        Ok(())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match &e {
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::DatabaseBusy => {
                ErrorKind::Unavailable
            }
            _ => ErrorKind::Unknown,
        };
        Error::wrap(kind, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        };
        Error::wrap(kind, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::wrap(ErrorKind::InvalidArgument, e)
    }
}

impl From<crate::shutdown::ShutdownError> for Error {
    fn from(e: crate::shutdown::ShutdownError) -> Self {
        Error::wrap(ErrorKind::Cancelled, e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, discarding any previous kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Error>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| e.into().map_kind(k))
    }
}

/// Constructs an [`Error`] from an [`ErrorKind`] and optional `msg(...)` /
/// `source(...)` arguments, in that order.
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)), None)
    };
    ($kind:ident, source($source:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some(Box::new($source)))
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr)) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            Some(Box::new($source)),
        )
    };
}

/// Returns early with an [`err!`]-constructed error.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*).into())
    };
}
