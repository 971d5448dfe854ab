// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for
/// descriptions of each error.
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

impl fmt::Display for ErrorKind {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A coded error, constructed via [`crate::err!`] or [`crate::bail!`].
///
/// Boxed so that `Result<T, Error>` stays pointer-sized on the hot path.
pub struct Error(Box<ErrorInner>);

impl Error {
    #[doc(hidden)]
    pub fn new(
        kind: ErrorKind,
        msg: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error(Box::new(ErrorInner { kind, msg, source }))
    }

    pub fn wrap<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, source: E) -> Self {
        Error::new(kind, None, Some(Box::new(source)))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display`able showing this error and all its sources,
    /// separated by `: `, for single-line log fields.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.msg {
            Some(msg) => write!(f, "{}: {msg}", self.0.kind),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Helper returned by [`Error::chain`].
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidArgument,
            IoKind::TimedOut => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Unknown,
        };
        Error::wrap(kind, e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        let kind = match e {
            nix::Error::ENOENT => ErrorKind::NotFound,
            nix::Error::EACCES | nix::Error::EPERM => ErrorKind::PermissionDenied,
            nix::Error::EEXIST => ErrorKind::AlreadyExists,
            nix::Error::ENOSPC => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Unknown,
        };
        Error::wrap(kind, e)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::wrap(ErrorKind::Internal, e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k, None, Some(e.into())))
    }
}

/// Constructs an [`Error`] from an [`ErrorKind`] and optional `msg(...)` and
/// `source(...)` clauses.
///
/// Example:
/// ```
/// use lightnvr_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no stream {}", "driveway"));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no stream driveway");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)*) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)), None)
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some($source.into()))
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr) $(,)?) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            Some($source.into()),
        )
    };
    ($kind:ident, source($source:expr), msg($($msg:tt)*) $(,)?) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            Some($source.into()),
        )
    };
}

/// Like [`crate::err!`], but returns the error from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = crate::err!(Unavailable, msg("write failed"), source(io));
        assert_eq!(e.kind(), ErrorKind::Unavailable);
        assert_eq!(
            e.chain().to_string(),
            "Unavailable: write failed: disk on fire"
        );
    }

    #[test]
    fn io_kind_mapping() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e: Error = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn bail_returns() {
        fn f() -> Result<(), Error> {
            crate::bail!(InvalidArgument, msg("bad threshold {}", 1.5));
        }
        let e = f().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(e.to_string(), "Invalid argument: bad threshold 1.5");
    }
}
