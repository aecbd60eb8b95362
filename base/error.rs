// This file is part of clipmux, a TS/fMP4-to-MP4 remuxing library.
// SPDX-License-Identifier: GPL-3.0-or-later WITH GPL-3.0-linking-exception

use failure::{Context, Fail};
use std::fmt;

/// The classified error every `clipmux` entry point returns on failure.
///
/// Wraps a `failure::Context<ErrorKind>` rather than hand-rolling `Display`
/// plumbing, matching how the rest of this crate's ancestry structures
/// errors: a closed `ErrorKind` for callers to match on, with an optional
/// free-text cause chain for humans.
#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        *self.inner.get_context()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&failure::Backtrace> {
        self.inner.backtrace()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.cause() {
            None => fmt::Display::fmt(&self.kind(), f),
            Some(c) => write!(f, "{}: {}", self.kind(), c),
        }
    }
}

/// The closed error taxonomy a conversion can fail with.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
#[non_exhaustive]
pub enum ErrorKind {
    /// TS missing PAT/PMT; ISO-BMFF missing `ftyp`/`moov`; a box whose size
    /// is `< 8` or exceeds the remaining bytes in a top-level scan.
    #[fail(display = "malformed container")]
    MalformedContainer,
    /// An elementary stream uses a codec this crate does not remux.
    #[fail(display = "unsupported codec")]
    UnsupportedCodec,
    /// A video PID was located but produced zero access units.
    #[fail(display = "empty stream")]
    EmptyStream,
    /// `start_time_s > end_time_s`, an empty segment list for stitching, etc.
    #[fail(display = "invalid argument")]
    InvalidArgument,
    /// The combined `mdat` would exceed the 32-bit `stco` offset space.
    #[fail(display = "out of bounds")]
    OutOfBounds,
    /// An internal invariant was violated; should never surface to callers.
    #[fail(display = "internal error")]
    Internal,
}

/// Extension methods for attaching a [`ErrorKind`] to a foreign `Result`.
pub trait ResultExt<T, E> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Into<failure::Error>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| e.into().context(k).into())
    }
}

/// Like `failure::bail!`, but the first argument names an [`ErrorKind`].
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $e:expr) => {
        return Err(failure::err_msg($e).context($crate::ErrorKind::$t).into());
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        return Err(failure::err_msg(format!($fmt, $($arg)+)).context($crate::ErrorKind::$t).into());
    };
}

/// Like `failure::format_err!`, but the first argument names an [`ErrorKind`].
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $e:expr) => {
        Into::<$crate::Error>::into(failure::err_msg($e).context($crate::ErrorKind::$t))
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        Into::<$crate::Error>::into(failure::err_msg(format!($fmt, $($arg)+))
                                    .context($crate::ErrorKind::$t))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bail_t_attaches_kind() {
        let e = || -> Result<(), Error> {
            bail_t!(UnsupportedCodec, "stream type {:#x}", 0x81);
        }()
        .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::UnsupportedCodec);
        assert_eq!(e.to_string(), "unsupported codec: stream type 0x81");
    }

    #[test]
    fn format_err_t_attaches_kind() {
        let e = format_err_t!(InvalidArgument, "start {} > end {}", 5.0, 1.0);
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }
}
