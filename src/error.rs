//! Error taxonomy shared by the recorder and player filters.

use failure::Fail;

/// The five error categories a filter operation can fail with.
///
/// Methods on [`crate::recorder::Recorder`] and [`crate::player::Player`]
/// return `Result<_, failure::Error>`; this type is the root cause most of
/// those chains bottom out in.
#[derive(Debug, Fail)]
pub enum Error {
    /// The filter wasn't in a state that allows the requested operation
    /// (e.g. `start` on a `Closed` recorder).
    #[fail(display = "precondition violated: {}", _0)]
    Precondition(String),

    /// A read or write against the underlying file failed.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[fail(cause)] std::io::Error),

    /// The container was structurally invalid: a missing mandatory element,
    /// a bad DocType, a truncated codec-private blob, and so on.
    #[fail(display = "format error: {}", _0)]
    Format(String),

    /// A codec-id or RFC name has no entry in the [`crate::codec::Registry`].
    #[fail(display = "unsupported codec: {}", _0)]
    UnsupportedCodec(String),

    /// An internal invariant that the container engine relies on was
    /// violated (e.g. a sub-2-byte gap between Segment children). Unlike the
    /// other variants, recovery from this one is not guaranteed to leave a
    /// usable file; see `SPEC_FULL.md` §5 "Partial-failure semantics".
    #[fail(display = "invariant violation: {}", _0)]
    Invariant(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Shorthand for constructing a [`Error::Precondition`].
pub fn precondition<S: Into<String>>(msg: S) -> failure::Error {
    Error::Precondition(msg.into()).into()
}

/// Shorthand for constructing a [`Error::Format`].
pub fn format_error<S: Into<String>>(msg: S) -> failure::Error {
    Error::Format(msg.into()).into()
}

/// Shorthand for constructing a [`Error::UnsupportedCodec`].
pub fn unsupported_codec<S: Into<String>>(msg: S) -> failure::Error {
    Error::UnsupportedCodec(msg.into()).into()
}

/// Shorthand for constructing a [`Error::Invariant`].
pub fn invariant<S: Into<String>>(msg: S) -> failure::Error {
    Error::Invariant(msg.into()).into()
}

/// Wraps a raw I/O error as a [`failure::Error`], for use with
/// `.map_err(from_io)`.
pub fn from_io(e: std::io::Error) -> failure::Error {
    Error::from(e).into()
}
