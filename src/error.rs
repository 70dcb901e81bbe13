use n0_error::{AnyError, stack_error};
use std::io;

/// Errors raised while interpreting the incoming byte stream as HTTP/1.x responses.
///
/// All of these are fatal for the connection: no resynchronization is attempted.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ParseError {
    /// The status line or header section is not valid HTTP/1.x
    #[error("invalid response head section")]
    HeadSection {
        #[error(source, std_err)]
        source: httparse::Error,
    },

    /// The buffered head section or chunk size line grew beyond the limit
    #[error("head section exceeds {limit} bytes")]
    HeadTooLarge {
        /// The configured limit
        limit: usize,
    },

    /// The status code is outside of 100..=999
    #[error("invalid status code {code}")]
    InvalidStatus {
        /// The status code found on the wire
        code: u16,
    },

    /// A `Content-Length` value is not a number, or several disagree
    #[error("invalid Content-Length header")]
    InvalidContentLength,

    /// Both `Transfer-Encoding: chunked` and `Content-Length` are present
    #[error("conflicting Transfer-Encoding and Content-Length")]
    ConflictingFraming,

    /// A chunk size line could not be parsed
    #[error("invalid chunk size line")]
    InvalidChunkSize,

    /// Chunk data was not followed by CRLF
    #[error("invalid chunk terminator")]
    InvalidChunkTerminator,

    /// Input ended before the current message was complete
    #[error("input ended in the middle of a message")]
    UnexpectedEof,
}

/// Connection-level errors surfaced by [`HttpStream`](crate::HttpStream).
///
/// Per-message rewrite failures never show up here while they can still be
/// repaired; they are replaced by a synthesized error response instead.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum StreamError {
    /// The input could not be parsed
    #[error("malformed response stream")]
    Malformed { source: ParseError },

    /// A rewrite failed after the header section was already emitted
    #[error("rewrite failed after headers were sent")]
    HeadersSent { source: AnyError },

    /// Input was closed while a message was still in flight
    #[error("input closed with an incomplete message")]
    Incomplete,

    /// IO error while reading input or writing output
    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl From<ParseError> for StreamError {
    #[track_caller]
    fn from(source: ParseError) -> Self {
        n0_error::e!(StreamError::Malformed, source)
    }
}

impl From<io::Error> for StreamError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        n0_error::e!(StreamError::Io { source })
    }
}
