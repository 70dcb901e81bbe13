//! Parse, rewrite and re-serialize a byte stream of pipelined HTTP/1.x responses.
//!
//! [`HttpStream`] consumes the raw bytes of one connection in arbitrary
//! pieces, hands every response head to a [`Rewrite`] stage and writes the
//! possibly altered responses back out in their original order. Body framing
//! is recomputed from the final head, so a stage may change headers or
//! replace the body without corrupting the stream. A stage that fails is
//! contained: its response is replaced by a `500 Internal Server Error` and
//! the messages after it go through normally.

mod diagnostics;
mod error;
mod headers;
mod parse;
mod recovery;
mod response;
mod rewrite;
mod stream;
mod transform;
mod util;

#[cfg(test)]
mod tests;

pub use {
    diagnostics::{BufferIo, Diagnostics},
    error::{ParseError, StreamError},
    headers::Headers,
    parse::{ChunkState, ParseEvent, ParserState, ResponseParser},
    response::{BodyWriter, Lifecycle, ResponseHead},
    rewrite::{BodyRewrite, FnRewrite, Passthrough, RequestStub, Rewrite, rewrite_fn},
    stream::{HttpStream, StreamOpts},
    transform::{BufferBody, BufferedResponse, TransformResponse},
};

/// Default limit for a buffered head section.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 64 * 1024;
