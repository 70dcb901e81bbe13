//! Incremental HTTP/1.x response parser.
//!
//! [`ResponseParser`] buffers input and turns it into a sequence of
//! [`ParseEvent`]s. It stops at every message boundary: after
//! [`ParseEvent::MessageComplete`] the parser sits in
//! [`ParserState::MessageComplete`] and interprets nothing further until
//! [`ResponseParser::reinitialize`] is called. Bytes of the next pipelined
//! message stay buffered in the meantime.

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderValue, StatusCode, Version, header};
use n0_error::e;
use tracing::trace;

use crate::{error::ParseError, headers::Headers, response::ResponseHead};

/// Maximum number of header lines in a response head.
const MAX_HEADERS: usize = 128;

/// Something the parser recognized in the input.
#[derive(Debug)]
pub enum ParseEvent {
    /// Status line and all header lines were read.
    HeadersComplete(ResponseHead),
    /// A chunk size line of a chunked body was read; its data follows as [`Self::Body`].
    ChunkStart(u64),
    /// A contiguous span of body bytes, with transfer framing removed.
    Body(Bytes),
    /// The message, including any chunked terminator, was fully consumed.
    MessageComplete,
}

/// Position of the parser inside a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Expecting a chunk size line.
    Size,
    /// Inside chunk data.
    Data { remaining: u64 },
    /// Expecting the CRLF after chunk data.
    DataEnd,
    /// After the last chunk, skipping trailer lines up to the empty line.
    Trailers,
}

/// Phase of the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for a complete status line and header section.
    Headers,
    /// Reading a body framed by `Content-Length`.
    BodySized { remaining: u64 },
    /// Reading a chunked body.
    BodyChunked(ChunkState),
    /// Reading a close-delimited body until the end of input.
    BodyRaw,
    /// A message ended; needs [`ResponseParser::reinitialize`] before the next one.
    MessageComplete,
    /// Input ended on a message boundary.
    Closed,
}

/// How the body of a message is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Length(u64),
    Chunked,
    Close,
}

impl Framing {
    /// Determines the incoming body framing from a response head.
    pub(crate) fn of(status: StatusCode, headers: &Headers) -> Result<Self, ParseError> {
        if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Framing::Length(0));
        }
        let chunked = headers.has_token(header::TRANSFER_ENCODING.as_str(), "chunked");
        let length = content_length(headers)?;
        match (chunked, length) {
            (true, Some(_)) => Err(e!(ParseError::ConflictingFraming)),
            (true, None) => Ok(Framing::Chunked),
            (false, Some(length)) => Ok(Framing::Length(length)),
            (false, None) => Ok(Framing::Close),
        }
    }
}

/// Returns the declared `Content-Length`, requiring all occurrences to agree.
pub(crate) fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH.as_str()) {
        let value = value
            .to_str()
            .map_err(|_| e!(ParseError::InvalidContentLength))?;
        for element in value.split(',') {
            let parsed = element
                .trim()
                .parse::<u64>()
                .map_err(|_| e!(ParseError::InvalidContentLength))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(e!(ParseError::InvalidContentLength));
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

impl ResponseHead {
    /// Parses a response head from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the head section and the head.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .map_err(|source| e!(ParseError::HeadSection { source }))?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let code = res.code.unwrap_or_default();
                let status =
                    StatusCode::from_u16(code).map_err(|_| e!(ParseError::InvalidStatus { code }))?;
                let version = match res.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let reason = res.reason.map(ToOwned::to_owned);
                let headers = Headers::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((h.name, value))
                }));
                let mut head = ResponseHead::new(status, headers);
                head.version = version;
                head.reason = reason;
                Ok(Some((head_len, head)))
            }
        }
    }
}

/// Incremental, reinitializable HTTP/1.x response parser.
#[derive(Debug)]
pub struct ResponseParser {
    buf: BytesMut,
    state: ParserState,
    max_head_len: usize,
}

impl ResponseParser {
    /// Creates a parser that is ready to read a response head.
    ///
    /// `max_head_len` bounds how many bytes may be buffered while waiting for
    /// a complete head section, chunk size line or trailer line.
    pub fn new(max_head_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: ParserState::Headers,
            max_head_len,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Number of received bytes not yet turned into events.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends input. Call [`Self::next_event`] to interpret it.
    pub fn push(&mut self, input: &[u8]) {
        self.buf.extend_from_slice(input);
    }

    /// Re-arms the parser for the next message after [`ParserState::MessageComplete`].
    ///
    /// Returns the number of bytes already buffered for the next message.
    pub fn reinitialize(&mut self) -> usize {
        debug_assert_eq!(self.state, ParserState::MessageComplete);
        self.state = ParserState::Headers;
        self.buf.len()
    }

    /// Returns the next event, or `None` if more input is needed or a message just ended.
    pub fn next_event(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        loop {
            match self.state {
                ParserState::Headers => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let Some((head_len, head)) = ResponseHead::parse_with_len(&self.buf)? else {
                        self.check_limit()?;
                        return Ok(None);
                    };
                    if head_len > self.max_head_len {
                        return Err(e!(ParseError::HeadTooLarge {
                            limit: self.max_head_len
                        }));
                    }
                    self.buf.advance(head_len);
                    self.state = match Framing::of(head.status, &head.headers)? {
                        Framing::Length(remaining) => ParserState::BodySized { remaining },
                        Framing::Chunked => ParserState::BodyChunked(ChunkState::Size),
                        Framing::Close => ParserState::BodyRaw,
                    };
                    trace!(head_len, state = ?self.state, "parsed head section");
                    return Ok(Some(ParseEvent::HeadersComplete(head)));
                }
                ParserState::BodySized { remaining } => {
                    if remaining == 0 {
                        self.state = ParserState::MessageComplete;
                        return Ok(Some(ParseEvent::MessageComplete));
                    }
                    let Some(data) = self.take_data(remaining) else {
                        return Ok(None);
                    };
                    self.state = ParserState::BodySized {
                        remaining: remaining - data.len() as u64,
                    };
                    return Ok(Some(ParseEvent::Body(data)));
                }
                ParserState::BodyRaw => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let data = self.buf.split().freeze();
                    return Ok(Some(ParseEvent::Body(data)));
                }
                ParserState::BodyChunked(ChunkState::Size) => {
                    match httparse::parse_chunk_size(&self.buf)
                        .map_err(|_| e!(ParseError::InvalidChunkSize))?
                    {
                        httparse::Status::Partial => {
                            self.check_limit()?;
                            return Ok(None);
                        }
                        httparse::Status::Complete((line_len, 0)) => {
                            self.buf.advance(line_len);
                            self.state = ParserState::BodyChunked(ChunkState::Trailers);
                        }
                        httparse::Status::Complete((line_len, size)) => {
                            self.buf.advance(line_len);
                            self.state =
                                ParserState::BodyChunked(ChunkState::Data { remaining: size });
                            return Ok(Some(ParseEvent::ChunkStart(size)));
                        }
                    }
                }
                ParserState::BodyChunked(ChunkState::Data { remaining }) => {
                    let Some(data) = self.take_data(remaining) else {
                        return Ok(None);
                    };
                    let remaining = remaining - data.len() as u64;
                    self.state = if remaining == 0 {
                        ParserState::BodyChunked(ChunkState::DataEnd)
                    } else {
                        ParserState::BodyChunked(ChunkState::Data { remaining })
                    };
                    return Ok(Some(ParseEvent::Body(data)));
                }
                ParserState::BodyChunked(ChunkState::DataEnd) => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(e!(ParseError::InvalidChunkTerminator));
                    }
                    self.buf.advance(2);
                    self.state = ParserState::BodyChunked(ChunkState::Size);
                }
                ParserState::BodyChunked(ChunkState::Trailers) => {
                    let Some(line_end) = self.buf.windows(2).position(|w| w == b"\r\n") else {
                        self.check_limit()?;
                        return Ok(None);
                    };
                    // Trailer fields are consumed but not forwarded.
                    self.buf.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = ParserState::MessageComplete;
                        return Ok(Some(ParseEvent::MessageComplete));
                    }
                }
                ParserState::MessageComplete | ParserState::Closed => return Ok(None),
            }
        }
    }

    /// Signals the end of input.
    ///
    /// Completes a close-delimited body. Ending anywhere else inside a
    /// message is an error.
    pub fn finish(&mut self) -> Result<Option<ParseEvent>, ParseError> {
        match self.state {
            ParserState::Headers if self.buf.is_empty() => {
                self.state = ParserState::Closed;
                Ok(None)
            }
            ParserState::BodyRaw if self.buf.is_empty() => {
                self.state = ParserState::MessageComplete;
                Ok(Some(ParseEvent::MessageComplete))
            }
            ParserState::MessageComplete | ParserState::Closed => Ok(None),
            _ => Err(e!(ParseError::UnexpectedEof)),
        }
    }

    fn take_data(&mut self, remaining: u64) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }
        let n = remaining.min(self.buf.len() as u64) as usize;
        Some(self.buf.split_to(n).freeze())
    }

    fn check_limit(&self) -> Result<(), ParseError> {
        if self.buf.len() > self.max_head_len {
            Err(e!(ParseError::HeadTooLarge {
                limit: self.max_head_len
            }))
        } else {
            Ok(())
        }
    }
}
