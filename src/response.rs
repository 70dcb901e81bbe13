use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderValue, StatusCode, Version, header};
use n0_error::{AnyError, StackResultExt, anyerr};
use tracing::{debug, trace, warn};

use crate::{diagnostics::Diagnostics, headers::Headers, parse, rewrite::BodyRewrite};

/// Status line and headers of one response, as seen and mutated by a rewrite stage.
#[derive(derive_more::Debug)]
pub struct ResponseHead {
    /// Protocol version of the status line.
    pub version: Version,
    /// Status code from the status line.
    pub status: StatusCode,
    /// Reason phrase as received, if any.
    pub reason: Option<String>,
    /// Header lines in serialization order.
    pub headers: Headers,
    diagnostics: Diagnostics,
    #[debug("{:?}", body_rewrite.as_ref().map(|_| "dyn BodyRewrite"))]
    body_rewrite: Option<Box<dyn BodyRewrite>>,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: Headers) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers,
            diagnostics: Diagnostics::default(),
            body_rewrite: None,
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn set_reason(&mut self, reason: impl ToString) {
        self.reason = Some(reason.to_string());
    }

    /// Diagnostic sinks scoped to this message.
    pub fn diagnostics(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Routes the body of this message through `rewrite`.
    ///
    /// Replaces any previously installed body rewrite.
    pub fn set_body_rewrite(&mut self, rewrite: impl BodyRewrite + 'static) {
        self.body_rewrite = Some(Box::new(rewrite));
    }

    pub(crate) fn into_diagnostics(self) -> Diagnostics {
        self.diagnostics
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!(
            "{:?} {} {}\r\n",
            self.version,
            self.status.as_u16(),
            self.reason()
        )
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(self.status_line().as_bytes());
        self.headers.write_to(buf);
        buf.put_slice(b"\r\n");
    }

    /// Decides how the body is framed on the way out.
    ///
    /// Adds a `Content-Length` or `Transfer-Encoding: chunked` header when the
    /// head declares no framing on a persistent connection.
    fn output_framing(&mut self, known_len: Option<usize>) -> OutFraming {
        if self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return OutFraming::Empty;
        }
        if let Ok(Some(length)) = parse::content_length(&self.headers) {
            return OutFraming::Length(length);
        }
        if self
            .headers
            .has_token(header::TRANSFER_ENCODING.as_str(), "chunked")
        {
            return OutFraming::Chunked;
        }
        if self.headers.has_token(header::CONNECTION.as_str(), "close")
            || self.headers.contains(header::TRANSFER_ENCODING.as_str())
            || self.headers.contains(header::CONTENT_LENGTH.as_str())
            || self.version == Version::HTTP_10
        {
            return OutFraming::Raw;
        }
        match known_len {
            Some(len) => {
                self.headers.set("Content-Length", HeaderValue::from(len));
                OutFraming::Length(len as u64)
            }
            None => {
                self.headers
                    .set("Transfer-Encoding", HeaderValue::from_static("chunked"));
                OutFraming::Chunked
            }
        }
    }
}

/// Outgoing body framing, fixed when the header section is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutFraming {
    /// The status forbids a body.
    Empty,
    /// Body bytes as-is, delimited by a declared length.
    Length(u64),
    /// Each write becomes one chunk.
    Chunked,
    /// Body bytes as-is, delimited by the end of the stream.
    Raw,
}

/// Body input held back while the head is pending.
#[derive(Debug)]
enum Queued {
    Data(Bytes),
    ChunkStart(u64),
}

/// Lifecycle of an in-flight response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// The rewrite stage has not finalized the head yet; body input is queued.
    Pending,
    /// The head is final; body input is written through.
    Started,
    /// The message was fully serialized.
    Ended,
}

/// One outgoing response, from its parsed head to its last body byte.
///
/// While [`Lifecycle::Pending`] the head is lent to the rewrite stage and body
/// input is queued. [`Response::start`] installs the final head and replays
/// the queue in order. Once erred, every write and end is a no-op.
#[derive(derive_more::Debug)]
pub(crate) struct Response {
    head: Option<ResponseHead>,
    #[debug("{:?}", body_rewrite.as_ref().map(|_| "dyn BodyRewrite"))]
    body_rewrite: Option<Box<dyn BodyRewrite>>,
    lifecycle: Lifecycle,
    queue: VecDeque<Queued>,
    queued_bytes: usize,
    queued_end: bool,
    input_ended: bool,
    erred: bool,
    framing: Option<OutFraming>,
    /// Bytes left in an input chunk that is passed through with its wire size.
    wire_chunk: u64,
    body_len: u64,
    out: BytesMut,
}

impl Response {
    pub(crate) fn pending() -> Self {
        Self {
            head: None,
            body_rewrite: None,
            lifecycle: Lifecycle::Pending,
            queue: VecDeque::new(),
            queued_bytes: 0,
            queued_end: false,
            input_ended: false,
            erred: false,
            framing: None,
            wire_chunk: 0,
            body_len: 0,
            out: BytesMut::new(),
        }
    }

    /// Creates a response whose head is already final.
    pub(crate) fn started(head: ResponseHead) -> Self {
        let mut res = Self::pending();
        res.install(head);
        res
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub(crate) fn headers_sent(&self) -> bool {
        self.framing.is_some()
    }

    /// Body bytes queued while pending.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// True once nothing more will be written for this message.
    pub(crate) fn is_finished(&self) -> bool {
        self.lifecycle == Lifecycle::Ended || (self.erred && self.input_ended)
    }

    fn install(&mut self, mut head: ResponseHead) {
        self.body_rewrite = head.body_rewrite.take();
        self.head = Some(head);
        self.lifecycle = Lifecycle::Started;
    }

    /// Freezes the head and flushes everything queued while pending.
    pub(crate) fn start(&mut self, head: ResponseHead) -> Result<(), AnyError> {
        debug_assert_eq!(self.lifecycle, Lifecycle::Pending);
        self.install(head);
        trace!(
            queued = self.queue.len(),
            queued_end = self.queued_end,
            "response started"
        );
        while let Some(queued) = self.queue.pop_front() {
            match queued {
                Queued::Data(chunk) => {
                    self.queued_bytes -= chunk.len();
                    self.deliver_body(chunk)?;
                }
                Queued::ChunkStart(size) => self.deliver_chunk_start(size),
            }
        }
        if std::mem::take(&mut self.queued_end) {
            self.deliver_end()?;
        }
        Ok(())
    }

    /// Hands a span of input body bytes to the response.
    pub(crate) fn deliver_body(&mut self, chunk: Bytes) -> Result<(), AnyError> {
        if self.erred {
            return Ok(());
        }
        match self.lifecycle {
            Lifecycle::Pending => {
                self.queued_bytes += chunk.len();
                self.queue.push_back(Queued::Data(chunk));
                Ok(())
            }
            Lifecycle::Started => match self.body_rewrite.take() {
                Some(mut rewrite) => {
                    let result = rewrite.write(&mut BodyWriter { res: &mut *self }, chunk);
                    self.body_rewrite = Some(rewrite);
                    result
                }
                None => {
                    self.write(chunk);
                    Ok(())
                }
            },
            Lifecycle::Ended => {
                warn!(len = chunk.len(), "dropping body bytes after end of response");
                Ok(())
            }
        }
    }

    /// Announces an input chunk of `size` bytes.
    ///
    /// Without a body rewrite, the chunk keeps its wire size on the way out
    /// when the output is chunked too, so split input still serializes to the
    /// original chunk boundaries.
    pub(crate) fn deliver_chunk_start(&mut self, size: u64) {
        if self.erred || size == 0 {
            return;
        }
        match self.lifecycle {
            Lifecycle::Pending => self.queue.push_back(Queued::ChunkStart(size)),
            Lifecycle::Started if self.body_rewrite.is_none() => {
                let framing = match self.framing {
                    Some(framing) => framing,
                    None => self.send_head(None),
                };
                if framing == OutFraming::Chunked && self.wire_chunk == 0 {
                    self.out.put_slice(format!("{size:x}\r\n").as_bytes());
                    self.wire_chunk = size;
                }
            }
            Lifecycle::Started | Lifecycle::Ended => {}
        }
    }

    /// Signals that the input message is complete.
    pub(crate) fn deliver_end(&mut self) -> Result<(), AnyError> {
        self.input_ended = true;
        if self.erred {
            return Ok(());
        }
        match self.lifecycle {
            Lifecycle::Pending => {
                self.queued_end = true;
                Ok(())
            }
            Lifecycle::Started => {
                if let Some(mut rewrite) = self.body_rewrite.take() {
                    rewrite.end(&mut BodyWriter { res: &mut *self })?;
                }
                self.end(None);
                Ok(())
            }
            Lifecycle::Ended => Ok(()),
        }
    }

    /// Abandons this message. Later writes and ends do nothing.
    pub(crate) fn mark_erred(&mut self) {
        self.erred = true;
        self.queue.clear();
        self.queued_bytes = 0;
        self.queued_end = false;
        self.body_rewrite = None;
    }

    pub(crate) fn take_diagnostics(&mut self) -> Option<Diagnostics> {
        self.head
            .as_mut()
            .map(|head| std::mem::take(&mut head.diagnostics))
    }

    /// Takes the serialized bytes produced so far.
    pub(crate) fn take_output(&mut self) -> BytesMut {
        self.out.split()
    }

    fn send_head(&mut self, known_len: Option<usize>) -> OutFraming {
        let framing = match self.head.as_mut() {
            Some(head) => {
                let framing = head.output_framing(known_len);
                head.write_to(&mut self.out);
                framing
            }
            None => OutFraming::Raw,
        };
        trace!(?framing, "head section serialized");
        self.framing = Some(framing);
        framing
    }

    pub(crate) fn write(&mut self, chunk: Bytes) {
        if self.erred || self.lifecycle != Lifecycle::Started {
            return;
        }
        let framing = match self.framing {
            Some(framing) => framing,
            None => self.send_head(None),
        };
        if chunk.is_empty() {
            return;
        }
        self.body_len += chunk.len() as u64;
        match framing {
            OutFraming::Empty => {
                warn!(len = chunk.len(), "dropping body bytes of a bodiless status");
            }
            OutFraming::Length(_) | OutFraming::Raw => self.out.put_slice(&chunk),
            OutFraming::Chunked if self.wire_chunk >= chunk.len() as u64 => {
                self.out.put_slice(&chunk);
                self.wire_chunk -= chunk.len() as u64;
                if self.wire_chunk == 0 {
                    self.out.put_slice(b"\r\n");
                }
            }
            OutFraming::Chunked => {
                self.out
                    .put_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                self.out.put_slice(&chunk);
                self.out.put_slice(b"\r\n");
            }
        }
    }

    pub(crate) fn end(&mut self, last: Option<Bytes>) {
        if self.erred || self.lifecycle != Lifecycle::Started {
            return;
        }
        if self.framing.is_none() {
            self.send_head(Some(last.as_ref().map_or(0, Bytes::len)));
        }
        if let Some(last) = last {
            self.write(last);
        }
        match self.framing {
            Some(OutFraming::Chunked) => self.out.put_slice(b"0\r\n\r\n"),
            Some(OutFraming::Length(declared)) if declared != self.body_len => {
                warn!(
                    declared,
                    written = self.body_len,
                    "body length differs from Content-Length"
                );
            }
            _ => {}
        }
        self.lifecycle = Lifecycle::Ended;
        debug!(body_len = self.body_len, "response ended");
    }
}

/// Write access to a started response, handed to a [`BodyRewrite`].
pub struct BodyWriter<'a> {
    res: &'a mut Response,
}

impl BodyWriter<'_> {
    /// The final head of this response.
    pub fn head(&self) -> Option<&ResponseHead> {
        self.res.head.as_ref()
    }

    /// Mutable access to the head, available until the header section is sent.
    pub fn head_mut(&mut self) -> Result<&mut ResponseHead, AnyError> {
        if self.res.headers_sent() {
            return Err(anyerr!("headers already sent"));
        }
        self.res.head.as_mut().context("response has no head")
    }

    pub fn headers_sent(&self) -> bool {
        self.res.headers_sent()
    }

    /// Writes body bytes, sending the header section first if needed.
    pub fn write(&mut self, chunk: impl Into<Bytes>) {
        self.res.write(chunk.into())
    }

    /// Ends the message, optionally with a last piece of body.
    pub fn end(&mut self, last: Option<Bytes>) {
        self.res.end(last)
    }
}
