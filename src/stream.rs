//! Pipelined response stream: parse, rewrite, re-serialize.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker, ready},
};

use bytes::{Bytes, BytesMut};
use n0_error::{AnyError, e};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    diagnostics::Diagnostics,
    error::StreamError,
    parse::{ParseEvent, ParserState, ResponseParser},
    recovery,
    response::{Lifecycle, Response, ResponseHead},
    rewrite::{DynRewrite, RequestStub, Rewrite},
    util::forward_responses,
};

type PendingRewrite = Pin<Box<dyn Future<Output = (ResponseHead, Result<(), AnyError>)> + Send>>;

/// Configuration for an [`HttpStream`].
#[derive(Debug, Clone)]
pub struct StreamOpts {
    /// Append the diagnostic output of a failed rewrite to the error body.
    pub capture_diagnostics: bool,
    /// Upper bound for a buffered head section, chunk size line or trailer line.
    pub max_header_section: usize,
    /// Read buffer size used by [`HttpStream::forward`].
    pub read_chunk_size: usize,
    /// Input [`HttpStream::forward`] buffers while a rewrite is pending before
    /// it stops reading.
    pub max_pending_input: usize,
}

impl Default for StreamOpts {
    fn default() -> Self {
        Self {
            capture_diagnostics: false,
            max_header_section: HEADER_SECTION_MAX_LENGTH,
            read_chunk_size: 8 * 1024,
            max_pending_input: 256 * 1024,
        }
    }
}

impl StreamOpts {
    pub fn capture_diagnostics(mut self, capture: bool) -> Self {
        self.capture_diagnostics = capture;
        self
    }

    pub fn max_header_section(mut self, len: usize) -> Self {
        self.max_header_section = len;
        self
    }

    pub fn read_chunk_size(mut self, len: usize) -> Self {
        self.read_chunk_size = len.max(1);
        self
    }

    pub fn max_pending_input(mut self, len: usize) -> Self {
        self.max_pending_input = len;
        self
    }
}

/// Transforms a byte stream of pipelined HTTP/1.x responses.
///
/// Input is pushed in arbitrary pieces with [`Self::push`]. Every parsed
/// response head goes through the configured [`Rewrite`] stage, and the
/// result is serialized again, in input order, into an output buffer drained
/// with [`Self::take_output`].
///
/// A stage that does not complete right away suspends the stream: body input
/// is queued and further input is buffered without being interpreted until
/// [`Self::poll_rewrite`] sees the stage complete. A failing stage gets its
/// response replaced by a `500 Internal Server Error`, and the stream goes on
/// with the next message.
#[derive(derive_more::Debug)]
pub struct HttpStream {
    parser: ResponseParser,
    #[debug("{:?}", rewrite.as_ref().map(|_| "DynRewrite"))]
    rewrite: Option<Arc<DynRewrite<'static>>>,
    opts: StreamOpts,
    current: Option<Response>,
    #[debug("{:?}", pending.as_ref().map(|_| "PendingRewrite"))]
    pending: Option<PendingRewrite>,
    input_closed: bool,
    out: BytesMut,
    messages: u64,
}

impl Default for HttpStream {
    fn default() -> Self {
        Self::new(StreamOpts::default())
    }
}

impl HttpStream {
    /// Creates a stream that re-serializes responses unchanged.
    pub fn new(opts: StreamOpts) -> Self {
        Self {
            parser: ResponseParser::new(opts.max_header_section),
            rewrite: None,
            opts,
            current: None,
            pending: None,
            input_closed: false,
            out: BytesMut::new(),
            messages: 0,
        }
    }

    /// Creates a stream that passes every response head through `rewrite`.
    pub fn with_rewrite(rewrite: impl Rewrite + 'static, opts: StreamOpts) -> Self {
        let mut stream = Self::new(opts);
        stream.rewrite = Some(DynRewrite::new_arc(rewrite));
        stream
    }

    pub fn opts(&self) -> &StreamOpts {
        &self.opts
    }

    /// Number of response heads parsed so far.
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Lifecycle of the response currently in flight, if any.
    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.current.as_ref().map(Response::lifecycle)
    }

    /// True while a rewrite stage has not completed.
    ///
    /// Input pushed meanwhile is buffered but not interpreted.
    pub fn is_rewrite_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Input bytes held back: unparsed input plus body queued behind a pending rewrite.
    pub fn buffered(&self) -> usize {
        self.parser.buffered() + self.current.as_ref().map_or(0, Response::queued_bytes)
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Takes all serialized output produced so far.
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    /// True once input was closed on a message boundary and all output was produced.
    pub fn is_done(&self) -> bool {
        self.input_closed
            && self.current.is_none()
            && self.pending.is_none()
            && self.parser.state() == ParserState::Closed
    }

    /// Feeds input bytes.
    pub fn push(&mut self, input: &[u8]) -> Result<(), StreamError> {
        debug_assert!(!self.input_closed, "push after finish");
        self.parser.push(input);
        self.process()
    }

    /// Signals the end of input.
    ///
    /// Completes a close-delimited body. Fails if input ends inside any other
    /// message. If a rewrite is still pending, the check happens once it
    /// completes.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        self.input_closed = true;
        self.process()?;
        self.check_closed()
    }

    /// Drives a pending rewrite stage.
    ///
    /// Resolves immediately if nothing is pending. Once the stage completes,
    /// its response is started and buffered input is processed, which may
    /// suspend the stream again on the next message.
    pub fn poll_rewrite(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        let Some(fut) = self.pending.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let (head, result) = ready!(fut.as_mut().poll(cx));
        self.pending = None;
        trace!(message = self.messages, ok = result.is_ok(), "rewrite completed");
        Poll::Ready(
            self.complete_rewrite(head, result)
                .and_then(|()| self.process())
                .and_then(|()| self.check_closed()),
        )
    }

    /// Waits for the pending rewrite, if any, to complete.
    ///
    /// The stream may be suspended again afterwards on the next buffered message.
    pub async fn settle(&mut self) -> Result<(), StreamError> {
        std::future::poll_fn(|cx| self.poll_rewrite(cx)).await
    }

    /// Reads responses from `recv` until EOF and writes the transformed stream to `send`.
    ///
    /// Returns the number of bytes read and written.
    pub async fn forward(
        &mut self,
        recv: &mut (impl AsyncRead + Unpin),
        send: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(u64, u64), StreamError> {
        forward_responses(self, recv, send).await
    }

    fn process(&mut self) -> Result<(), StreamError> {
        loop {
            if self.parser.state() == ParserState::MessageComplete {
                if self.current.is_some() {
                    // Next message stays buffered until this one is written.
                    return Ok(());
                }
                let buffered = self.parser.reinitialize();
                trace!(buffered, "parser reinitialized");
            }
            let event = match self.parser.next_event()? {
                Some(event) => event,
                None if self.input_closed => match self.parser.finish()? {
                    Some(event) => event,
                    None => return Ok(()),
                },
                None => return Ok(()),
            };
            self.dispatch(event)?;
        }
    }

    fn check_closed(&self) -> Result<(), StreamError> {
        if self.input_closed && self.pending.is_none() && self.current.is_some() {
            return Err(e!(StreamError::Incomplete));
        }
        Ok(())
    }

    fn dispatch(&mut self, event: ParseEvent) -> Result<(), StreamError> {
        match event {
            ParseEvent::HeadersComplete(head) => self.on_headers_complete(head),
            ParseEvent::ChunkStart(size) => {
                if let Some(res) = self.current.as_mut() {
                    res.deliver_chunk_start(size);
                }
                self.drain_current();
                Ok(())
            }
            ParseEvent::Body(data) => {
                let result = match self.current.as_mut() {
                    Some(res) => res.deliver_body(data),
                    None => Ok(()),
                };
                self.settle_result(result)
            }
            ParseEvent::MessageComplete => {
                let result = match self.current.as_mut() {
                    Some(res) => res.deliver_end(),
                    None => Ok(()),
                };
                self.settle_result(result)
            }
        }
    }

    fn on_headers_complete(&mut self, head: ResponseHead) -> Result<(), StreamError> {
        self.messages += 1;
        debug!(
            message = self.messages,
            status = %head.status,
            headers = head.headers.len(),
            "headers complete"
        );
        self.current = Some(Response::pending());
        let Some(rewrite) = self.rewrite.clone() else {
            return self.complete_rewrite(head, Ok(()));
        };
        let mut fut: PendingRewrite = Box::pin(async move {
            let req = RequestStub::default();
            let mut head = head;
            let result = rewrite.rewrite(&req, &mut head).await;
            (head, result)
        });
        match fut.as_mut().poll(&mut Context::from_waker(Waker::noop())) {
            Poll::Ready((head, result)) => self.complete_rewrite(head, result),
            Poll::Pending => {
                debug!(message = self.messages, "rewrite pending, queueing body");
                self.pending = Some(fut);
                Ok(())
            }
        }
    }

    fn complete_rewrite(
        &mut self,
        head: ResponseHead,
        result: Result<(), AnyError>,
    ) -> Result<(), StreamError> {
        let Some(res) = self.current.as_mut() else {
            return Ok(());
        };
        match result {
            Ok(()) => {
                let result = res.start(head);
                self.settle_result(result)
            }
            Err(err) => self.recover(err, Some(head.into_diagnostics())),
        }
    }

    fn settle_result(&mut self, result: Result<(), AnyError>) -> Result<(), StreamError> {
        match result {
            Ok(()) => {
                self.drain_current();
                Ok(())
            }
            Err(err) => {
                let diagnostics = self.current.as_mut().and_then(Response::take_diagnostics);
                self.recover(err, diagnostics)
            }
        }
    }

    /// Moves output of the current response and retires it once finished.
    fn drain_current(&mut self) {
        let Some(res) = self.current.as_mut() else {
            return;
        };
        self.out.extend_from_slice(&res.take_output());
        if res.is_finished() {
            trace!(message = self.messages, "response finished");
            self.current = None;
        }
    }

    fn recover(
        &mut self,
        err: AnyError,
        diagnostics: Option<Diagnostics>,
    ) -> Result<(), StreamError> {
        let Some(res) = self.current.as_mut() else {
            return Err(e!(StreamError::HeadersSent, err));
        };
        if res.headers_sent() {
            // Bytes of this response are already out; there is nothing left to repair.
            self.out.extend_from_slice(&res.take_output());
            return Err(e!(StreamError::HeadersSent, err));
        }
        warn!(
            message = self.messages,
            "rewrite failed, sending error response: {err:#}"
        );
        res.mark_erred();
        let diagnostics = diagnostics.filter(|_| self.opts.capture_diagnostics);
        self.out
            .extend_from_slice(&recovery::error_response(&err, diagnostics.as_ref()));
        self.drain_current();
        Ok(())
    }
}
