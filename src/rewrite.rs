use std::{fmt, future::Future};

use bytes::Bytes;
use dynosaur::dynosaur;
use http::HeaderMap;
use n0_error::AnyError;

use crate::response::{BodyWriter, ResponseHead};

#[dynosaur(pub(crate) DynRewrite = dyn(box) Rewrite)]
/// Rewrites response heads as they pass through an [`HttpStream`](crate::HttpStream).
///
/// The stage runs once per response, after the header section was parsed and
/// before anything of that response is written. Until the returned future
/// completes, body input for the response is queued. Returning an error
/// replaces the response with a `500 Internal Server Error`.
///
/// To change the body, install a [`BodyRewrite`] with
/// [`ResponseHead::set_body_rewrite`].
pub trait Rewrite: Send + Sync {
    fn rewrite<'a>(
        &'a self,
        req: &'a RequestStub,
        res: &'a mut ResponseHead,
    ) -> impl Future<Output = Result<(), AnyError>> + Send + 'a;
}

/// Intercepts the body writes and the end of one response.
///
/// Receives body input with transfer framing removed. Whatever it passes to
/// [`BodyWriter::write`] and [`BodyWriter::end`] is serialized with framing
/// derived from the final head. An error replaces the response with a
/// `500 Internal Server Error` as long as the header section was not sent.
pub trait BodyRewrite: Send {
    fn write(&mut self, res: &mut BodyWriter<'_>, chunk: Bytes) -> Result<(), AnyError>;

    /// Called once when the input message is complete.
    ///
    /// The response is ended afterwards if this did not end it.
    fn end(&mut self, res: &mut BodyWriter<'_>) -> Result<(), AnyError>;
}

/// Request placeholder handed to rewrite stages.
///
/// The stream only sees responses, so this carries defaults.
#[derive(Debug, Clone)]
pub struct RequestStub {
    pub path: String,
    pub headers: HeaderMap,
}

impl Default for RequestStub {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            headers: HeaderMap::new(),
        }
    }
}

impl RequestStub {
    /// Accepts an event listener. The request never emits events, so it is dropped.
    pub fn on(&self, _event: &str, _listener: impl FnOnce() + Send + 'static) {}
}

/// Stage that leaves every response unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Rewrite for Passthrough {
    async fn rewrite<'a>(
        &'a self,
        _req: &'a RequestStub,
        _res: &'a mut ResponseHead,
    ) -> Result<(), AnyError> {
        Ok(())
    }
}

/// Stage backed by a synchronous closure, see [`rewrite_fn`].
#[derive(Clone)]
pub struct FnRewrite<F>(F);

impl<F> fmt::Debug for FnRewrite<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRewrite").finish_non_exhaustive()
    }
}

/// Creates a rewrite stage from a closure that edits the head in place.
pub fn rewrite_fn<F>(f: F) -> FnRewrite<F>
where
    F: Fn(&RequestStub, &mut ResponseHead) -> Result<(), AnyError> + Send + Sync,
{
    FnRewrite(f)
}

impl<F> Rewrite for FnRewrite<F>
where
    F: Fn(&RequestStub, &mut ResponseHead) -> Result<(), AnyError> + Send + Sync,
{
    async fn rewrite<'a>(
        &'a self,
        req: &'a RequestStub,
        res: &'a mut ResponseHead,
    ) -> Result<(), AnyError> {
        (self.0)(req, res)
    }
}
