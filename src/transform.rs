//! Rewrite stages that work on the whole body of a response.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, header};
use n0_error::AnyError;
use tracing::trace;

use crate::{
    response::{BodyWriter, ResponseHead},
    rewrite::{BodyRewrite, RequestStub, Rewrite},
};

type TransformFn = dyn Fn(Bytes, &mut ResponseHead) -> Result<Bytes, AnyError> + Send + Sync;

fn concat(chunks: &mut Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.remove(0),
        _ => {
            let len = chunks.iter().map(Bytes::len).sum();
            let mut body = BytesMut::with_capacity(len);
            for chunk in chunks.drain(..) {
                body.extend_from_slice(&chunk);
            }
            body.freeze()
        }
    }
}

/// Holds back all body writes and emits them as one piece on end.
#[derive(Debug, Default)]
pub struct BufferBody {
    chunks: Vec<Bytes>,
}

impl BodyRewrite for BufferBody {
    fn write(&mut self, _res: &mut BodyWriter<'_>, chunk: Bytes) -> Result<(), AnyError> {
        self.chunks.push(chunk);
        Ok(())
    }

    fn end(&mut self, res: &mut BodyWriter<'_>) -> Result<(), AnyError> {
        if self.chunks.is_empty() {
            res.end(None);
        } else {
            res.end(Some(concat(&mut self.chunks)));
        }
        Ok(())
    }
}

/// Stage that buffers each response body and sends it in one piece.
///
/// A response without declared framing then goes out with a `Content-Length`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferedResponse;

impl Rewrite for BufferedResponse {
    async fn rewrite<'a>(
        &'a self,
        _req: &'a RequestStub,
        res: &'a mut ResponseHead,
    ) -> Result<(), AnyError> {
        res.set_body_rewrite(BufferBody::default());
        Ok(())
    }
}

struct TransformBody {
    f: Arc<TransformFn>,
    chunks: Vec<Bytes>,
}

impl BodyRewrite for TransformBody {
    fn write(&mut self, _res: &mut BodyWriter<'_>, chunk: Bytes) -> Result<(), AnyError> {
        self.chunks.push(chunk);
        Ok(())
    }

    fn end(&mut self, res: &mut BodyWriter<'_>) -> Result<(), AnyError> {
        if self.chunks.is_empty() {
            res.end(None);
            return Ok(());
        }
        let body = concat(&mut self.chunks);
        let head = res.head_mut()?;
        head.headers.remove(header::CONTENT_LENGTH.as_str());
        if head
            .headers
            .has_token(header::TRANSFER_ENCODING.as_str(), "chunked")
        {
            head.headers.remove(header::TRANSFER_ENCODING.as_str());
        }
        let len_in = body.len();
        let body = (self.f)(body, head)?;
        trace!(len_in, len_out = body.len(), "body transformed");
        head.headers
            .set("Content-Length", HeaderValue::from(body.len()));
        res.end(Some(body));
        Ok(())
    }
}

/// Stage that buffers each body and replaces it with the result of a function.
///
/// The function also gets the head and may change it. The outgoing
/// `Content-Length` always matches the transformed body. Responses without a
/// body are passed on without calling the function.
#[derive(derive_more::Debug, Clone)]
pub struct TransformResponse {
    #[debug("Arc<dyn Fn>")]
    f: Arc<TransformFn>,
}

impl TransformResponse {
    pub fn new(
        f: impl Fn(Bytes, &mut ResponseHead) -> Result<Bytes, AnyError> + Send + Sync + 'static,
    ) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl Rewrite for TransformResponse {
    async fn rewrite<'a>(
        &'a self,
        _req: &'a RequestStub,
        res: &'a mut ResponseHead,
    ) -> Result<(), AnyError> {
        res.set_body_rewrite(TransformBody {
            f: self.f.clone(),
            chunks: Vec::new(),
        });
        Ok(())
    }
}
