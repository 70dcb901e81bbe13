use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{error::StreamError, stream::HttpStream};

/// Forwards responses from `recv` through `stream` into `send` until EOF.
///
/// Output is flushed before every read. While a rewrite is pending, input
/// keeps being read and buffered up to [`StreamOpts::max_pending_input`]
/// bytes, after which reading waits for the rewrite. Calls `shutdown` on
/// `send` once done.
///
/// [`StreamOpts::max_pending_input`]: crate::StreamOpts::max_pending_input
pub(crate) async fn forward_responses(
    stream: &mut HttpStream,
    recv: &mut (impl AsyncRead + Unpin),
    send: &mut (impl AsyncWrite + Unpin),
) -> Result<(u64, u64), StreamError> {
    let start = std::time::Instant::now();
    let mut buf = BytesMut::with_capacity(stream.opts().read_chunk_size);
    let mut read = 0u64;
    let mut written = 0u64;
    let mut eof = false;
    loop {
        if stream.has_output() {
            let out = stream.take_output();
            send.write_all(&out).await?;
            written += out.len() as u64;
            trace!(len = out.len(), "flushed output");
        }
        if eof {
            if stream.is_rewrite_pending() {
                stream.settle().await?;
                continue;
            }
            break;
        }
        buf.reserve(stream.opts().read_chunk_size);
        let n = if stream.is_rewrite_pending() {
            if stream.buffered() >= stream.opts().max_pending_input {
                trace!(buffered = stream.buffered(), "input limit reached, waiting for rewrite");
                stream.settle().await?;
                continue;
            }
            tokio::select! {
                res = stream.settle() => {
                    res?;
                    continue;
                }
                n = recv.read_buf(&mut buf) => n?,
            }
        } else {
            recv.read_buf(&mut buf).await?
        };
        if n == 0 {
            eof = true;
            trace!(read, elapsed = ?start.elapsed(), "input closed");
            stream.finish()?;
        } else {
            read += n as u64;
            stream.push(&buf)?;
            buf.clear();
        }
    }
    send.flush().await?;
    send.shutdown().await.ok();
    trace!(read, written, elapsed = ?start.elapsed(), "forward finished");
    Ok((read, written))
}
