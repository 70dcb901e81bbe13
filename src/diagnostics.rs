//! In-memory byte sinks for diagnostic text.
//!
//! A rewrite stage gets a fresh [`Diagnostics`] pair with every response head.
//! When the stage fails and capture is enabled, whatever it wrote is drained
//! into the body of the synthesized error response.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWrite;

/// Write-only byte sink that can be drained to text and reset.
#[derive(Debug, Clone, Default)]
pub struct BufferIo {
    buf: BytesMut,
}

impl BufferIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything written since the last [`Self::clear`].
    pub fn value(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// Returns the written bytes as text, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl io::Write for BufferIo {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncWrite for BufferIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A standard and an error channel, scoped to one message.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Informational output.
    pub log: BufferIo,
    /// Warnings and error output.
    pub warn: BufferIo,
}

impl Diagnostics {
    pub fn clear(&mut self) {
        self.log.clear();
        self.warn.clear();
    }

    /// Renders both channels as the trailer of an error body.
    pub(crate) fn render(&self) -> String {
        format!(
            "\n\n--log--\n{}\n\n--warn--\n{}",
            self.log.to_string_lossy(),
            self.warn.to_string_lossy()
        )
    }
}
