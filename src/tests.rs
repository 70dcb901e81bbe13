use std::{
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use n0_error::{Result, StdResultExt, anyerr};
use n0_tracing_test::traced_test;
use tokio::sync::Notify;

use crate::{
    BufferIo, BufferedResponse, HttpStream, Lifecycle, RequestStub, ResponseHead, Rewrite,
    StreamOpts, TransformResponse, rewrite_fn,
};

// -- Fixtures --

const SIMPLE: &str = "HTTP/1.1 200 OK\r\n\
                      Connection: keep-alive\r\n\
                      Content-Length: 5\r\n\
                      \r\n\
                      Hello";

const NO_CONTENT_LENGTH: &str = "HTTP/1.1 200 OK\r\n\
                                 Connection: close\r\n\
                                 Transfer-Encoding: identity\r\n\
                                 \r\n\
                                 Hello";

const X_TEST: &str = "HTTP/1.1 200 OK\r\n\
                      Connection: keep-alive\r\n\
                      X-Test: true\r\n\
                      Content-Length: 5\r\n\
                      \r\n\
                      Hello";

const COOKIES: &str = "HTTP/1.1 200 OK\r\n\
                       Connection: keep-alive\r\n\
                       Set-Cookie: foo=bar\r\n\
                       Set-Cookie: a=b\r\n\
                       Content-Length: 5\r\n\
                       \r\n\
                       Hello";

const INTERLEAVED_COOKIES: &str = "HTTP/1.1 200 OK\r\n\
                                   Set-Cookie: foo=bar\r\n\
                                   Content-Length: 5\r\n\
                                   set-cookie: a=b\r\n\
                                   \r\n\
                                   Hello";

const CHUNKED: &str = "HTTP/1.1 200 OK\r\n\
                       Transfer-Encoding: chunked\r\n\
                       \r\n\
                       5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";

fn long_content() -> String {
    let body = "b".repeat(130_000);
    format!(
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

// -- Test helpers --

/// Pushes every chunk, finishes the input if the stream is close-delimited,
/// and returns the output.
fn run(mut stream: HttpStream, chunks: &[&str]) -> Result<String> {
    for chunk in chunks {
        stream.push(chunk.as_bytes())?;
    }
    if chunks.concat().contains("Connection: close") {
        stream.finish()?;
    }
    let out = stream.take_output();
    Ok(String::from_utf8(out.to_vec()).anyerr()?)
}

fn identity_cases() -> Vec<(&'static str, Vec<String>)> {
    let split = SIMPLE.len() - 3;
    vec![
        ("simple response", vec![SIMPLE.to_string()]),
        ("multiple Set-Cookie", vec![COOKIES.to_string()]),
        ("multiple responses per chunk", vec![format!("{SIMPLE}{SIMPLE}")]),
        ("response per chunk", vec![SIMPLE.to_string(), SIMPLE.to_string()]),
        (
            "body split over chunks",
            vec![SIMPLE[..split].to_string(), SIMPLE[split..].to_string()],
        ),
        ("long response", vec![long_content()]),
    ]
}

fn identity_transform() -> TransformResponse {
    TransformResponse::new(|body, _res| Ok(body))
}

fn messages(output: &str) -> Vec<&str> {
    let mut starts: Vec<_> = output.match_indices("HTTP/1.1 ").map(|(i, _)| i).collect();
    starts.push(output.len());
    starts.windows(2).map(|w| &output[w[0]..w[1]]).collect()
}

/// Holds every response head until the gate is opened.
struct Gate(Arc<Notify>);

impl Rewrite for Gate {
    async fn rewrite<'a>(
        &'a self,
        _req: &'a RequestStub,
        res: &'a mut ResponseHead,
    ) -> Result<(), n0_error::AnyError> {
        self.0.notified().await;
        res.headers.set("X-Gate", HeaderValue::from_static("open"));
        Ok(())
    }
}

/// Like [`Gate`], but fails heads that carry `X-Test`.
struct FailingGate(Arc<Notify>);

impl Rewrite for FailingGate {
    async fn rewrite<'a>(
        &'a self,
        _req: &'a RequestStub,
        res: &'a mut ResponseHead,
    ) -> Result<(), n0_error::AnyError> {
        self.0.notified().await;
        if res.headers.contains("X-Test") {
            return Err(anyerr!("late failure"));
        }
        Ok(())
    }
}

/// Counts the bytes handed out by the inner reader.
struct CountingReader<R> {
    inner: R,
    read: Arc<AtomicUsize>,
}

impl<R: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = std::pin::Pin::new(&mut this.inner).poll_read(cx, buf);
        this.read
            .fetch_add(buf.filled().len() - before, Ordering::SeqCst);
        poll
    }
}

// -- Tests --

#[test]
#[traced_test]
fn test_identity_without_stage() -> Result {
    for (name, chunks) in identity_cases() {
        let chunks: Vec<_> = chunks.iter().map(String::as_str).collect();
        let out = run(HttpStream::default(), &chunks)?;
        assert_eq!(out, chunks.concat(), "{name}");
    }
    let out = run(HttpStream::default(), &[NO_CONTENT_LENGTH])?;
    assert_eq!(out, NO_CONTENT_LENGTH);
    let out = run(HttpStream::default(), &[CHUNKED])?;
    assert_eq!(out, CHUNKED);
    Ok(())
}

#[test]
#[traced_test]
fn test_interleaved_repeats_keep_wire_order() -> Result {
    let out = run(HttpStream::default(), &[INTERLEAVED_COOKIES])?;
    assert_eq!(out, INTERLEAVED_COOKIES);
    let out = run(
        HttpStream::with_rewrite(BufferedResponse, StreamOpts::default()),
        &[INTERLEAVED_COOKIES],
    )?;
    assert_eq!(out, INTERLEAVED_COOKIES);
    Ok(())
}

#[test]
#[traced_test]
fn test_identity_through_stages() -> Result {
    for (name, chunks) in identity_cases() {
        let chunks: Vec<_> = chunks.iter().map(String::as_str).collect();
        let out = run(
            HttpStream::with_rewrite(identity_transform(), StreamOpts::default()),
            &chunks,
        )?;
        assert_eq!(out, chunks.concat(), "transform: {name}");

        let out = run(
            HttpStream::with_rewrite(BufferedResponse, StreamOpts::default()),
            &chunks,
        )?;
        assert_eq!(out, chunks.concat(), "buffered: {name}");
    }
    Ok(())
}

#[test]
#[traced_test]
fn test_identity_byte_by_byte() -> Result {
    let input = format!("{SIMPLE}{CHUNKED}{COOKIES}");
    let mut stream = HttpStream::default();
    let mut out = Vec::new();
    for byte in input.as_bytes() {
        stream.push(&[*byte])?;
        out.extend_from_slice(&stream.take_output());
    }
    stream.finish()?;
    assert!(stream.is_done());
    assert_eq!(stream.messages(), 3);
    assert_eq!(String::from_utf8(out).anyerr()?, input);
    Ok(())
}

#[test]
#[traced_test]
fn test_transform_no_content_length() -> Result {
    let out = run(
        HttpStream::with_rewrite(identity_transform(), StreamOpts::default()),
        &[NO_CONTENT_LENGTH],
    )?;
    assert_eq!(
        out,
        "HTTP/1.1 200 OK\r\n\
         Connection: close\r\n\
         Transfer-Encoding: identity\r\n\
         Content-Length: 5\r\n\
         \r\n\
         Hello"
    );
    Ok(())
}

#[test]
#[traced_test]
fn test_transform_changes_content_length() -> Result {
    let transform = TransformResponse::new(|_body, res| {
        res.headers.set("X-Test", HeaderValue::from_static("true"));
        Ok(Bytes::from_static(b"Transformed"))
    });
    let out = run(
        HttpStream::with_rewrite(transform, StreamOpts::default()),
        &[SIMPLE],
    )?;
    assert_eq!(
        out,
        "HTTP/1.1 200 OK\r\n\
         Connection: keep-alive\r\n\
         X-Test: true\r\n\
         Content-Length: 11\r\n\
         \r\n\
         Transformed"
    );
    Ok(())
}

#[test]
#[traced_test]
fn test_transform_rechunked_body() -> Result {
    let transform = TransformResponse::new(|body, _res| Ok(Bytes::from(body.to_ascii_uppercase())));
    let out = run(
        HttpStream::with_rewrite(transform, StreamOpts::default()),
        &[CHUNKED],
    )?;
    assert_eq!(out, "HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHELLO WORLD");
    Ok(())
}

#[test]
#[traced_test]
fn test_transform_error() -> Result {
    let transform = TransformResponse::new(|_body, _res| Err(anyerr!("Transform error")));
    let out = run(
        HttpStream::with_rewrite(transform, StreamOpts::default()),
        &[SIMPLE],
    )?;
    let lines: Vec<_> = out.split("\r\n").collect();
    assert!(lines.contains(&"HTTP/1.1 500 Internal Server Error"));
    assert!(lines.contains(&"Connection: keep-alive"));
    assert!(!lines.contains(&"Transfer-Encoding: chunked"));
    assert!(out.contains("Transform error"));
    assert_eq!(messages(&out).len(), 1);
    Ok(())
}

#[test]
#[traced_test]
fn test_transform_error_recovery() -> Result {
    let transform = TransformResponse::new(|body, res| {
        if res.headers.contains("X-Test") {
            Err(anyerr!("Transform error"))
        } else {
            Ok(body)
        }
    });
    let out = run(
        HttpStream::with_rewrite(transform, StreamOpts::default()),
        &[X_TEST, SIMPLE],
    )?;
    let messages = messages(&out);
    assert_eq!(messages.len(), 2);
    let lines: Vec<_> = messages[0].split("\r\n").collect();
    assert!(lines.contains(&"HTTP/1.1 500 Internal Server Error"));
    assert!(!lines.contains(&"Transfer-Encoding: chunked"));
    assert_eq!(messages[1], SIMPLE);
    Ok(())
}

#[test]
#[traced_test]
fn test_head_rewrite_error_recovery() -> Result {
    let stage = rewrite_fn(|_req, res| {
        if res.status == StatusCode::NOT_FOUND {
            write!(res.diagnostics().log, "looking at 404")?;
            return Err(anyerr!("no 404s"));
        }
        res.headers.set("X-Seen", HeaderValue::from_static("1"));
        Ok(())
    });
    let not_found = "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope";
    let mut stream = HttpStream::with_rewrite(stage, StreamOpts::default().capture_diagnostics(true));
    stream.push(format!("{not_found}{SIMPLE}").as_bytes())?;
    let out = String::from_utf8(stream.take_output().to_vec()).anyerr()?;
    let messages = messages(&out);
    assert_eq!(messages.len(), 2);
    assert!(messages[0].starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(messages[0].contains("no 404s"));
    assert!(messages[0].ends_with("\n\n--log--\nlooking at 404\n\n--warn--\n"));
    assert_eq!(
        messages[1],
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 5\r\nX-Seen: 1\r\n\r\nHello"
    );
    Ok(())
}

#[test]
#[traced_test]
fn test_diagnostics_not_captured_by_default() -> Result {
    let stage = rewrite_fn(|_req, res| {
        write!(res.diagnostics().warn, "secret")?;
        Err(anyerr!("fail"))
    });
    let out = run(HttpStream::with_rewrite(stage, StreamOpts::default()), &[SIMPLE])?;
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(!out.contains("secret"));
    assert!(!out.contains("--log--"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_queued_writes_flush_in_order() -> Result {
    let gate = Arc::new(Notify::new());
    let mut stream = HttpStream::with_rewrite(Gate(gate.clone()), StreamOpts::default());

    stream.push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n")?;
    stream.push(b"2\r\nde\r\n0\r\n\r\n")?;
    stream.push(SIMPLE.as_bytes())?;
    assert!(stream.is_rewrite_pending());
    assert_eq!(stream.lifecycle(), Some(Lifecycle::Pending));
    assert!(!stream.has_output());

    gate.notify_one();
    stream.settle().await?;
    let out = String::from_utf8(stream.take_output().to_vec()).anyerr()?;
    assert_eq!(
        out,
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Gate: open\r\n\r\n\
         3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"
    );

    // The pipelined second response now waits on its own rewrite.
    assert!(stream.is_rewrite_pending());
    gate.notify_one();
    stream.settle().await?;
    let out = String::from_utf8(stream.take_output().to_vec()).anyerr()?;
    assert_eq!(
        out,
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 5\r\nX-Gate: open\r\n\r\nHello"
    );
    assert!(stream.lifecycle().is_none());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_async_rewrite_error_recovery() -> Result {
    let gate = Arc::new(Notify::new());
    let mut stream = HttpStream::with_rewrite(FailingGate(gate.clone()), StreamOpts::default());
    stream.push(format!("{X_TEST}{SIMPLE}").as_bytes())?;
    assert!(stream.is_rewrite_pending());
    assert!(!stream.has_output());

    gate.notify_one();
    stream.settle().await?;
    assert!(stream.is_rewrite_pending());
    gate.notify_one();
    stream.settle().await?;

    let out = String::from_utf8(stream.take_output().to_vec()).anyerr()?;
    let messages = messages(&out);
    assert_eq!(messages.len(), 2);
    assert!(messages[0].starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(messages[0].contains("late failure"));
    assert!(!messages[0].contains("Transfer-Encoding: chunked"));
    assert_eq!(messages[1], SIMPLE);
    assert!(stream.lifecycle().is_none());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_forward_bounds_input_behind_pending_rewrite() -> Result {
    struct Recorder {
        read: Arc<AtomicUsize>,
        first: Arc<AtomicUsize>,
    }

    impl Rewrite for Recorder {
        async fn rewrite<'a>(
            &'a self,
            _req: &'a RequestStub,
            _res: &'a mut ResponseHead,
        ) -> Result<(), n0_error::AnyError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let read = self.read.load(Ordering::SeqCst);
            self.first
                .compare_exchange(0, read, Ordering::SeqCst, Ordering::SeqCst)
                .ok();
            Ok(())
        }
    }

    let input = SIMPLE.repeat(50);
    let read = Arc::new(AtomicUsize::new(0));
    let first = Arc::new(AtomicUsize::new(0));
    let mut reader = CountingReader {
        inner: input.as_bytes(),
        read: read.clone(),
    };
    let mut out = BufferIo::new();
    let mut stream = HttpStream::with_rewrite(
        Recorder {
            read: read.clone(),
            first: first.clone(),
        },
        StreamOpts::default()
            .read_chunk_size(64)
            .max_pending_input(256),
    );
    stream.forward(&mut reader, &mut out).await?;

    assert_eq!(out.to_string_lossy(), input);
    assert_eq!(stream.messages(), 50);
    let first = first.load(Ordering::SeqCst);
    assert!(first > 0 && first < 1024, "read {first} bytes before the first rewrite finished");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_forward_with_slow_stage() -> Result {
    struct Slow(Arc<AtomicUsize>);

    impl Rewrite for Slow {
        async fn rewrite<'a>(
            &'a self,
            _req: &'a RequestStub,
            res: &'a mut ResponseHead,
        ) -> Result<(), n0_error::AnyError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            res.headers.set("X-Seq", HeaderValue::from(n));
            Ok(())
        }
    }

    let seq = Arc::new(AtomicUsize::new(0));
    let input = format!("{SIMPLE}{COOKIES}{NO_CONTENT_LENGTH}");
    let mut reader = input.as_bytes();
    let mut out = BufferIo::new();
    let mut stream = HttpStream::with_rewrite(
        Slow(seq.clone()),
        StreamOpts::default().read_chunk_size(7),
    );
    let (read, written) = stream.forward(&mut reader, &mut out).await?;

    let expected = format!(
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 5\r\nX-Seq: 0\r\n\r\nHello\
         HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nSet-Cookie: foo=bar\r\nSet-Cookie: a=b\r\nContent-Length: 5\r\nX-Seq: 1\r\n\r\nHello\
         HTTP/1.1 200 OK\r\nConnection: close\r\nTransfer-Encoding: identity\r\nX-Seq: 2\r\n\r\nHello"
    );
    assert_eq!(out.to_string_lossy(), expected);
    assert_eq!(read, input.len() as u64);
    assert_eq!(written, expected.len() as u64);
    assert_eq!(seq.load(Ordering::SeqCst), 3);
    assert!(stream.is_done());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_forward_over_duplex() -> Result {
    let (mut upstream, mut upstream_peer) = tokio::io::duplex(64);
    let (mut downstream, mut downstream_peer) = tokio::io::duplex(64);
    let input = format!("{SIMPLE}{}", long_content());

    let writer = tokio::spawn({
        let input = input.clone();
        async move {
            use tokio::io::AsyncWriteExt;
            upstream_peer.write_all(input.as_bytes()).await?;
            upstream_peer.shutdown().await?;
            Ok::<_, n0_error::AnyError>(())
        }
    });
    let reader = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        downstream_peer.read_to_end(&mut out).await?;
        Ok::<_, n0_error::AnyError>(out)
    });

    let mut stream = HttpStream::with_rewrite(BufferedResponse, StreamOpts::default());
    let (read, written) = stream.forward(&mut upstream, &mut downstream).await?;
    drop(downstream);
    writer.await.anyerr()??;
    let out = reader.await.anyerr()??;

    assert_eq!(read, input.len() as u64);
    assert_eq!(written, input.len() as u64);
    assert_eq!(String::from_utf8(out).anyerr()?, input);
    Ok(())
}

#[test]
#[traced_test]
fn test_malformed_and_truncated_input() {
    let mut stream = HttpStream::default();
    assert!(stream.push(b"SMTP ready\r\n\r\n").is_err());

    let mut stream = HttpStream::default();
    stream.push(&SIMPLE.as_bytes()[..SIMPLE.len() - 1]).unwrap();
    assert!(stream.finish().is_err());

    let mut stream = HttpStream::new(StreamOpts::default().max_header_section(32));
    assert!(stream.push(COOKIES.as_bytes()).is_err());
}

#[test]
#[traced_test]
fn test_error_after_headers_sent_is_fatal() {
    struct FailLate;

    impl crate::BodyRewrite for FailLate {
        fn write(
            &mut self,
            res: &mut crate::BodyWriter<'_>,
            chunk: Bytes,
        ) -> Result<(), n0_error::AnyError> {
            res.write(chunk);
            Err(anyerr!("too late"))
        }

        fn end(&mut self, res: &mut crate::BodyWriter<'_>) -> Result<(), n0_error::AnyError> {
            res.end(None);
            Ok(())
        }
    }

    let stage = rewrite_fn(|_req, res| {
        res.set_body_rewrite(FailLate);
        Ok(())
    });
    let mut stream = HttpStream::with_rewrite(stage, StreamOpts::default());
    let err = stream.push(SIMPLE.as_bytes()).unwrap_err();
    assert!(matches!(err, crate::StreamError::HeadersSent { .. }));
    assert_eq!(
        stream.take_output(),
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 5\r\n\r\nHello")
    );
}
