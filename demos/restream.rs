//! Re-serializes pipelined HTTP/1.x responses from stdin to stdout.
//!
//! ```sh
//! printf 'HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello' \
//!     | cargo run --example restream -- --header X-Seen:1 --uppercase
//! ```

use bytes::Bytes;
use clap::Parser;
use http::HeaderValue;
use http_restream::{
    BufferedResponse, HttpStream, Passthrough, RequestStub, ResponseHead, Rewrite, StreamOpts,
    TransformResponse,
};
use n0_error::{AnyError, Result, anyerr};
use tracing::info;

#[derive(Parser)]
struct Cli {
    /// Set a header on every response, as `Name:Value`.
    #[clap(long = "header", value_parser = parse_header)]
    headers: Vec<(String, HeaderValue)>,
    /// Buffer each body and send it with a Content-Length.
    #[clap(long)]
    buffer: bool,
    /// Upper-case each body.
    #[clap(long, conflicts_with = "buffer")]
    uppercase: bool,
    /// Include diagnostic output in error responses.
    #[clap(long)]
    capture_diagnostics: bool,
}

fn parse_header(s: &str) -> Result<(String, HeaderValue), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected Name:Value, got {s:?}"))?;
    let value = HeaderValue::from_str(value.trim()).map_err(|err| err.to_string())?;
    Ok((name.trim().to_string(), value))
}

/// Sets fixed headers, then hands the body to an inner stage.
struct SetHeaders<R> {
    headers: Vec<(String, HeaderValue)>,
    inner: R,
}

impl<R: Rewrite> Rewrite for SetHeaders<R> {
    async fn rewrite<'a>(
        &'a self,
        req: &'a RequestStub,
        res: &'a mut ResponseHead,
    ) -> Result<(), AnyError> {
        for (name, value) in &self.headers {
            res.headers.set(name.clone(), value.clone());
        }
        self.inner.rewrite(req, res).await
    }
}

fn uppercase(body: Bytes, _res: &mut ResponseHead) -> Result<Bytes, AnyError> {
    if body.is_ascii() {
        Ok(Bytes::from(body.to_ascii_uppercase()))
    } else {
        Err(anyerr!("body is not ASCII"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    let opts = StreamOpts::default().capture_diagnostics(cli.capture_diagnostics);
    let headers = cli.headers;
    let mut stream = if cli.uppercase {
        HttpStream::with_rewrite(
            SetHeaders {
                headers,
                inner: TransformResponse::new(uppercase),
            },
            opts,
        )
    } else if cli.buffer {
        HttpStream::with_rewrite(
            SetHeaders {
                headers,
                inner: BufferedResponse,
            },
            opts,
        )
    } else {
        HttpStream::with_rewrite(
            SetHeaders {
                headers,
                inner: Passthrough,
            },
            opts,
        )
    };
    let (read, written) = stream
        .forward(&mut tokio::io::stdin(), &mut tokio::io::stdout())
        .await?;
    info!(read, written, messages = stream.messages(), "done");
    Ok(())
}
