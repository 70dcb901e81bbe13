//! Synthesized replacement for a response whose rewrite failed.

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, StatusCode};
use n0_error::AnyError;

use crate::{
    diagnostics::Diagnostics,
    headers::Headers,
    response::{Response, ResponseHead},
};

/// Builds the text body describing a rewrite failure.
///
/// With `diagnostics`, the captured log and warn output are appended.
pub(crate) fn error_body(err: &AnyError, diagnostics: Option<&Diagnostics>) -> Bytes {
    let mut body = format!("Transform error\n\n{err:#}");
    if let Some(diagnostics) = diagnostics {
        body.push_str(&diagnostics.render());
    }
    Bytes::from(body)
}

/// Serializes a complete `500 Internal Server Error` response for `err`.
///
/// The connection stays usable for the messages that follow.
pub(crate) fn error_response(err: &AnyError, diagnostics: Option<&Diagnostics>) -> BytesMut {
    let body = error_body(err, diagnostics);
    let head = ResponseHead::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        Headers::from_iter([
            ("Connection", HeaderValue::from_static("keep-alive")),
            (
                "Content-Type",
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            ("Content-Length", HeaderValue::from(body.len())),
        ]),
    );
    let mut res = Response::started(head);
    res.end(Some(body));
    res.take_output()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use n0_error::anyerr;

    use super::*;

    #[test]
    fn error_response_is_complete() {
        let err = anyerr!("boom");
        let body = error_body(&err, None);
        assert!(body.starts_with(b"Transform error\n\n"));
        assert!(std::str::from_utf8(&body).unwrap().contains("boom"));

        let out = error_response(&err, None);
        let expected = format!(
            "HTTP/1.1 500 Internal Server Error\r\n\
             Connection: keep-alive\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        );
        assert_eq!(&out[..expected.len()], expected.as_bytes());
        assert_eq!(&out[expected.len()..], &body[..]);
    }

    #[test]
    fn error_body_with_diagnostics() {
        let mut diagnostics = Diagnostics::default();
        write!(diagnostics.log, "seen").unwrap();
        write!(diagnostics.warn, "odd").unwrap();
        let body = error_body(&anyerr!("boom"), Some(&diagnostics));
        assert!(body.ends_with(b"\n\n--log--\nseen\n\n--warn--\nodd"));
    }
}
