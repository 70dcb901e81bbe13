//! Ordered, case-preserving header storage.
//!
//! [`http::HeaderMap`] lowercases names and groups repeated ones, which would
//! change bytes on the way through. [`Headers`] keeps every line exactly as
//! it was received, in wire order, including interleaved repeats.

use bytes::{BufMut, BytesMut};
use http::HeaderValue;

/// Ordered multi-value header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    lines: Vec<(String, HeaderValue)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.lines
            .iter()
            .position(|(line, _)| line.eq_ignore_ascii_case(name))
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.get_all(name).next()
    }

    /// Returns the first value for `name` if it is visible ASCII.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| value.to_str().ok())
    }

    /// Returns all values for `name` in wire order.
    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a HeaderValue> {
        self.lines
            .iter()
            .filter(move |(line, _)| line.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replaces all values of `name` with `value`.
    ///
    /// An existing name keeps the position and spelling of its first line and
    /// loses any later lines; a new name is appended.
    pub fn set(&mut self, name: impl Into<String>, value: HeaderValue) {
        let name = name.into();
        let Some(idx) = self.position(&name) else {
            self.lines.push((name, value));
            return;
        };
        self.lines[idx].1 = value;
        let mut pos = 0;
        self.lines.retain(|(line, _)| {
            let keep = pos <= idx || !line.eq_ignore_ascii_case(&name);
            pos += 1;
            keep
        });
    }

    /// Adds a `name: value` line at the end.
    pub fn append(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.lines.push((name.into(), value));
    }

    /// Removes every line of `name` and returns the values.
    pub fn remove(&mut self, name: &str) -> Vec<HeaderValue> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.lines.len());
        for (line, value) in self.lines.drain(..) {
            if line.eq_ignore_ascii_case(name) {
                removed.push(value);
            } else {
                kept.push((line, value));
            }
        }
        self.lines = kept;
        removed
    }

    /// Iterates over `(name, value)` pairs in serialization order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.lines.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns true if any comma-separated element of `name` equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|element| element.trim().eq_ignore_ascii_case(token))
    }

    /// Writes one `name: value\r\n` line per value.
    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        for (name, value) in self.iter() {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

impl<N: Into<String>> FromIterator<(N, HeaderValue)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, HeaderValue)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &'static str) -> HeaderValue {
        HeaderValue::from_static(s)
    }

    #[test]
    fn repeated_names_keep_wire_order() {
        let headers = Headers::from_iter([
            ("Set-Cookie", value("foo=bar")),
            ("Content-Length", value("5")),
            ("set-cookie", value("a=b")),
        ]);
        let cookies: Vec<_> = headers.get_all("SET-COOKIE").cloned().collect();
        assert_eq!(cookies, [value("foo=bar"), value("a=b")]);
        let lines: Vec<_> = headers.iter().map(|(n, v)| (n, v.clone())).collect();
        assert_eq!(
            lines,
            vec![
                ("Set-Cookie", value("foo=bar")),
                ("Content-Length", value("5")),
                ("set-cookie", value("a=b")),
            ]
        );
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn set_collapses_repeats_onto_first_line() {
        let mut headers = Headers::from_iter([
            ("Vary", value("a")),
            ("Date", value("now")),
            ("vary", value("b")),
        ]);
        headers.set("VARY", value("c"));
        let lines: Vec<_> = headers.iter().map(|(n, v)| (n, v.clone())).collect();
        assert_eq!(lines, vec![("Vary", value("c")), ("Date", value("now"))]);
        assert_eq!(headers.remove("vary"), vec![value("c")]);
        assert!(!headers.contains("Vary"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn set_replaces_in_place_and_remove_then_set_appends() {
        let mut headers = Headers::from_iter([
            ("Connection", value("keep-alive")),
            ("Content-Length", value("5")),
            ("X-Other", value("1")),
        ]);
        headers.set("content-length", value("7"));
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["Connection", "Content-Length", "X-Other"]);
        assert_eq!(headers.get_str("Content-Length"), Some("7"));

        assert_eq!(headers.remove("Content-Length"), vec![value("7")]);
        headers.set("Content-Length", value("11"));
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["Connection", "X-Other", "Content-Length"]);
    }

    #[test]
    fn token_lookup_splits_lists() {
        let headers = Headers::from_iter([("Transfer-Encoding", value("gzip, Chunked"))]);
        assert!(headers.has_token("transfer-encoding", "chunked"));
        assert!(!headers.has_token("transfer-encoding", "identity"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn write_preserves_case() {
        let headers = Headers::from_iter([("X-MiXeD", value("v"))]);
        let mut buf = BytesMut::new();
        headers.write_to(&mut buf);
        assert_eq!(&buf[..], b"X-MiXeD: v\r\n");
    }
}
