//! The tab-separated access-log line.
//!
//! One record per request, newline terminated, fields in this order:
//!
//! | # | field                                         |
//! |---|-----------------------------------------------|
//! | 1 | start time, nanoseconds since the Unix epoch  |
//! | 2 | method                                        |
//! | 3 | request URI (path and query)                  |
//! | 4 | request headers `{"K":"V",...}`               |
//! | 5 | request body                                  |
//! | 6 | response status                               |
//! | 7 | response headers `{"K":"V",...}`              |
//! | 8 | response body                                 |
//! | 9 | response size in bytes                        |
//! | 10| elapsed time in microseconds                  |
//!
//! Request headers start with the `Content-Length`, `Host` and `IP`
//! pseudo-headers, followed by every real header except `Host`. Bodies render as [`NO_DATA`] when nothing was captured and
//! as [`TOO_LARGE`] when the capture does not cover the whole body.

use axum::http::{header, HeaderMap, StatusCode};
use bytes::{BufMut, BytesMut};
use std::{
    fmt::Write as _,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::headers::{sorted_headers, write_header_object};
use crate::pool::LogRecord;
use crate::types::RequestMeta;

/// Marker for a body with no captured bytes.
pub const NO_DATA: &str = "{no data}";
/// Marker for a body whose capture was truncated.
pub const TOO_LARGE: &str = "{too large to display}";

/// Everything needed to render one line.
#[derive(Debug)]
pub struct LineFields<'a> {
    pub started_at: SystemTime,
    pub request: &'a RequestMeta,
    pub request_body: &'a [u8],
    pub status: StatusCode,
    pub response_headers: &'a HeaderMap,
    pub response_body: &'a [u8],
    pub response_size: u64,
    pub elapsed: Duration,
}

impl LineFields<'_> {
    /// Appends the formatted line to `record`.
    pub fn write_to(&self, record: &mut LogRecord) {
        let out = record.buf_mut();

        let nanos = self
            .started_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let _ = write!(out, "{nanos}");
        out.put_u8(b'\t');

        out.extend_from_slice(self.request.method.as_str().as_bytes());
        out.put_u8(b'\t');

        out.extend_from_slice(self.request.request_uri().as_bytes());
        out.put_u8(b'\t');

        let content_length = self.request.content_length.to_string();
        let request_headers: Vec<_> = sorted_headers(&self.request.headers)
            .into_iter()
            .filter(|(key, _)| !key.eq_ignore_ascii_case(header::HOST.as_str()))
            .collect();
        write_header_object(
            out,
            &[
                ("Content-Length", content_length.as_bytes()),
                ("Host", self.request.host.as_bytes()),
                ("IP", self.request.remote_addr.as_bytes()),
            ],
            &request_headers,
        );
        out.put_u8(b'\t');

        write_request_body(out, self.request_body, self.request.content_length);
        out.put_u8(b'\t');

        let _ = write!(out, "{}", self.status.as_u16());
        out.put_u8(b'\t');

        write_header_object(out, &[], &sorted_headers(self.response_headers));
        out.put_u8(b'\t');

        write_response_body(out, self.response_body, self.response_size);
        out.put_u8(b'\t');

        let _ = write!(out, "{}", self.response_size);
        out.put_u8(b'\t');

        let _ = write!(out, "{}", self.elapsed.as_micros());
        out.put_u8(b'\n');
    }
}

/// Request bodies lose every newline so the record stays on one line.
fn write_request_body(out: &mut BytesMut, body: &[u8], declared: i64) {
    if body.is_empty() {
        out.extend_from_slice(NO_DATA.as_bytes());
    } else if i64::try_from(body.len()) != Ok(declared) {
        out.extend_from_slice(TOO_LARGE.as_bytes());
    } else {
        for chunk in body.split(|&b| b == b'\n') {
            out.extend_from_slice(chunk);
        }
    }
}

/// Response bodies only lose a single trailing newline.
fn write_response_body(out: &mut BytesMut, body: &[u8], size: u64) {
    if body.is_empty() {
        out.extend_from_slice(NO_DATA.as_bytes());
    } else if body.len() as u64 != size {
        out.extend_from_slice(TOO_LARGE.as_bytes());
    } else {
        out.extend_from_slice(body.strip_suffix(b"\n").unwrap_or(body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};

    fn meta(body_len: i64) -> RequestMeta {
        let (parts, _) = Request::post("/users?id=7")
            .header("host", "api.local")
            .header("content-type", "application/json")
            .header("accept", "*/*")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let mut meta = RequestMeta::from_parts(&parts, None);
        meta.content_length = body_len;
        meta.remote_addr = "127.0.0.1:4000".to_string();
        meta
    }

    fn render(fields: &LineFields<'_>) -> String {
        let mut record = LogRecord::default();
        fields.write_to(&mut record);
        String::from_utf8(record.as_bytes().to_vec()).unwrap()
    }

    fn fields<'a>(
        request: &'a RequestMeta,
        request_body: &'a [u8],
        response_headers: &'a HeaderMap,
        response_body: &'a [u8],
        response_size: u64,
    ) -> LineFields<'a> {
        LineFields {
            started_at: UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789),
            request,
            request_body,
            status: StatusCode::CREATED,
            response_headers,
            response_body,
            response_size,
            elapsed: Duration::from_micros(1500),
        }
    }

    #[test]
    fn test_full_line_layout() {
        let request = meta(17);
        let mut response_headers = HeaderMap::new();
        response_headers.insert("content-type", "application/json".parse().unwrap());

        let line = render(&fields(
            &request,
            br#"{"user": "admin"}"#,
            &response_headers,
            b"{\"ok\":true}\n",
            12,
        ));

        assert!(line.ends_with('\n'));
        let cols: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();
        assert_eq!(cols.len(), 10);
        assert_eq!(cols[0], "1700000000123456789");
        assert_eq!(cols[1], "POST");
        assert_eq!(cols[2], "/users?id=7");
        assert_eq!(
            cols[3],
            r#"{"Content-Length":"17","Host":"api.local","IP":"127.0.0.1:4000","Accept":"*/*","Content-Type":"application/json"}"#
        );
        assert_eq!(cols[4], r#"{"user": "admin"}"#);
        assert_eq!(cols[5], "201");
        assert_eq!(cols[6], r#"{"Content-Type":"application/json"}"#);
        assert_eq!(cols[7], r#"{"ok":true}"#);
        assert_eq!(cols[8], "12");
        assert_eq!(cols[9], "1500");
    }

    #[test]
    fn test_request_body_newlines_are_removed() {
        let request = meta(19);
        let headers = HeaderMap::new();
        let line = render(&fields(&request, b"{\"user\": \n\"admin\"}\n", &headers, b"", 0));
        let cols: Vec<&str> = line.split('\t').collect();
        assert_eq!(cols[4], r#"{"user": "admin"}"#);
    }

    #[test]
    fn test_response_body_loses_one_trailing_newline() {
        let request = meta(0);
        let headers = HeaderMap::new();
        let line = render(&fields(&request, b"", &headers, b"a\nb\n\n", 5));
        let cols: Vec<&str> = line.split('\t').collect();
        assert_eq!(cols[7], "a\nb\n");
    }

    #[test]
    fn test_markers() {
        let headers = HeaderMap::new();

        let request = meta(0);
        let line = render(&fields(&request, b"", &headers, b"", 0));
        let cols: Vec<&str> = line.split('\t').collect();
        assert_eq!(cols[4], NO_DATA);
        assert_eq!(cols[7], NO_DATA);
        assert_eq!(cols[6], "{}");

        // captured a prefix of a longer body
        let request = meta(9000);
        let line = render(&fields(&request, b"partial", &headers, b"partial", 9000));
        let cols: Vec<&str> = line.split('\t').collect();
        assert_eq!(cols[4], TOO_LARGE);
        assert_eq!(cols[7], TOO_LARGE);
        assert_eq!(cols[8], "9000");

        // unknown declared length never matches
        let request = meta(-1);
        let line = render(&fields(&request, b"abc", &headers, b"", 0));
        let cols: Vec<&str> = line.split('\t').collect();
        assert_eq!(cols[4], TOO_LARGE);
    }

    #[test]
    fn test_real_content_length_follows_pseudo_headers() {
        let (parts, _) = Request::post("/")
            .header("host", "api.local")
            .header("content-length", "3")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let request = RequestMeta::from_parts(&parts, None);
        let headers = HeaderMap::new();
        let line = render(&fields(&request, b"abc", &headers, b"", 0));
        assert_eq!(line.matches("\"Host\"").count(), 1);
        assert_eq!(line.matches("\"Content-Length\"").count(), 2);
        assert!(line.contains(
            r#"{"Content-Length":"3","Host":"api.local","IP":"","Content-Length":"3"}"#
        ));
    }
}
