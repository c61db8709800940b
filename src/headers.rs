//! Deterministic header serialization for the log line.

use axum::http::HeaderMap;
use bytes::{BufMut, BytesMut};

/// Returns `(canonical key, first value)` pairs sorted by key.
///
/// Only the first value of a repeated header is kept, and headers with no
/// value are skipped. Two maps holding the same headers always serialize to
/// the same sequence regardless of insertion order.
pub fn sorted_headers(headers: &HeaderMap) -> Vec<(String, &[u8])> {
    let mut entries: Vec<(String, &[u8])> = headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?;
            Some((canonical_key(name.as_str()), value.as_bytes()))
        })
        .collect();
    entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    entries
}

/// Canonicalizes a header name: first letter and every letter following a
/// hyphen upper-cased, the rest lower-cased (`x-request-id` -> `X-Request-Id`).
pub fn canonical_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Renders `{"K":"V","K2":"V2"}`, `prefix` entries first, then `headers`.
///
/// Keys and values are written raw, without JSON escaping.
pub(crate) fn write_header_object(
    out: &mut BytesMut,
    prefix: &[(&str, &[u8])],
    headers: &[(String, &[u8])],
) {
    out.put_u8(b'{');
    let pairs = prefix
        .iter()
        .map(|(k, v)| (*k, *v))
        .chain(headers.iter().map(|(k, v)| (k.as_str(), *v)));
    for (i, (key, value)) in pairs.enumerate() {
        if i != 0 {
            out.put_u8(b',');
        }
        out.put_u8(b'"');
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b"\":\"");
        out.extend_from_slice(value);
        out.put_u8(b'"');
    }
    out.put_u8(b'}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for &(k, v) in pairs {
            headers.append(HeaderName::from_static(k), HeaderValue::from_static(v));
        }
        headers
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("content-type"), "Content-Type");
        assert_eq!(canonical_key("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_key("host"), "Host");
        assert_eq!(canonical_key("dnt"), "Dnt");
    }

    #[test]
    fn test_sorted_by_key() {
        let headers = map(&[
            ("user-agent", "curl"),
            ("accept", "*/*"),
            ("content-type", "application/json"),
        ]);
        let keys: Vec<_> = sorted_headers(&headers)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["Accept", "Content-Type", "User-Agent"]);
    }

    #[test]
    fn test_first_value_only() {
        let headers = map(&[("accept", "text/html"), ("accept", "application/json")]);
        let entries = sorted_headers(&headers);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"text/html");
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = map(&[("b-header", "2"), ("a-header", "1"), ("c-header", "3")]);
        let b = map(&[("c-header", "3"), ("a-header", "1"), ("b-header", "2")]);
        assert_eq!(sorted_headers(&a), sorted_headers(&b));
        assert_eq!(sorted_headers(&a), sorted_headers(&a));
    }

    #[test]
    fn test_header_object_rendering() {
        let headers = map(&[("content-type", "text/plain"), ("accept", "*/*")]);
        let mut out = BytesMut::new();
        write_header_object(
            &mut out,
            &[("IP", b"127.0.0.1:9".as_slice())],
            &sorted_headers(&headers),
        );
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            r#"{"IP":"127.0.0.1:9","Accept":"*/*","Content-Type":"text/plain"}"#
        );

        let mut out = BytesMut::new();
        write_header_object(&mut out, &[], &[]);
        assert_eq!(&out[..], b"{}");
    }
}
