/// Extract the `Host` header from the start of a plaintext HTTP request.
///
/// Only segments that begin a request are considered; mid-stream segments
/// fail the prefix parse and yield `None`. Incomplete requests are fine as
/// long as the header block seen so far contains the Host header.
pub fn host_header(payload: &[u8]) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(payload) {
        Ok(_) => {}
        Err(_) => return None,
    }
    for header in headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            let value = std::str::from_utf8(header.value).ok()?.trim();
            // Strip any :port suffix.
            let host = value.split(':').next().unwrap_or(value);
            if host.is_empty() {
                return None;
            }
            return Some(host.to_ascii_lowercase());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::host_header;

    #[test]
    fn test_complete_request() {
        let payload = b"GET /index.html HTTP/1.1\r\nHost: Example.ORG\r\nAccept: */*\r\n\r\n";
        assert_eq!(host_header(payload), Some("example.org".to_owned()));
    }

    #[test]
    fn test_host_with_port() {
        let payload = b"POST /api HTTP/1.1\r\nHost: portal.lan:8080\r\n\r\n";
        assert_eq!(host_header(payload), Some("portal.lan".to_owned()));
    }

    #[test]
    fn test_partial_request_with_host_seen() {
        let payload = b"GET / HTTP/1.1\r\nHost: example.org\r\nUser-Agent: incompl";
        assert_eq!(host_header(payload), Some("example.org".to_owned()));
    }

    #[test]
    fn test_mid_stream_segment() {
        let payload = b"ontent continues here without a request line";
        assert_eq!(host_header(payload), None);
    }

    #[test]
    fn test_no_host_header() {
        let payload = b"GET / HTTP/1.0\r\nAccept: */*\r\n\r\n";
        assert_eq!(host_header(payload), None);
    }
}
