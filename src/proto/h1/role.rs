//! Message-head parsing and serialization for HTTP/1.x.
//!
//! Parsing runs `httparse` over the connection's read buffer, records
//! header spans, then slices them out of the frozen head so names and
//! values share one allocation.

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use log::{debug, trace};

use super::{
    connection_close, connection_keep_alive, connection_upgrade, content_length_parse,
    transfer_encoding_is_chunked, BodyLength, MAX_HEADERS, MAX_HEADER_LINE,
};
use crate::header::{HeaderMap, HeaderName, HeaderValue};

/// totally scientific
const AVERAGE_HEADER_SIZE: usize = 30;

/// Why a message head failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParseError {
    /// The head exceeds the configured limit, or one line is too long.
    TooLarge,
    /// The bytes are not a valid HTTP/1.x message head.
    Malformed(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::TooLarge => f.write_str("message head too large"),
            ParseError::Malformed(msg) => write!(f, "malformed message head: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

type ParseResult<T> = std::result::Result<Option<T>, ParseError>;

/// An HTTP/1.x request head.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// An HTTP/1.x response head.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ParsedRequest {
    pub(crate) head: RequestHead,
    pub(crate) body: BodyLength,
    pub(crate) keep_alive: bool,
    /// `Connection: upgrade` with the named protocol.
    pub(crate) upgrade: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ParsedResponse {
    pub(crate) head: ResponseHead,
    pub(crate) body: BodyLength,
    pub(crate) keep_alive: bool,
    /// A 101, or a 2xx to CONNECT: the connection changes hands.
    pub(crate) wants_upgrade: bool,
}

/// Parse a request head off the front of `buf`. `Ok(None)` means more
/// bytes are needed.
pub(crate) fn parse_request(buf: &mut BytesMut, max_head: usize) -> ParseResult<ParsedRequest> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut header_spans = [Span::EMPTY; MAX_HEADERS];
    let (len, method, target, version, header_count) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        trace!("Request.parse bytes={}", buf.len());
        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                if len > max_head {
                    return Err(ParseError::TooLarge);
                }
                let method = req
                    .method
                    .and_then(|m| m.parse::<Method>().ok())
                    .ok_or(ParseError::Malformed("bad method"))?;
                let target = req.path.ok_or(ParseError::Malformed("bad target"))?.to_owned();
                let version = if req.version == Some(1) {
                    Version::HTTP_11
                } else {
                    Version::HTTP_10
                };
                record_spans(buf, req.headers, &mut header_spans)?;
                (len, method, target, version, req.headers.len())
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > max_head {
                    return Err(ParseError::TooLarge);
                }
                return Ok(None);
            }
            Err(e) => {
                debug!("request parse error: {e}");
                return Err(ParseError::Malformed("invalid request head"));
            }
        }
    };

    let slice = buf.split_to(len).freeze();
    let headers = build_headers(&slice, &header_spans[..header_count])?;

    let body = request_body_length(&headers)?;
    let mut keep_alive = version == Version::HTTP_11;
    if keep_alive {
        keep_alive = !connection_close(&headers);
    } else {
        keep_alive = connection_keep_alive(&headers);
    }
    let upgrade = if connection_upgrade(&headers) {
        headers.get_str("upgrade").map(str::to_owned)
    } else {
        None
    };

    Ok(Some(ParsedRequest {
        head: RequestHead {
            method,
            target,
            version,
            headers,
        },
        body,
        keep_alive,
        upgrade,
    }))
}

/// Parse a response head. Informational 1xx heads (other than 101) are
/// consumed and skipped.
pub(crate) fn parse_response(
    buf: &mut BytesMut,
    req_method: &Method,
    max_head: usize,
) -> ParseResult<ParsedResponse> {
    loop {
        if buf.is_empty() {
            return Ok(None);
        }
        let mut header_spans = [Span::EMPTY; MAX_HEADERS];
        let (len, status, version, header_count) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut res = httparse::Response::new(&mut headers);
            trace!("Response.parse bytes={}", buf.len());
            match res.parse(buf) {
                Ok(httparse::Status::Complete(len)) => {
                    if len > max_head {
                        return Err(ParseError::TooLarge);
                    }
                    let status = res
                        .code
                        .and_then(|c| StatusCode::from_u16(c).ok())
                        .ok_or(ParseError::Malformed("bad status"))?;
                    let version = if res.version == Some(1) {
                        Version::HTTP_11
                    } else {
                        Version::HTTP_10
                    };
                    record_spans(buf, res.headers, &mut header_spans)?;
                    (len, status, version, res.headers.len())
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() > max_head {
                        return Err(ParseError::TooLarge);
                    }
                    return Ok(None);
                }
                Err(e) => {
                    debug!("response parse error: {e}");
                    return Err(ParseError::Malformed("invalid response head"));
                }
            }
        };

        let slice = buf.split_to(len).freeze();
        let headers = build_headers(&slice, &header_spans[..header_count])?;

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            trace!("ignoring informational response: {}", status.as_u16());
            continue;
        }

        let (body, wants_upgrade) = response_body_length(status, req_method, version, &headers)?;
        let mut keep_alive = version == Version::HTTP_11;
        if keep_alive {
            keep_alive = !connection_close(&headers);
        } else {
            keep_alive = connection_keep_alive(&headers);
        }

        return Ok(Some(ParsedResponse {
            head: ResponseHead {
                status,
                version,
                headers,
            },
            body,
            keep_alive: keep_alive && !wants_upgrade,
            wants_upgrade,
        }));
    }
}

fn request_body_length(headers: &HeaderMap) -> std::result::Result<BodyLength, ParseError> {
    if headers.contains("transfer-encoding") {
        return if transfer_encoding_is_chunked(headers) {
            Ok(BodyLength::Chunked)
        } else {
            Err(ParseError::Malformed("transfer-encoding not chunked"))
        };
    }
    match content_length_parse(headers) {
        Ok(Some(0)) | Ok(None) => Ok(BodyLength::Empty),
        Ok(Some(n)) => Ok(BodyLength::Known(n)),
        Err(()) => Err(ParseError::Malformed("invalid content-length")),
    }
}

fn response_body_length(
    status: StatusCode,
    req_method: &Method,
    version: Version,
    headers: &HeaderMap,
) -> std::result::Result<(BodyLength, bool), ParseError> {
    // 1. HEAD responses, and status 1xx, 204, and 304 cannot have a body.
    // 2. Status 2xx to a CONNECT cannot have a body.
    // 3. Transfer-Encoding: chunked has a chunked body.
    // 4. Multiple differing Content-Length headers close the connection.
    // 5. Content-Length header has a sized body.
    // 6. Otherwise read till connection close.
    if status == StatusCode::SWITCHING_PROTOCOLS {
        return Ok((BodyLength::Empty, true));
    }
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok((BodyLength::Empty, false));
    }
    if *req_method == Method::HEAD {
        return Ok((BodyLength::Empty, false));
    }
    if *req_method == Method::CONNECT && status.is_success() {
        return Ok((BodyLength::Empty, true));
    }
    if headers.contains("transfer-encoding") {
        if version == Version::HTTP_10 {
            debug!("HTTP/1.0 cannot have Transfer-Encoding header");
            return Err(ParseError::Malformed("transfer-encoding on HTTP/1.0"));
        }
        return if transfer_encoding_is_chunked(headers) {
            Ok((BodyLength::Chunked, false))
        } else {
            trace!("not chunked, read till eof");
            Ok((BodyLength::CloseDelimited, false))
        };
    }
    match content_length_parse(headers) {
        Ok(Some(n)) => Ok((BodyLength::Known(n), false)),
        Ok(None) => Ok((BodyLength::CloseDelimited, false)),
        Err(()) => Err(ParseError::Malformed("invalid content-length")),
    }
}

/// Serialize a request head: request line, headers in original case, and
/// the terminating blank line.
pub(crate) fn encode_request(head: &RequestHead, dst: &mut BytesMut) {
    dst.reserve(head.target.len() + 16 + head.headers.len() * AVERAGE_HEADER_SIZE);
    dst.extend_from_slice(head.method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(head.target.as_bytes());
    match head.version {
        Version::HTTP_10 => dst.extend_from_slice(b" HTTP/1.0\r\n"),
        _ => dst.extend_from_slice(b" HTTP/1.1\r\n"),
    }
    write_headers(&head.headers, dst);
    dst.extend_from_slice(b"\r\n");
}

/// Serialize a response head with the canonical reason phrase.
pub(crate) fn encode_response(head: &ResponseHead, dst: &mut BytesMut) {
    dst.reserve(32 + head.headers.len() * AVERAGE_HEADER_SIZE);
    match head.version {
        Version::HTTP_10 => dst.extend_from_slice(b"HTTP/1.0 "),
        _ => dst.extend_from_slice(b"HTTP/1.1 "),
    }
    dst.extend_from_slice(head.status.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(
        head.status
            .canonical_reason()
            .unwrap_or("Unknown")
            .as_bytes(),
    );
    dst.extend_from_slice(b"\r\n");
    write_headers(&head.headers, dst);
    dst.extend_from_slice(b"\r\n");
}

fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.extend_from_slice(name.as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

#[derive(Clone, Copy)]
struct Span {
    name: (usize, usize),
    value: (usize, usize),
}

impl Span {
    const EMPTY: Span = Span {
        name: (0, 0),
        value: (0, 0),
    };
}

fn record_spans(
    bytes: &[u8],
    headers: &[httparse::Header<'_>],
    spans: &mut [Span],
) -> std::result::Result<(), ParseError> {
    let base = bytes.as_ptr() as usize;
    for (header, span) in headers.iter().zip(spans.iter_mut()) {
        if header.name.len() + header.value.len() + 2 > MAX_HEADER_LINE {
            debug!("header line over {MAX_HEADER_LINE} octets: {:?}", header.name);
            return Err(ParseError::TooLarge);
        }
        let name_start = header.name.as_ptr() as usize - base;
        let value_start = header.value.as_ptr() as usize - base;
        *span = Span {
            name: (name_start, name_start + header.name.len()),
            value: (value_start, value_start + header.value.len()),
        };
    }
    Ok(())
}

fn build_headers(
    slice: &Bytes,
    spans: &[Span],
) -> std::result::Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::with_capacity(spans.len());
    for span in spans {
        let name = HeaderName::from_shared(slice.slice(span.name.0..span.name.1))
            .map_err(|_| ParseError::Malformed("invalid header name"))?;
        let value = HeaderValue::from_shared(slice.slice(span.value.0..span.value.1))
            .map_err(|_| ParseError::Malformed("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let mut buf = BytesMut::from(
            &b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\nrest"[..],
        );
        let parsed = parse_request(&mut buf, 8192).unwrap().unwrap();
        assert_eq!(parsed.head.method, Method::GET);
        assert_eq!(parsed.head.target, "/index.html?q=1");
        assert_eq!(parsed.head.version, Version::HTTP_11);
        assert_eq!(parsed.head.headers.get_str("host"), Some("example.com"));
        assert_eq!(parsed.body, BodyLength::Empty);
        assert!(parsed.keep_alive);
        // the body bytes stay in the buffer
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn partial_head_needs_more() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: exa"[..]);
        assert!(parse_request(&mut buf, 8192).unwrap().is_none());
        assert_eq!(buf.len(), 25);
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        for i in 0..100 {
            buf.extend_from_slice(format!("X-Filler-{i}: {}\r\n", "v".repeat(80)).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        assert_eq!(parse_request(&mut buf, 1024), Err(ParseError::TooLarge));
    }

    #[test]
    fn oversized_header_line_is_rejected() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Big: "[..]);
        buf.extend_from_slice("v".repeat(MAX_HEADER_LINE).as_bytes());
        buf.extend_from_slice(b"\r\n\r\n");
        assert_eq!(parse_request(&mut buf, 1 << 20), Err(ParseError::TooLarge));
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\nHost: a\r\n\r\n"[..]);
        let parsed = parse_request(&mut buf, 8192).unwrap().unwrap();
        assert!(!parsed.keep_alive);

        let mut buf =
            BytesMut::from(&b"GET / HTTP/1.0\r\nHost: a\r\nConnection: keep-alive\r\n\r\n"[..]);
        let parsed = parse_request(&mut buf, 8192).unwrap().unwrap();
        assert!(parsed.keep_alive);
    }

    #[test]
    fn request_body_framings() {
        let mut buf = BytesMut::from(
            &b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello"[..],
        );
        let parsed = parse_request(&mut buf, 8192).unwrap().unwrap();
        assert_eq!(parsed.body, BodyLength::Known(5));

        let mut buf = BytesMut::from(
            &b"POST /u HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n"[..],
        );
        let parsed = parse_request(&mut buf, 8192).unwrap().unwrap();
        assert_eq!(parsed.body, BodyLength::Chunked);
    }

    #[test]
    fn response_close_delimited_when_unframed() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\nbody until close"[..]);
        let parsed = parse_response(&mut buf, &Method::GET, 8192).unwrap().unwrap();
        assert_eq!(parsed.body, BodyLength::CloseDelimited);
        assert!(parsed.keep_alive);
    }

    #[test]
    fn head_and_204_have_no_body() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n"[..]);
        let parsed = parse_response(&mut buf, &Method::HEAD, 8192).unwrap().unwrap();
        assert_eq!(parsed.body, BodyLength::Empty);

        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Content\r\n\r\n"[..]);
        let parsed = parse_response(&mut buf, &Method::GET, 8192).unwrap().unwrap();
        assert_eq!(parsed.body, BodyLength::Empty);
    }

    #[test]
    fn informational_heads_are_skipped() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 102 Processing\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..],
        );
        let parsed = parse_response(&mut buf, &Method::GET, 8192).unwrap().unwrap();
        assert_eq!(parsed.head.status, StatusCode::OK);
        assert_eq!(parsed.body, BodyLength::Known(2));
    }

    #[test]
    fn switching_protocols_wants_upgrade() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n"[..],
        );
        let parsed = parse_response(&mut buf, &Method::GET, 8192).unwrap().unwrap();
        assert!(parsed.wants_upgrade);
        assert!(!parsed.keep_alive);
        assert_eq!(parsed.body, BodyLength::Empty);
    }

    #[test]
    fn encode_request_roundtrips() {
        let mut headers = HeaderMap::new();
        headers.insert("Host", "example.com").unwrap();
        headers.insert("X-CaSe", "kept").unwrap();
        let head = RequestHead {
            method: Method::POST,
            target: "/submit".to_owned(),
            version: Version::HTTP_11,
            headers,
        };
        let mut dst = BytesMut::new();
        encode_request(&head, &mut dst);
        assert_eq!(
            &dst[..],
            &b"POST /submit HTTP/1.1\r\nHost: example.com\r\nX-CaSe: kept\r\n\r\n"[..]
        );
    }

    #[test]
    fn encode_response_has_reason() {
        let head = ResponseHead {
            status: StatusCode::NOT_FOUND,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        };
        let mut dst = BytesMut::new();
        encode_response(&head, &mut dst);
        assert_eq!(&dst[..], &b"HTTP/1.1 404 Not Found\r\n\r\n"[..]);
    }
}
