//! The HTTP/1.x codec: request/response heads, body framing decisions
//! and keep-alive header handling. Chunked transfer itself lives with
//! the other byte-stream adapters in [`crate::body`].

pub(crate) mod role;

use std::time::Duration;

use crate::header::HeaderMap;

/// How a message body is delimited on an HTTP/1.x connection.
///
/// Decision order: `Transfer-Encoding: chunked` wins, then
/// `Content-Length`, then (for responses on non-keep-alive connections)
/// read-until-close; requests without framing headers have no body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    Empty,
    Known(u64),
    Chunked,
    CloseDelimited,
}

/// Longest accepted header line (name, separator and value).
pub(crate) const MAX_HEADER_LINE: usize = 4096;

/// Most header fields accepted in one message head.
pub(crate) const MAX_HEADERS: usize = 100;

pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
    connection_has(headers, "close")
}

pub(crate) fn connection_keep_alive(headers: &HeaderMap) -> bool {
    connection_has(headers, "keep-alive")
}

pub(crate) fn connection_upgrade(headers: &HeaderMap) -> bool {
    connection_has(headers, "upgrade")
}

fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers.get_all(b"connection").any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// True when the final transfer coding is chunked.
pub(crate) fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    let mut last = None;
    for value in headers.get_all(b"transfer-encoding") {
        if let Some(v) = value.to_str() {
            for coding in v.split(',') {
                let coding = coding.trim();
                if !coding.is_empty() {
                    last = Some(coding.to_ascii_lowercase());
                }
            }
        }
    }
    last.as_deref() == Some("chunked")
}

/// Parse every `Content-Length` header; duplicates must agree.
pub(crate) fn content_length_parse(headers: &HeaderMap) -> Result<Option<u64>, ()> {
    let mut length = None;
    for value in headers.get_all(b"content-length") {
        let parsed = value
            .to_str()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(())?;
        match length {
            None => length = Some(parsed),
            Some(existing) if existing == parsed => {}
            Some(_) => return Err(()),
        }
    }
    Ok(length)
}

/// Parameters of a `Keep-Alive: timeout=…, max=…` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct KeepAlive {
    pub(crate) timeout: Option<Duration>,
    pub(crate) max: Option<u32>,
}

pub(crate) fn parse_keep_alive(headers: &HeaderMap) -> KeepAlive {
    let mut out = KeepAlive::default();
    if let Some(value) = headers.get_str("keep-alive") {
        for param in value.split(',') {
            let param = param.trim();
            if let Some(rest) = param.strip_prefix("timeout=") {
                out.timeout = rest.trim().parse::<u64>().ok().map(Duration::from_secs);
            } else if let Some(rest) = param.strip_prefix("max=") {
                out.max = rest.trim().parse().ok();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, *value).unwrap();
        }
        map
    }

    #[test]
    fn connection_tokens() {
        let map = headers(&[("Connection", "keep-alive, Upgrade")]);
        assert!(connection_keep_alive(&map));
        assert!(connection_upgrade(&map));
        assert!(!connection_close(&map));
    }

    #[test]
    fn chunked_must_be_final_coding() {
        assert!(transfer_encoding_is_chunked(&headers(&[(
            "Transfer-Encoding",
            "gzip, chunked"
        )])));
        assert!(!transfer_encoding_is_chunked(&headers(&[(
            "Transfer-Encoding",
            "chunked, gzip"
        )])));
    }

    #[test]
    fn content_length_duplicates() {
        assert_eq!(
            content_length_parse(&headers(&[("Content-Length", "10")])),
            Ok(Some(10))
        );
        assert_eq!(
            content_length_parse(&headers(&[
                ("Content-Length", "10"),
                ("Content-Length", "10")
            ])),
            Ok(Some(10))
        );
        assert!(content_length_parse(&headers(&[
            ("Content-Length", "10"),
            ("Content-Length", "11")
        ]))
        .is_err());
        assert!(content_length_parse(&headers(&[("Content-Length", "ten")])).is_err());
    }

    #[test]
    fn keep_alive_params() {
        let ka = parse_keep_alive(&headers(&[("Keep-Alive", "timeout=5, max=99")]));
        assert_eq!(ka.timeout, Some(Duration::from_secs(5)));
        assert_eq!(ka.max, Some(99));
    }
}
