//! Header-list encoding and decoding over HPACK.
//!
//! Wraps `fluke-hpack`, which owns the dynamic table state per
//! direction, and layers the HTTP/2 header-list rules on top: pseudo
//! headers come first and only first, names are lowercase on the wire,
//! and connection-scoped fields never appear in a block.

use std::fmt;

use http::{Method, StatusCode};

use crate::header::{is_hop_by_hop, HeaderMap, HeaderName, HeaderValue};

/// The pseudo-header fields of a request or response head.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pseudo {
    pub method: Option<Method>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    pub status: Option<StatusCode>,
}

impl Pseudo {
    pub fn request(method: Method, scheme: &str, authority: &str, path: &str) -> Pseudo {
        Pseudo {
            method: Some(method),
            scheme: Some(scheme.to_owned()),
            authority: Some(authority.to_owned()),
            path: Some(path.to_owned()),
            status: None,
        }
    }

    pub fn response(status: StatusCode) -> Pseudo {
        Pseudo {
            status: Some(status),
            ..Pseudo::default()
        }
    }

    pub(crate) fn is_request(&self) -> bool {
        self.method.is_some()
    }
}

/// Why a header block failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderBlockError {
    /// HPACK state is unrecoverable; the connection must go away with
    /// COMPRESSION_ERROR.
    Compression,
    /// The decoded list violates HTTP/2 header-list rules.
    Malformed(&'static str),
    /// The decoded list exceeds the local MAX_HEADER_LIST_SIZE.
    TooLarge,
}

impl fmt::Display for HeaderBlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderBlockError::Compression => f.write_str("header compression state corrupted"),
            HeaderBlockError::Malformed(msg) => write!(f, "malformed header block: {msg}"),
            HeaderBlockError::TooLarge => f.write_str("header list exceeds the advertised limit"),
        }
    }
}

impl std::error::Error for HeaderBlockError {}

/// Outbound header-block encoder; one per session direction.
pub(crate) struct Encoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("hpack::Encoder").finish()
    }
}

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder {
            inner: fluke_hpack::Encoder::new(),
        }
    }

    /// Encode one complete header list: pseudo fields first, then the
    /// regular fields lowercased, with connection-scoped fields dropped.
    pub(crate) fn encode(&mut self, pseudo: &Pseudo, headers: &HeaderMap) -> Vec<u8> {
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 4);
        if let Some(method) = &pseudo.method {
            fields.push((b":method".to_vec(), method.as_str().as_bytes().to_vec()));
        }
        if let Some(scheme) = &pseudo.scheme {
            fields.push((b":scheme".to_vec(), scheme.as_bytes().to_vec()));
        }
        if let Some(authority) = &pseudo.authority {
            fields.push((b":authority".to_vec(), authority.as_bytes().to_vec()));
        }
        if let Some(path) = &pseudo.path {
            fields.push((b":path".to_vec(), path.as_bytes().to_vec()));
        }
        if let Some(status) = pseudo.status {
            fields.push((b":status".to_vec(), status.as_str().as_bytes().to_vec()));
        }
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name.as_bytes()) {
                continue;
            }
            fields.push((name.to_lowercase(), value.as_bytes().to_vec()));
        }
        self.inner
            .encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())))
    }
}

/// Inbound header-block decoder; one per session direction.
pub(crate) struct Decoder {
    inner: fluke_hpack::Decoder<'static>,
    max_header_list_size: u32,
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("hpack::Decoder").finish()
    }
}

impl Decoder {
    pub(crate) fn new(max_header_list_size: u32) -> Decoder {
        Decoder {
            inner: fluke_hpack::Decoder::new(),
            max_header_list_size,
        }
    }

    /// Decode a full header block (the concatenation of the HEADERS
    /// fragment and every CONTINUATION fragment) into the pseudo fields
    /// and a header map.
    pub(crate) fn decode(
        &mut self,
        block: &[u8],
    ) -> Result<(Pseudo, HeaderMap), HeaderBlockError> {
        let fields = self
            .inner
            .decode(block)
            .map_err(|_| HeaderBlockError::Compression)?;

        let mut pseudo = Pseudo::default();
        let mut headers = HeaderMap::with_capacity(fields.len());
        let mut seen_regular = false;
        let mut list_size: u64 = 0;

        for (name, value) in fields {
            list_size += name.len() as u64 + value.len() as u64 + 32;
            if list_size > self.max_header_list_size as u64 {
                return Err(HeaderBlockError::TooLarge);
            }
            if let Some(stripped) = name.strip_prefix(b":") {
                if seen_regular {
                    return Err(HeaderBlockError::Malformed(
                        "pseudo-header after regular header",
                    ));
                }
                let value = String::from_utf8(value)
                    .map_err(|_| HeaderBlockError::Malformed("non-utf8 pseudo-header"))?;
                match stripped {
                    b"method" => {
                        pseudo.method = Some(
                            value
                                .parse()
                                .map_err(|_| HeaderBlockError::Malformed("bad :method"))?,
                        )
                    }
                    b"scheme" => pseudo.scheme = Some(value),
                    b"authority" => pseudo.authority = Some(value),
                    b"path" => pseudo.path = Some(value),
                    b"status" => {
                        pseudo.status = Some(
                            value
                                .parse()
                                .map_err(|_| HeaderBlockError::Malformed("bad :status"))?,
                        )
                    }
                    _ => return Err(HeaderBlockError::Malformed("unknown pseudo-header")),
                }
                continue;
            }
            seen_regular = true;
            if name.iter().any(u8::is_ascii_uppercase) {
                return Err(HeaderBlockError::Malformed("uppercase header name"));
            }
            if is_hop_by_hop(&name) {
                return Err(HeaderBlockError::Malformed("connection-scoped header"));
            }
            let name = HeaderName::from_bytes(&name)
                .map_err(|_| HeaderBlockError::Malformed("invalid header name"))?;
            let value = HeaderValue::from_bytes(&value)
                .map_err(|_| HeaderBlockError::Malformed("invalid header value"))?;
            headers.append(name, value);
        }

        Ok((pseudo, headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pseudo: &Pseudo, headers: &HeaderMap) -> (Pseudo, HeaderMap) {
        let mut enc = Encoder::new();
        let mut dec = Decoder::new(u32::MAX);
        let block = enc.encode(pseudo, headers);
        dec.decode(&block).unwrap()
    }

    #[test]
    fn request_head_roundtrip() {
        let pseudo = Pseudo::request(Method::GET, "https", "example.com", "/index?q=1");
        let mut headers = HeaderMap::new();
        headers.insert("Accept", "*/*").unwrap();
        headers.insert("X-Trace", "abc").unwrap();

        let (got_pseudo, got_headers) = roundtrip(&pseudo, &headers);
        assert_eq!(got_pseudo, pseudo);
        assert_eq!(got_headers.get_str("accept"), Some("*/*"));
        // names travel lowercased
        assert_eq!(got_headers.iter().nth(1).unwrap().0.as_str(), "x-trace");
    }

    #[test]
    fn hop_by_hop_headers_never_encode() {
        let pseudo = Pseudo::response(StatusCode::OK);
        let mut headers = HeaderMap::new();
        headers.insert("Connection", "keep-alive").unwrap();
        headers.insert("Keep-Alive", "timeout=5").unwrap();
        headers.insert("Transfer-Encoding", "chunked").unwrap();
        headers.insert("Upgrade", "h2c").unwrap();
        headers.insert("Content-Type", "text/plain").unwrap();

        let (_, got) = roundtrip(&pseudo, &headers);
        assert_eq!(got.len(), 1);
        assert_eq!(got.get_str("content-type"), Some("text/plain"));
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let mut enc = fluke_hpack::Encoder::new();
        let block = enc.encode(vec![
            (&b"accept"[..], &b"*/*"[..]),
            (&b":method"[..], &b"GET"[..]),
        ]);
        let mut dec = Decoder::new(u32::MAX);
        assert_eq!(
            dec.decode(&block),
            Err(HeaderBlockError::Malformed(
                "pseudo-header after regular header"
            ))
        );
    }

    #[test]
    fn uppercase_names_are_malformed() {
        let mut enc = fluke_hpack::Encoder::new();
        let block = enc.encode(vec![(&b"Accept"[..], &b"*/*"[..])]);
        let mut dec = Decoder::new(u32::MAX);
        assert!(matches!(
            dec.decode(&block),
            Err(HeaderBlockError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_list_is_rejected() {
        let pseudo = Pseudo::response(StatusCode::OK);
        let mut headers = HeaderMap::new();
        headers.insert("x-large", "v".repeat(1000)).unwrap();
        let mut enc = Encoder::new();
        let block = enc.encode(&pseudo, &headers);
        let mut dec = Decoder::new(128);
        assert_eq!(dec.decode(&block), Err(HeaderBlockError::TooLarge));
    }
}
