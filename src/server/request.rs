//! The request object handed to server handlers.

use std::net::SocketAddr;

use http::{Method, Version};

use crate::body::Body;
use crate::cookie::parse_cookie_header;
use crate::header::HeaderMap;

/// An incoming request.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) scheme: &'static str,
    pub(crate) authority: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) cookies: Vec<(String, String)>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        scheme: &'static str,
        authority: String,
        target: &str,
        version: Version,
        headers: HeaderMap,
        body: Body,
        peer_addr: Option<SocketAddr>,
        parse_cookies: bool,
    ) -> Request {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        let cookies = if parse_cookies {
            headers
                .get_all(b"cookie")
                .filter_map(|v| v.to_str())
                .flat_map(parse_cookie_header)
                .collect()
        } else {
            Vec::new()
        };
        Request {
            method,
            scheme,
            authority,
            path,
            query,
            version,
            headers,
            body,
            peer_addr,
            cookies,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL scheme the request arrived on.
    pub fn scheme(&self) -> &str {
        self.scheme
    }

    /// The authority (`Host` header, or `:authority`).
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The decoded request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The protocol version of the exchange.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Cookies sent with the request, when cookie parsing is enabled.
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// The value of one cookie.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The streaming request body.
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Take ownership of the request body.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_splits_path_and_query() {
        let req = Request::new(
            Method::GET,
            "http",
            "example.com".into(),
            "/a/b?x=1",
            Version::HTTP_11,
            HeaderMap::new(),
            Body::empty(),
            None,
            true,
        );
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("x=1"));
    }

    #[test]
    fn cookies_parse_when_enabled() {
        let mut headers = HeaderMap::new();
        headers.insert("Cookie", "sid=abc; theme=dark").unwrap();
        let req = Request::new(
            Method::GET,
            "http",
            "example.com".into(),
            "/",
            Version::HTTP_11,
            headers,
            Body::empty(),
            None,
            true,
        );
        assert_eq!(req.cookie("sid"), Some("abc"));
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("missing"), None);
    }
}
