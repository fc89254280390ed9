//! Client response type.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{StatusCode, Version};
use url::Url;

use crate::body::Body;
use crate::cookie::Cookie;
use crate::header::HeaderMap;
use crate::proto::h1::content_length_parse;
use crate::{Error, Result};

/// A response to a submitted `Request`.
#[derive(Debug)]
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) url: Url,
    pub(crate) body: Body,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl Response {
    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The HTTP version the exchange used.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The final URL of this response, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The peer the response came from.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The declared `Content-Length`, when the response carries one.
    pub fn content_length(&self) -> Option<u64> {
        content_length_parse(&self.headers).ok().flatten()
    }

    /// The cookies set by this response.
    pub fn cookies(&self) -> Vec<Cookie> {
        self.headers
            .get_all(b"set-cookie")
            .filter_map(|value| value.to_str())
            .filter_map(Cookie::parse_set_cookie)
            .collect()
    }

    /// Mutable access to the streaming body.
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Consume the response into its streaming body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Read the full response body.
    pub async fn bytes(self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// Read the full response body as text.
    pub async fn text(self) -> Result<String> {
        self.body.text().await
    }

    /// Turn responses with 4xx/5xx status codes into errors.
    pub fn error_for_status(self) -> Result<Response> {
        if self.status.is_client_error() || self.status.is_server_error() {
            let url = self.url.as_str().parse().ok();
            let mut err = Error::status_code(self.status, "");
            if let Some(uri) = url {
                err = err.with_uri(uri);
            }
            Err(err)
        } else {
            Ok(self)
        }
    }
}
