//! Client request type and builder.

use std::time::Duration;

use http::Method;
use url::Url;

use super::Client;
use crate::body::Body;
use crate::header::HeaderMap;
use crate::{Error, Result};

use super::response::Response;

/// A request which can be executed with `Client::execute()`.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) timeout: Option<Duration>,
    /// Ask the server to close the connection after this exchange.
    pub(crate) close: bool,
}

impl Request {
    /// Constructs a new request.
    pub fn new(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::empty(),
            timeout: None,
            close: false,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The request body.
    pub fn body(&self) -> &Body {
        &self.body
    }
}

/// A builder to construct the properties of a `Request`.
#[derive(Debug)]
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, url: &str) -> RequestBuilder {
        let request = Url::parse(url)
            .map_err(Error::builder)
            .and_then(|url| match url.scheme() {
                "http" | "https" => Ok(Request::new(method, url)),
                _ => Err(Error::builder("unsupported URL scheme")),
            });
        RequestBuilder { client, request }
    }

    /// Add a header to this request.
    pub fn header<N, V>(mut self, name: N, value: V) -> RequestBuilder
    where
        N: TryInto<crate::header::HeaderName, Error = crate::header::InvalidHeader>,
        V: TryInto<crate::header::HeaderValue, Error = crate::header::InvalidHeader>,
    {
        if let Ok(request) = &mut self.request {
            if let Err(e) = request.headers.insert(name, value) {
                self.request = Err(Error::builder(e));
            }
        }
        self
    }

    /// Replace all request headers.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(request) = &mut self.request {
            request.headers = headers;
        }
        self
    }

    /// Set the request body.
    pub fn body<B: Into<Body>>(mut self, body: B) -> RequestBuilder {
        if let Ok(request) = &mut self.request {
            request.body = body.into();
        }
        self
    }

    /// Stream the request body from a channel; the returned sender feeds
    /// it chunk by chunk.
    pub fn body_channel(mut self) -> (crate::body::BodySender, RequestBuilder) {
        let (sender, body) = Body::channel();
        if let Ok(request) = &mut self.request {
            request.body = body;
        }
        (sender, self)
    }

    /// Cap the total time of this exchange.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(request) = &mut self.request {
            request.timeout = Some(timeout);
        }
        self
    }

    /// Ask for the connection to be closed after the exchange instead of
    /// returning it to the pool.
    pub fn connection_close(mut self) -> RequestBuilder {
        if let Ok(request) = &mut self.request {
            request.close = true;
        }
        self
    }

    /// Build the `Request` without sending it.
    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Send the request, following redirects per the client policy.
    pub async fn send(self) -> Result<Response> {
        let request = self.request?;
        self.client.execute(request).await
    }
}
