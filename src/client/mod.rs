//! The asynchronous HTTP client: connection pooling, keep-alive reuse,
//! redirects, cookies, and opportunistic HTTP/2 over ALPN or the h2c
//! cleartext upgrade.

mod conn;
mod pool;
mod request;
mod response;

pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;

use std::{sync::Arc, time::Duration};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::BytesMut;
use http::{Method, StatusCode, Version};
use log::{debug, trace};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use url::Url;

use self::conn::Http1Conn;
use self::pool::{Pool, PoolKey};
use crate::body::{Body, BoxIo, ChunkedWriter, H1Body, H1Framing, Reclaim, Reclaimed};
use crate::body::{ChunkedReader, LimitedReader};
use crate::cookie::CookieStore;
use crate::header::{HeaderMap, HeaderName, HeaderValue};
use crate::proto::h1::role::{encode_request, parse_response, ParseError, RequestHead};
use crate::proto::h1::{parse_keep_alive, BodyLength};
use crate::proto::h2::{H2Config, Pseudo, Session, Settings};
use crate::{Error, Result};

#[cfg(feature = "tls")]
use crate::tls::TlsClientContext;

const DEFAULT_USER_AGENT: &str = concat!("weft/", env!("CARGO_PKG_VERSION"));
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(90);
const DEFAULT_MAX_REDIRECTS: u32 = 10;
const MAX_RESPONSE_HEAD: usize = 64 * 1024;
/// Most octets drained from an abandoned body to save its connection.
const MAX_DRAIN: u64 = 256 * 1024;

/// HTTP/2 behavior of a client.
#[derive(Debug, Clone)]
pub struct H2ClientConfig {
    /// Speak HTTP/2 with prior knowledge on cleartext connections.
    pub forced: bool,
    /// Never use HTTP/2.
    pub disabled: bool,
    /// Do not attempt the `Upgrade: h2c` dance on cleartext connections.
    pub disable_cleartext_upgrade: bool,
    /// Keep-alive PING interval for idle sessions.
    pub ping_interval: Option<Duration>,
    /// Session inactivity teardown.
    pub max_inactivity: Option<Duration>,
    /// Settings announced to servers.
    pub settings: Settings,
    /// Protocols offered via ALPN, in preference order.
    pub alpn: Vec<String>,
}

impl Default for H2ClientConfig {
    fn default() -> H2ClientConfig {
        H2ClientConfig {
            forced: false,
            disabled: false,
            disable_cleartext_upgrade: false,
            ping_interval: None,
            max_inactivity: None,
            settings: Settings::default(),
            alpn: vec!["h2".to_owned(), "http/1.1".to_owned()],
        }
    }
}

#[derive(Debug, Clone)]
struct Config {
    user_agent: String,
    default_keepalive: Duration,
    max_redirects: u32,
    timeout: Option<Duration>,
    proxy_url: Option<Url>,
    h2: H2ClientConfig,
}

struct ClientInner {
    config: Config,
    pool: Pool,
    cookie_jar: Option<Arc<dyn CookieStore>>,
    #[cfg(feature = "tls")]
    tls: Option<TlsClientContext>,
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish()
    }
}

/// An asynchronous HTTP client.
///
/// The client holds the connection pool, so constructing one per request
/// forfeits keep-alive; create it once and clone it freely, clones share
/// the pool.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl Client {
    /// A client with default configuration.
    pub fn new() -> Client {
        Client::builder().build()
    }

    /// A builder to configure a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Start a GET request.
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Start a POST request.
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Start a PUT request.
    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Start a DELETE request.
    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Start a HEAD request.
    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start a request with the given method.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    /// Execute a request, following same-origin redirects up to the
    /// configured limit. A cross-origin 3xx is returned to the caller.
    pub async fn execute(&self, mut request: Request) -> Result<Response> {
        let mut redirects = 0;
        let replay = request.body.as_full();
        loop {
            if let Some(jar) = &self.inner.cookie_jar {
                request.headers.remove("cookie");
                if let Some(header) = jar.cookies(&request.url) {
                    let value = HeaderValue::from_bytes(header.as_bytes())
                        .map_err(Error::builder)?;
                    request
                        .headers
                        .append(HeaderName::from_static("Cookie"), value);
                }
            }

            let timeout = request.timeout.or(self.inner.config.timeout);
            let response = match timeout {
                Some(limit) => tokio::time::timeout(limit, self.send_once(&mut request))
                    .await
                    .map_err(|_| Error::timeout("request"))??,
                None => self.send_once(&mut request).await?,
            };

            if let Some(jar) = &self.inner.cookie_jar {
                let mut set_cookies = response
                    .headers
                    .get_all(b"set-cookie")
                    .filter_map(|v| v.to_str());
                jar.set_cookies(&mut set_cookies, &request.url);
            }

            let Some(location) = redirect_location(&response) else {
                return Ok(response);
            };
            let target = match request.url.join(&location) {
                Ok(url) => url,
                Err(_) => return Ok(response),
            };
            if !same_origin(&request.url, &target) {
                trace!("cross-origin redirect to {target} surfaces to the caller");
                return Ok(response);
            }
            redirects += 1;
            if redirects > self.inner.config.max_redirects {
                return Err(Error::redirect(
                    "too many redirects",
                    uri_of(&target),
                ));
            }
            debug!("following redirect {} -> {}", response.status, target);

            let drop_body = response.status == StatusCode::SEE_OTHER
                || (matches!(
                    response.status,
                    StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
                ) && request.method == Method::POST);
            if drop_body {
                request.method = Method::GET;
                request.body = Body::empty();
            } else {
                request.body = match &replay {
                    Some(bytes) => Body::from(bytes.clone()),
                    None => {
                        return Err(Error::redirect(
                            "cannot replay a streaming body",
                            uri_of(&target),
                        ))
                    }
                };
            }
            request.url = target;
        }
    }

    async fn send_once(&self, request: &mut Request) -> Result<Response> {
        let url = request.url.clone();
        let host = url
            .host_str()
            .ok_or_else(|| Error::builder("URL has no host"))?
            .to_owned();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::builder("URL has no port"))?;
        let https = url.scheme() == "https";
        let key: PoolKey = (if https { "https" } else { "http" }, host.clone(), port);

        // an existing session first: a lock is just a stream slot
        if let Some(session) = self.inner.pool.h2(&key) {
            trace!("reusing pooled http2 session for {key:?}");
            return self.send_h2(session, request, &url, None).await;
        }

        if let Some(conn) = self.inner.pool.checkout_h1(&key) {
            trace!("reusing pooled connection for {key:?}");
            return self.send_h1(conn, request, &url, key, false).await;
        }

        let (dial_host, dial_port, via_proxy) = match &self.inner.config.proxy_url {
            Some(proxy) => {
                let proxy_host = proxy
                    .host_str()
                    .ok_or_else(|| Error::builder("proxy URL has no host"))?
                    .to_owned();
                let proxy_port = proxy.port_or_known_default().unwrap_or(8080);
                (proxy_host, proxy_port, true)
            }
            None => (host.clone(), port, false),
        };

        let tcp = TcpStream::connect((dial_host.as_str(), dial_port))
            .await
            .map_err(Error::request)?;
        let _ = tcp.set_nodelay(true);
        let remote_addr = tcp.peer_addr().ok();

        let h2cfg = self.h2_config();

        if https {
            #[cfg(feature = "tls")]
            {
                let io: BoxIo = if via_proxy {
                    Box::new(self.connect_tunnel(tcp, &host, port).await?)
                } else {
                    Box::new(tcp)
                };
                let tls = self
                    .inner
                    .tls
                    .as_ref()
                    .ok_or_else(|| Error::builder("no TLS context configured"))?;
                let alpn: Vec<String> = if self.inner.config.h2.disabled {
                    vec!["http/1.1".to_owned()]
                } else {
                    self.inner.config.h2.alpn.clone()
                };
                let (stream, proto) = tls.handshake(&host, io, &alpn).await?;
                let io: BoxIo = Box::new(stream);
                let h2_negotiated = matches!(
                    proto.as_deref(),
                    Some(p) if p == b"h2" || p == b"h2-14" || p == b"h2-16"
                );
                if h2_negotiated {
                    let session = Session::client(io, h2cfg);
                    self.inner.pool.set_h2(key.clone(), session.clone());
                    return self.send_h2(session, request, &url, remote_addr).await;
                }
                let conn =
                    Http1Conn::new(io, remote_addr, self.inner.config.default_keepalive);
                return self.send_h1(conn, request, &url, key, false).await;
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(Error::builder("https requires the `tls` feature"));
            }
        }

        let io: BoxIo = Box::new(tcp);
        if self.inner.config.h2.forced && !self.inner.config.h2.disabled {
            let session = Session::client(io, h2cfg);
            self.inner.pool.set_h2(key.clone(), session.clone());
            return self.send_h2(session, request, &url, remote_addr).await;
        }
        let conn = Http1Conn::new(io, remote_addr, self.inner.config.default_keepalive);
        let try_upgrade = !self.inner.config.h2.disabled
            && !self.inner.config.h2.disable_cleartext_upgrade
            && !via_proxy
            && request.body.size_hint() == Some(0);
        self.send_h1(conn, request, &url, key, try_upgrade).await
    }

    /// Establish a CONNECT tunnel through the configured proxy.
    #[cfg(feature = "tls")]
    async fn connect_tunnel(
        &self,
        tcp: TcpStream,
        host: &str,
        port: u16,
    ) -> Result<crate::body::Buffered<TcpStream>> {
        let mut io = crate::body::Buffered::new(tcp);
        let connect = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
        );
        io.inner_mut()
            .write_all(connect.as_bytes())
            .await
            .map_err(Error::request)?;
        loop {
            if let Some(parsed) =
                parse_response(io.buffer(), &Method::CONNECT, MAX_RESPONSE_HEAD)
                    .map_err(Error::upgrade)?
            {
                if !parsed.head.status.is_success() {
                    return Err(Error::upgrade("proxy refused the tunnel"));
                }
                return Ok(io);
            }
            if io.fill().await.map_err(Error::request)? == 0 {
                return Err(Error::closed("proxy closed during CONNECT"));
            }
        }
    }

    fn h2_config(&self) -> H2Config {
        H2Config {
            settings: self.inner.config.h2.settings,
            ping_interval: self.inner.config.h2.ping_interval,
            max_inactivity: self.inner.config.h2.max_inactivity,
        }
    }

    async fn send_h1(
        &self,
        mut conn: Http1Conn,
        request: &mut Request,
        url: &Url,
        key: PoolKey,
        try_upgrade: bool,
    ) -> Result<Response> {
        let mut headers = request.headers.clone();
        if !headers.contains("host") {
            let host_value = host_header(url);
            headers.insert("Host", host_value.as_str()).map_err(Error::builder)?;
        }
        if !headers.contains("user-agent") {
            headers
                .insert("User-Agent", self.inner.config.user_agent.as_str())
                .map_err(Error::builder)?;
        }

        let body_len = request.body.size_hint();
        match body_len {
            Some(0) => {}
            Some(n) => {
                if !headers.contains("content-length") {
                    headers
                        .insert("Content-Length", n.to_string())
                        .map_err(Error::builder)?;
                }
            }
            None => {
                if !headers.contains("transfer-encoding") {
                    headers
                        .insert("Transfer-Encoding", "chunked")
                        .map_err(Error::builder)?;
                }
            }
        }
        if request.close {
            headers.insert("Connection", "close").map_err(Error::builder)?;
        } else if try_upgrade {
            let settings_payload = self.inner.config.h2.settings.pack_payload();
            headers
                .insert("Connection", "Upgrade, HTTP2-Settings")
                .map_err(Error::builder)?;
            headers.insert("Upgrade", "h2c").map_err(Error::builder)?;
            headers
                .insert("HTTP2-Settings", URL_SAFE_NO_PAD.encode(&settings_payload))
                .map_err(Error::builder)?;
        }

        let target = if self.inner.config.proxy_url.is_some() && url.scheme() == "http" {
            // absolute-form, for the forward proxy
            url.as_str().to_owned()
        } else {
            origin_form(url)
        };
        let head = RequestHead {
            method: request.method.clone(),
            target,
            version: Version::HTTP_11,
            headers,
        };

        let mut out = BytesMut::new();
        encode_request(&head, &mut out);
        conn.write.write_all(&out).await.map_err(Error::request)?;

        // the body, framed to match the headers we just sent
        match body_len {
            Some(0) => {}
            Some(_) => {
                let mut body = std::mem::take(&mut request.body);
                while let Some(chunk) = body.data().await? {
                    conn.write.write_all(&chunk).await.map_err(Error::request)?;
                }
            }
            None => {
                let mut body = std::mem::take(&mut request.body);
                let mut writer = ChunkedWriter::new(&mut conn.write);
                while let Some(chunk) = body.data().await? {
                    writer.write_chunk(&chunk).await.map_err(Error::request)?;
                }
                writer.finish(None).await.map_err(Error::request)?;
            }
        }
        conn.write.flush().await.map_err(Error::request)?;

        // response head
        let parsed = loop {
            match parse_response(conn.read.buffer(), &request.method, MAX_RESPONSE_HEAD) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {
                    if conn.read.fill().await.map_err(Error::request)? == 0 {
                        self.inner.pool.purge(&key);
                        return Err(Error::closed("server closed before responding"));
                    }
                }
                Err(ParseError::TooLarge) => {
                    return Err(Error::validation("response head too large"))
                }
                Err(ParseError::Malformed(msg)) => return Err(Error::validation(msg)),
            }
        };

        conn.requests_made += 1;
        let ka = parse_keep_alive(&parsed.head.headers);
        if let Some(timeout) = ka.timeout {
            conn.keepalive = timeout;
        }
        if ka.max.is_some() {
            conn.max_requests = ka.max;
        }

        // 101 Switching Protocols: the request's response arrives as
        // stream 1 of the new HTTP/2 session
        if parsed.head.status == StatusCode::SWITCHING_PROTOCOLS {
            let upgraded_h2 = parsed
                .head
                .headers
                .get_str("upgrade")
                .map(|u| u.eq_ignore_ascii_case("h2c"))
                .unwrap_or(false);
            if !(try_upgrade && upgraded_h2) {
                return Err(Error::upgrade("unexpected 101 response"));
            }
            debug!("cleartext upgrade to http2 accepted by {key:?}");
            let remote_addr = conn.remote_addr;
            let leftover = conn.read.buffer().split().freeze();
            let (read_half, _) = conn.read.into_parts();
            let io = read_half.unsplit(conn.write);
            let (session, mut stream) =
                Session::client_upgraded(io, self.h2_config(), leftover);
            self.inner.pool.set_h2(key, session);
            let (pseudo, resp_headers) = stream.read_headers().await?;
            let status = pseudo
                .status
                .ok_or_else(|| Error::decode("response without :status"))?;
            return Ok(Response {
                status,
                version: Version::HTTP_2,
                headers: resp_headers,
                url: url.clone(),
                body: Body::h2(stream),
                remote_addr,
            });
        }

        let keep_alive = parsed.keep_alive && !request.close;
        let Http1Conn {
            read,
            write,
            remote_addr,
            requests_made,
            max_requests,
            keepalive,
            ..
        } = conn;

        let reclaim: Reclaim = {
            let inner = self.inner.clone();
            Box::new(move |reclaimed| {
                let checkin = move |read_conn| {
                    inner.pool.checkin_h1(
                        key,
                        Http1Conn::reassemble(
                            read_conn,
                            write,
                            remote_addr,
                            requests_made,
                            max_requests,
                            keepalive,
                        ),
                    );
                };
                match reclaimed {
                    Reclaimed::Clean(read_conn) if keep_alive => checkin(read_conn),
                    Reclaimed::Unread(framing) if keep_alive => {
                        // the body was dropped part-way: drain it in the
                        // background, then pool the connection
                        if let Ok(handle) = tokio::runtime::Handle::try_current() {
                            handle.spawn(async move {
                                if let Some(read_conn) =
                                    crate::body::drain_framing(framing, MAX_DRAIN).await
                                {
                                    checkin(read_conn);
                                }
                            });
                        }
                    }
                    _ => trace!("connection not reusable, dropping"),
                }
            })
        };

        let framing = match parsed.body {
            BodyLength::Empty => H1Framing::Empty(read),
            BodyLength::Known(n) => H1Framing::Limited(LimitedReader::new(read, n)),
            BodyLength::Chunked => H1Framing::Chunked(Box::new(ChunkedReader::new(read))),
            BodyLength::CloseDelimited => H1Framing::Close(read),
        };

        Ok(Response {
            status: parsed.head.status,
            version: parsed.head.version,
            headers: parsed.head.headers,
            url: url.clone(),
            body: Body::h1(H1Body::new(framing, reclaim, None)),
            remote_addr,
        })
    }

    async fn send_h2(
        &self,
        session: Session,
        request: &mut Request,
        url: &Url,
        remote_addr: Option<std::net::SocketAddr>,
    ) -> Result<Response> {
        let path = origin_form(url);
        let pseudo = Pseudo::request(
            request.method.clone(),
            url.scheme(),
            &host_header(url),
            &path,
        );
        let mut headers = request.headers.clone();
        if !headers.contains("user-agent") {
            headers
                .insert("User-Agent", self.inner.config.user_agent.as_str())
                .map_err(Error::builder)?;
        }
        let end_stream = request.body.size_hint() == Some(0);
        let mut stream = session.start_request(pseudo, headers, end_stream)?;

        if !end_stream {
            let mut body = std::mem::take(&mut request.body);
            while let Some(chunk) = body.data().await? {
                stream.write(&chunk).await?;
            }
            stream.finalize().await?;
        }

        let (resp_pseudo, resp_headers) = stream.read_headers().await?;
        let status = resp_pseudo
            .status
            .ok_or_else(|| Error::decode("response without :status"))?;
        Ok(Response {
            status,
            version: Version::HTTP_2,
            headers: resp_headers,
            url: url.clone(),
            body: Body::h2(stream),
            remote_addr,
        })
    }
}

fn redirect_location(response: &Response) -> Option<String> {
    if !matches!(
        response.status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return None;
    }
    response.headers.get_str("location").map(str::to_owned)
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_owned(),
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match (url.port(), url.scheme()) {
        (Some(port), _) => format!("{host}:{port}"),
        (None, _) => host.to_owned(),
    }
}

fn uri_of(url: &Url) -> http::Uri {
    url.as_str().parse().unwrap_or_default()
}

/// A builder to configure a [`Client`].
#[must_use]
pub struct ClientBuilder {
    config: Config,
    cookie_jar: Option<Arc<dyn CookieStore>>,
    #[cfg(feature = "tls")]
    tls: Option<TlsClientContext>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("cookie_jar", &self.cookie_jar.is_some())
            .finish()
    }
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl ClientBuilder {
    /// A builder with library defaults.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                user_agent: DEFAULT_USER_AGENT.to_owned(),
                default_keepalive: DEFAULT_KEEPALIVE,
                max_redirects: DEFAULT_MAX_REDIRECTS,
                timeout: None,
                proxy_url: None,
                h2: H2ClientConfig::default(),
            },
            cookie_jar: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Sets the `User-Agent` header used by this client.
    pub fn user_agent<S: Into<String>>(mut self, agent: S) -> ClientBuilder {
        self.config.user_agent = agent.into();
        self
    }

    /// Sets the idle keep-alive allowance assumed until a peer declares
    /// its own.
    pub fn default_keepalive(mut self, keepalive: Duration) -> ClientBuilder {
        self.config.default_keepalive = keepalive;
        self
    }

    /// Caps the number of same-origin redirects to follow.
    pub fn max_redirects(mut self, max: u32) -> ClientBuilder {
        self.config.max_redirects = max;
        self
    }

    /// Caps the total time of every request made by this client.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.timeout = Some(timeout);
        self
    }

    /// Routes cleartext requests through a forward proxy, and https
    /// requests through a CONNECT tunnel to it.
    pub fn proxy(mut self, proxy: Url) -> ClientBuilder {
        self.config.proxy_url = Some(proxy);
        self
    }

    /// Installs the default in-memory cookie jar.
    pub fn cookie_store(mut self, enable: bool) -> ClientBuilder {
        self.cookie_jar = if enable {
            Some(Arc::new(crate::cookie::Jar::new()))
        } else {
            None
        };
        self
    }

    /// Installs a custom cookie store.
    pub fn cookie_provider(mut self, jar: Arc<dyn CookieStore>) -> ClientBuilder {
        self.cookie_jar = Some(jar);
        self
    }

    /// Sets the TLS context used for https requests.
    #[cfg(feature = "tls")]
    pub fn tls_context(mut self, tls: TlsClientContext) -> ClientBuilder {
        self.tls = Some(tls);
        self
    }

    /// Replaces the whole HTTP/2 configuration.
    pub fn http2(mut self, h2: H2ClientConfig) -> ClientBuilder {
        self.config.h2 = h2;
        self
    }

    /// Speak HTTP/2 with prior knowledge on cleartext connections.
    pub fn http2_prior_knowledge(mut self) -> ClientBuilder {
        self.config.h2.forced = true;
        self
    }

    /// Never negotiate HTTP/2.
    pub fn http1_only(mut self) -> ClientBuilder {
        self.config.h2.disabled = true;
        self
    }

    /// Skip the `Upgrade: h2c` attempt on cleartext connections.
    pub fn disable_cleartext_upgrade(mut self) -> ClientBuilder {
        self.config.h2.disable_cleartext_upgrade = true;
        self
    }

    /// SETTINGS announced on new HTTP/2 sessions.
    pub fn http2_settings(mut self, settings: Settings) -> ClientBuilder {
        self.config.h2.settings = settings;
        self
    }

    /// Keep-alive PING cadence for idle HTTP/2 sessions.
    pub fn http2_ping_interval(mut self, interval: Duration) -> ClientBuilder {
        self.config.h2.ping_interval = Some(interval);
        self
    }

    /// Tear down HTTP/2 sessions after this much read inactivity.
    pub fn http2_max_inactivity(mut self, limit: Duration) -> ClientBuilder {
        self.config.h2.max_inactivity = Some(limit);
        self
    }

    /// Builds the client.
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                pool: Pool::new(),
                cookie_jar: self.cookie_jar,
                #[cfg(feature = "tls")]
                tls: self.tls,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_keeps_query() {
        let url = Url::parse("http://example.com/a/b?x=1&y=2").unwrap();
        assert_eq!(origin_form(&url), "/a/b?x=1&y=2");
        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(origin_form(&url), "/");
    }

    #[test]
    fn host_header_includes_explicit_port() {
        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(host_header(&url), "example.com:8080");
        let url = Url::parse("http://example.com/").unwrap();
        assert_eq!(host_header(&url), "example.com");
    }

    #[test]
    fn same_origin_compares_default_ports() {
        let a = Url::parse("http://example.com/").unwrap();
        let b = Url::parse("http://example.com:80/other").unwrap();
        assert!(same_origin(&a, &b));
        let c = Url::parse("https://example.com/").unwrap();
        assert!(!same_origin(&a, &c));
        let d = Url::parse("http://other.example.com/").unwrap();
        assert!(!same_origin(&a, &d));
    }

    #[test]
    fn builder_defaults() {
        let client = Client::new();
        assert_eq!(client.inner.config.max_redirects, DEFAULT_MAX_REDIRECTS);
        assert!(client.inner.config.user_agent.starts_with("weft/"));
        assert!(!client.inner.config.h2.disabled);
    }
}
