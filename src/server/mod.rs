//! The HTTP server: accept loops, protocol selection, virtual hosts and
//! per-request handler invocation.
//!
//! Each accepted transport is sniffed once: TLS connections pick their
//! protocol via ALPN, cleartext connections speak HTTP/2 when they open
//! with the 24-octet connection preface and HTTP/1.x otherwise (with the
//! `Upgrade: h2c` dance available from inside an HTTP/1.1 request).

mod request;
mod response;
mod service;

pub use self::request::Request;
pub use self::response::{RawStream, ResponseWriter};
pub use self::service::{ErrorPageHandler, Handler, ServerOptions};

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use log::{debug, trace, warn};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use self::response::ResponseState;
use self::service::default_error_page;
use crate::body::{
    drain_framing, Body, BoxIo, Buffered, ChunkedReader, H1Body, H1Framing, LimitedReader,
    ReadConn, Reclaim, Reclaimed,
};
use crate::header::HeaderMap;
use crate::proto::h1::role::{
    encode_response, parse_request, ParseError, ParsedRequest, ResponseHead,
};
use crate::proto::h1::BodyLength;
use crate::proto::h2::{H2Config, PeerRequest, Pseudo, Session, Settings, PREFACE};
use crate::{Error, Result};

#[cfg(feature = "tls")]
use crate::tls::TlsServerContext;

const INITIAL_REQUEST_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_REQUEST_SIZE: u64 = 2 * 1024 * 1024;
const DEFAULT_MAX_REQUEST_HEADER_SIZE: usize = 8 * 1024;
const DEFAULT_SERVER_STRING: &str = concat!("weft/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
struct ServerConfig {
    host_name: Option<String>,
    max_request_time: Option<Duration>,
    keepalive_timeout: Duration,
    max_request_size: u64,
    max_request_header_size: usize,
    server_string: Option<String>,
    http2_settings: Settings,
    disable_http2: bool,
    options: ServerOptions,
}

struct ServerShared {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    vhosts: HashMap<String, Arc<dyn Handler>>,
    error_pages: ErrorPageHandler,
    #[cfg(feature = "tls")]
    tls: Option<TlsServerContext>,
    sessions: Mutex<Vec<Session>>,
}

impl ServerShared {
    /// Virtual-host dispatch: exact hostname match (port stripped), the
    /// listener default otherwise.
    fn route(&self, authority: &str) -> Arc<dyn Handler> {
        let host = authority
            .rsplit_once(':')
            .map(|(h, p)| if p.chars().all(|c| c.is_ascii_digit()) { h } else { authority })
            .unwrap_or(authority)
            .to_ascii_lowercase();
        self.vhosts
            .get(&host)
            .cloned()
            .unwrap_or_else(|| self.handler.clone())
    }

    fn h2_config(&self) -> H2Config {
        H2Config {
            settings: self.config.http2_settings,
            ping_interval: None,
            max_inactivity: None,
        }
    }

    fn register_session(&self, session: &Session) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|s| !s.is_closed());
        sessions.push(session.clone());
    }
}

/// A running HTTP server.
pub struct Server {
    shared: Arc<ServerShared>,
    local_addrs: Vec<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addrs", &self.local_addrs)
            .finish()
    }
}

impl Server {
    /// A builder to configure a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The first bound address; handy when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.first().copied()
    }

    /// All bound addresses.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Graceful shutdown: stop accepting, advertise the shutdown notice
    /// on live HTTP/2 sessions, wait for in-flight streams.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let sessions: Vec<Session> = {
            let mut guard = self
                .shared
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let mut waiters = Vec::new();
        for session in sessions {
            waiters.push(tokio::spawn(async move {
                session.stop_gracefully().await;
            }));
        }
        for waiter in waiters {
            let _ = waiter.await;
        }
    }
}

/// A builder to configure and start a [`Server`].
#[must_use]
pub struct ServerBuilder {
    config: ServerConfig,
    port: u16,
    bind_addresses: Vec<String>,
    handler: Option<Arc<dyn Handler>>,
    vhosts: HashMap<String, Arc<dyn Handler>>,
    error_pages: ErrorPageHandler,
    #[cfg(feature = "tls")]
    tls: Option<TlsServerContext>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("port", &self.port)
            .field("bind_addresses", &self.bind_addresses)
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> ServerBuilder {
        ServerBuilder::new()
    }
}

impl ServerBuilder {
    /// A builder with library defaults.
    pub fn new() -> ServerBuilder {
        ServerBuilder {
            config: ServerConfig {
                host_name: None,
                max_request_time: None,
                keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
                max_request_size: DEFAULT_MAX_REQUEST_SIZE,
                max_request_header_size: DEFAULT_MAX_REQUEST_HEADER_SIZE,
                server_string: Some(DEFAULT_SERVER_STRING.to_owned()),
                http2_settings: Settings::default(),
                disable_http2: false,
                options: ServerOptions::default(),
            },
            port: 0,
            bind_addresses: Vec::new(),
            handler: None,
            vhosts: HashMap::new(),
            error_pages: Arc::new(default_error_page),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// The port to listen on. Port 0 picks a free one.
    pub fn port(mut self, port: u16) -> ServerBuilder {
        self.port = port;
        self
    }

    /// Add a bind address (without port). May be repeated; the default
    /// is every interface.
    pub fn bind_address<S: Into<String>>(mut self, address: S) -> ServerBuilder {
        self.bind_addresses.push(address.into());
        self
    }

    /// The canonical host name used when a request names no host.
    pub fn host_name<S: Into<String>>(mut self, name: S) -> ServerBuilder {
        self.config.host_name = Some(name.into());
        self
    }

    /// The default request handler.
    pub fn handler<H: Handler>(mut self, handler: H) -> ServerBuilder {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// A handler for one virtual host, matched against the request's
    /// `Host` header or `:authority`.
    pub fn vhost<S: Into<String>, H: Handler>(mut self, host: S, handler: H) -> ServerBuilder {
        self.vhosts
            .insert(host.into().to_ascii_lowercase(), Arc::new(handler));
        self
    }

    /// Cap the wall-clock time of one request.
    pub fn max_request_time(mut self, limit: Duration) -> ServerBuilder {
        self.config.max_request_time = Some(limit);
        self
    }

    /// Idle time allowed between requests on a keep-alive connection.
    pub fn keepalive_timeout(mut self, timeout: Duration) -> ServerBuilder {
        self.config.keepalive_timeout = timeout;
        self
    }

    /// Cap request bodies, in octets.
    pub fn max_request_size(mut self, limit: u64) -> ServerBuilder {
        self.config.max_request_size = limit;
        self
    }

    /// Cap request heads, in octets.
    pub fn max_request_header_size(mut self, limit: usize) -> ServerBuilder {
        self.config.max_request_header_size = limit;
        self
    }

    /// The `Server` header value; `None` suppresses it.
    pub fn server_string<S: Into<String>>(mut self, value: Option<S>) -> ServerBuilder {
        self.config.server_string = value.map(Into::into);
        self
    }

    /// SETTINGS announced on HTTP/2 sessions.
    pub fn http2_settings(mut self, settings: Settings) -> ServerBuilder {
        self.config.http2_settings = settings;
        self
    }

    /// Serve HTTP/1.x only.
    pub fn disable_http2(mut self) -> ServerBuilder {
        self.config.disable_http2 = true;
        self
    }

    /// Request-processing toggles.
    pub fn options(mut self, options: ServerOptions) -> ServerBuilder {
        self.config.options = options;
        self
    }

    /// The error-page builder used for engine-generated responses.
    pub fn error_page_handler(mut self, pages: ErrorPageHandler) -> ServerBuilder {
        self.error_pages = pages;
        self
    }

    /// TLS context with SNI-dispatched virtual-host certificates.
    #[cfg(feature = "tls")]
    pub fn tls_context(mut self, tls: TlsServerContext) -> ServerBuilder {
        self.tls = Some(tls);
        self
    }

    /// Bind the listeners and start serving.
    pub async fn start(self) -> Result<Server> {
        let handler = self
            .handler
            .ok_or_else(|| Error::builder("a request handler is required"))?;
        let shared = Arc::new(ServerShared {
            config: self.config,
            handler,
            vhosts: self.vhosts,
            error_pages: self.error_pages,
            #[cfg(feature = "tls")]
            tls: self.tls,
            sessions: Mutex::new(Vec::new()),
        });

        let addresses = if self.bind_addresses.is_empty() {
            vec!["0.0.0.0".to_owned()]
        } else {
            self.bind_addresses
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut local_addrs = Vec::new();
        for address in addresses {
            let listener = TcpListener::bind((address.as_str(), self.port))
                .await
                .map_err(Error::builder)?;
            let local = listener.local_addr().map_err(Error::builder)?;
            debug!("listening on {local}");
            local_addrs.push(local);
            tokio::spawn(accept_loop(
                listener,
                shared.clone(),
                shutdown_rx.clone(),
            ));
        }

        Ok(Server {
            shared,
            local_addrs,
            shutdown_tx,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    trace!("accepted connection from {peer}");
                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(serve_conn(shared, tcp, peer, shutdown));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => {
                trace!("listener closing");
                return;
            }
        }
    }
}

async fn serve_conn(
    shared: Arc<ServerShared>,
    tcp: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let _ = tcp.set_nodelay(true);

    #[cfg(feature = "tls")]
    if let Some(tls) = shared.tls.clone() {
        // before the client hello there is nothing to answer with
        let accepted =
            match tokio::time::timeout(INITIAL_REQUEST_WAIT, tls.accept(tcp)).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    debug!("tls handshake with {peer} failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!("dropping {peer}: no client hello");
                    return;
                }
            };
        let (stream, alpn) = accepted;
        let io: BoxIo = Box::new(stream);
        if alpn.as_deref() == Some(b"h2".as_slice()) && !shared.config.disable_http2 {
            let session = Session::server(io, shared.h2_config(), Bytes::new());
            serve_h2(shared, session, peer, shutdown).await;
        } else {
            serve_h1(shared, io, BytesMut::new(), "https", peer, shutdown).await;
        }
        return;
    }

    let mut io: BoxIo = Box::new(tcp);

    // sniff: the 24-octet connection preface selects HTTP/2 outright
    let mut sniff = BytesMut::new();
    let is_h2 = loop {
        if !PREFACE.starts_with(&sniff[..sniff.len().min(PREFACE.len())]) {
            break false;
        }
        if sniff.len() >= PREFACE.len() {
            break true;
        }
        use tokio::io::AsyncReadExt;
        match tokio::time::timeout(INITIAL_REQUEST_WAIT, io.read_buf(&mut sniff)).await {
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("read from {peer} failed: {e}");
                return;
            }
            Err(_) => {
                // no initial bytes in time
                respond_raw_timeout(&shared, io).await;
                return;
            }
        }
    };

    if is_h2 && !shared.config.disable_http2 {
        let session = Session::server(io, shared.h2_config(), sniff.freeze());
        serve_h2(shared, session, peer, shutdown).await;
    } else {
        serve_h1(shared, io, sniff, "http", peer, shutdown).await;
    }
}

/// 408 for a connection that never sent its first bytes.
async fn respond_raw_timeout(shared: &Arc<ServerShared>, mut io: BoxIo) {
    let page = (shared.error_pages)(StatusCode::REQUEST_TIMEOUT, "no request received", None);
    let bytes = simple_response(shared, StatusCode::REQUEST_TIMEOUT, &page);
    let _ = io.write_all(&bytes).await;
    let _ = io.shutdown().await;
}

fn simple_response(shared: &Arc<ServerShared>, status: StatusCode, page: &str) -> BytesMut {
    let mut headers = HeaderMap::new();
    let _ = headers.insert("Content-Type", "text/html; charset=UTF-8");
    let _ = headers.insert("Content-Length", page.len().to_string());
    let _ = headers.insert("Connection", "close");
    if let Some(server) = &shared.config.server_string {
        let _ = headers.insert("Server", server.as_str());
    }
    let head = ResponseHead {
        status,
        version: Version::HTTP_11,
        headers,
    };
    let mut out = BytesMut::new();
    encode_response(&head, &mut out);
    out.extend_from_slice(page.as_bytes());
    out
}

async fn respond_error_and_close(
    shared: &Arc<ServerShared>,
    write: &mut WriteHalf<BoxIo>,
    status: StatusCode,
    message: &str,
) {
    let page = (shared.error_pages)(status, message, None);
    let bytes = simple_response(shared, status, &page);
    let _ = write.write_all(&bytes).await;
    let _ = write.flush().await;
    let _ = write.shutdown().await;
}

// ===== HTTP/2 =====

async fn serve_h2(
    shared: Arc<ServerShared>,
    session: Session,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    shared.register_session(&session);
    loop {
        tokio::select! {
            accepted = session.accept() => match accepted {
                Some(request) => {
                    let shared = shared.clone();
                    tokio::spawn(handle_h2_request(shared, request, peer));
                }
                None => break,
            },
            _ = shutdown.changed() => {
                // drain requests already accepted while the session
                // winds down; stop_gracefully waits for their streams
                let stopping = {
                    let session = session.clone();
                    tokio::spawn(async move { session.stop_gracefully().await })
                };
                while let Some(request) = session.accept().await {
                    let shared = shared.clone();
                    tokio::spawn(handle_h2_request(shared, request, peer));
                }
                let _ = stopping.await;
                break;
            }
        }
    }
}

async fn handle_h2_request(shared: Arc<ServerShared>, request: PeerRequest, peer: SocketAddr) {
    let PeerRequest {
        pseudo,
        headers,
        end_stream,
        stream,
    } = request;

    let method = pseudo.method.clone().unwrap_or(Method::GET);
    let scheme: &'static str = match pseudo.scheme.as_deref() {
        Some("https") => "https",
        _ => "http",
    };
    let authority = pseudo
        .authority
        .clone()
        .or_else(|| headers.get_str("host").map(str::to_owned))
        .or_else(|| shared.config.host_name.clone())
        .unwrap_or_default();
    let target = pseudo.path.clone().unwrap_or_else(|| "/".to_owned());

    // a declared oversize body never reaches the handler
    if let Ok(Some(len)) = crate::proto::h1::content_length_parse(&headers) {
        if len > shared.config.max_request_size {
            let mut stream = stream;
            let mut head = HeaderMap::new();
            let _ = head.insert("Content-Length", "0");
            let _ = stream.send_headers(
                Pseudo::response(StatusCode::PAYLOAD_TOO_LARGE),
                head,
                true,
            );
            return;
        }
    }

    let body = if end_stream {
        Body::empty()
    } else {
        Body::h2(stream.clone())
    };
    let is_head = method == Method::HEAD;
    let request = Request::new(
        method,
        scheme,
        authority.clone(),
        &target,
        Version::HTTP_2,
        headers,
        body,
        Some(peer),
        shared.config.options.parse_cookies,
    );

    let state = ResponseState::h2(
        stream.clone(),
        is_head,
        shared.config.server_string.clone(),
    );
    let (resp_tx, resp_rx) = oneshot::channel();
    let writer = ResponseWriter::new(state, resp_tx);

    let handler = shared.route(&authority);
    let invocation = handler.call(request, writer);
    let result = match shared.config.max_request_time {
        Some(limit) => match tokio::time::timeout(limit, invocation).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("request handler")),
        },
        None => invocation.await,
    };

    let Ok(mut state) = resp_rx.await else {
        return;
    };
    finish_response(&shared, &mut state, result.err()).await;
}

// ===== HTTP/1.x =====

async fn serve_h1(
    shared: Arc<ServerShared>,
    io: BoxIo,
    readahead: BytesMut,
    scheme: &'static str,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = tokio::io::split(io);
    let mut conn = Some(Buffered::with_readahead(read_half, readahead));
    let mut write = Some(write_half);
    let mut first = true;

    loop {
        let mut read = match conn.take() {
            Some(read) => read,
            None => return,
        };

        // read and parse one request head
        let wait = if first {
            INITIAL_REQUEST_WAIT
        } else {
            shared.config.keepalive_timeout
        };
        let parsed = loop {
            match parse_request(read.buffer(), shared.config.max_request_header_size) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {}
                Err(ParseError::TooLarge) => {
                    let mut w = write.take().expect("write half held");
                    respond_error_and_close(
                        &shared,
                        &mut w,
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "request head too large",
                    )
                    .await;
                    return;
                }
                Err(ParseError::Malformed(msg)) => {
                    let mut w = write.take().expect("write half held");
                    respond_error_and_close(&shared, &mut w, StatusCode::BAD_REQUEST, msg)
                        .await;
                    return;
                }
            }
            match tokio::time::timeout(wait, read.fill()).await {
                Ok(Ok(0)) => return,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("read from {peer} failed: {e}");
                    return;
                }
                Err(_) => {
                    if first || !read.buffer().is_empty() {
                        // a connection that started a request but never
                        // finished it earns a 408; idle expiry is silent
                        let mut w = write.take().expect("write half held");
                        respond_error_and_close(
                            &shared,
                            &mut w,
                            StatusCode::REQUEST_TIMEOUT,
                            "timed out reading the request",
                        )
                        .await;
                    }
                    return;
                }
            }
        };
        first = false;

        let ParsedRequest {
            head,
            body: body_length,
            keep_alive,
            upgrade,
        } = parsed;

        if head.version == Version::HTTP_11 && !head.headers.contains("host") {
            let mut w = write.take().expect("write half held");
            respond_error_and_close(
                &shared,
                &mut w,
                StatusCode::BAD_REQUEST,
                "request without Host header",
            )
            .await;
            return;
        }
        let authority = head
            .headers
            .get_str("host")
            .map(str::to_owned)
            .or_else(|| shared.config.host_name.clone())
            .unwrap_or_default();

        // the h2c upgrade dance: 101, then the request becomes stream 1.
        // cleartext only; on TLS the protocol was ALPN's call.
        if !shared.config.disable_http2 && scheme == "http" {
            if let Some(proto) = &upgrade {
                if proto.eq_ignore_ascii_case("h2c") {
                    if let Some(settings) = h2c_settings(&head.headers) {
                        let w = write.take().expect("write half held");
                        upgrade_h2c(
                            shared, read, w, head, body_length, settings, authority, scheme,
                            peer, shutdown,
                        )
                        .await;
                        return;
                    }
                }
            }
        }

        if let BodyLength::Known(n) = body_length {
            if n > shared.config.max_request_size {
                let mut w = write.take().expect("write half held");
                respond_error_and_close(
                    &shared,
                    &mut w,
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "request body too large",
                )
                .await;
                return;
            }
        }

        let framing = match body_length {
            BodyLength::Empty => H1Framing::Empty(read),
            BodyLength::Known(n) => H1Framing::Limited(LimitedReader::new(read, n)),
            BodyLength::Chunked => H1Framing::Chunked(Box::new(ChunkedReader::new(read))),
            // requests without framing have no body
            BodyLength::CloseDelimited => H1Framing::Close(read),
        };
        let (conn_tx, conn_rx) = oneshot::channel::<Reclaimed>();
        let reclaim: Reclaim = Box::new(move |reclaimed| {
            let _ = conn_tx.send(reclaimed);
        });
        let body = Body::h1(H1Body::new(
            framing,
            reclaim,
            Some(shared.config.max_request_size),
        ));

        let method = head.method.clone();
        let is_head = method == Method::HEAD;
        let request = Request::new(
            method,
            scheme,
            authority.clone(),
            &head.target,
            head.version,
            head.headers,
            body,
            Some(peer),
            shared.config.options.parse_cookies,
        );

        let state = ResponseState::h1(
            write.take().expect("write half held"),
            head.version,
            keep_alive,
            Some(shared.config.keepalive_timeout),
            is_head,
            shared.config.server_string.clone(),
        );
        let (resp_tx, resp_rx) = oneshot::channel();
        let writer = ResponseWriter::new(state, resp_tx);

        let handler = shared.route(&authority);
        let invocation = handler.call(request, writer);
        let result = match shared.config.max_request_time {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout("request handler")),
            },
            None => invocation.await,
        };

        let Ok(mut state) = resp_rx.await else {
            return;
        };
        if state.switched {
            // the connection now belongs to the switched protocol
            return;
        }
        let response_keep_alive = finish_response(&shared, &mut state, result.err()).await;
        let Some(write_back) = state.take_write_half() else {
            return;
        };
        write = Some(write_back);

        let Ok(reclaimed) = conn_rx.await else {
            return;
        };
        let read_back = match reclaimed {
            Reclaimed::Clean(conn) => Some(conn),
            // the handler left body octets unread: drain them so the
            // next request starts at a frame boundary
            Reclaimed::Unread(framing) => {
                drain_framing(framing, shared.config.max_request_size).await
            }
            Reclaimed::Broken => None,
        };
        let Some(read_back) = read_back else {
            let mut w = write.take().expect("write half held");
            let _ = w.shutdown().await;
            return;
        };
        if !response_keep_alive || *shutdown.borrow() {
            let mut w = write.take().expect("write half held");
            let _ = w.shutdown().await;
            return;
        }
        conn = Some(read_back);
    }
}

fn h2c_settings(headers: &HeaderMap) -> Option<Settings> {
    let raw = headers.get_str("http2-settings")?;
    let payload = URL_SAFE_NO_PAD.decode(raw).ok()?;
    Settings::parse_payload(&payload).ok()
}

#[allow(clippy::too_many_arguments)]
async fn upgrade_h2c(
    shared: Arc<ServerShared>,
    mut read: ReadConn,
    mut write: WriteHalf<BoxIo>,
    head: crate::proto::h1::role::RequestHead,
    body_length: BodyLength,
    peer_settings: Settings,
    authority: String,
    scheme: &'static str,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    // the whole request body must be in hand before switching
    let body = match read_body_fully(&mut read, body_length, shared.config.max_request_size).await
    {
        Ok(body) => body,
        Err(status) => {
            respond_error_and_close(&shared, &mut write, status, "request body rejected").await;
            return;
        }
    };

    let response = b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n";
    if write.write_all(response).await.is_err() || write.flush().await.is_err() {
        return;
    }
    debug!("connection from {peer} upgraded to http2");

    // whatever followed the request head is the start of the preface
    let (read_half, leftover) = {
        let leftover = read.buffer().split();
        let (half, _) = read.into_parts();
        (half, leftover)
    };
    let io = read_half.unsplit(write);

    let mut head = head;
    for name in ["connection", "upgrade", "http2-settings", "keep-alive"] {
        head.headers.remove(name);
    }
    let pseudo = Pseudo::request(head.method, scheme, &authority, &head.target);
    let session = Session::server_upgraded(
        io,
        shared.h2_config(),
        leftover.freeze(),
        peer_settings,
        pseudo,
        head.headers,
        body,
    );
    serve_h2(shared, session, peer, shutdown).await;
}

async fn read_body_fully(
    read: &mut ReadConn,
    body_length: BodyLength,
    max: u64,
) -> std::result::Result<Bytes, StatusCode> {
    use tokio::io::AsyncReadExt;
    match body_length {
        BodyLength::Empty | BodyLength::CloseDelimited => Ok(Bytes::new()),
        BodyLength::Known(n) => {
            if n > max {
                return Err(StatusCode::PAYLOAD_TOO_LARGE);
            }
            let mut reader = LimitedReader::new(&mut *read, n);
            let mut out = Vec::with_capacity(n as usize);
            reader
                .read_to_end(&mut out)
                .await
                .map_err(|_| StatusCode::BAD_REQUEST)?;
            Ok(Bytes::from(out))
        }
        BodyLength::Chunked => {
            let mut reader = ChunkedReader::new(&mut *read);
            let mut out = Vec::new();
            let mut buf = [0u8; 8 * 1024];
            loop {
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|_| StatusCode::BAD_REQUEST)?;
                if n == 0 {
                    return Ok(Bytes::from(out));
                }
                out.extend_from_slice(&buf[..n]);
                if out.len() as u64 > max {
                    return Err(StatusCode::PAYLOAD_TOO_LARGE);
                }
            }
        }
    }
}

/// Complete a response the handler left unfinished, or serialize an
/// error page for a failed one. Returns whether the connection may be
/// kept alive.
async fn finish_response(
    shared: &Arc<ServerShared>,
    state: &mut ResponseState,
    error: Option<Error>,
) -> bool {
    if state.switched {
        return false;
    }
    match error {
        None => match state.complete().await {
            Ok(keep_alive) => keep_alive,
            Err(e) => {
                debug!("finishing response failed: {e}");
                false
            }
        },
        Some(err) => {
            if state.head_sent {
                // mid-stream failure: nothing to repair, cut the
                // connection so the truncation is visible
                debug!("handler failed after response bytes went out: {err}");
                state.keep_alive = false;
                let _ = state.complete().await;
                return false;
            }
            let status = err
                .status()
                .unwrap_or_else(|| if err.is_timeout() {
                    StatusCode::REQUEST_TIMEOUT
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                });
            let message = if err.status_message().is_empty() {
                status.canonical_reason().unwrap_or("error").to_owned()
            } else {
                err.status_message().to_owned()
            };
            let detail = if shared.config.options.error_stack_traces {
                Some(format!("{err:?}"))
            } else {
                None
            };
            let page = (shared.error_pages)(status, &message, detail.as_deref());
            state.status = status;
            state.headers.remove("content-length");
            let _ = state
                .headers
                .insert("Content-Type", "text/html; charset=UTF-8");
            let _ = state.headers.insert("Content-Length", page.len().to_string());
            if state.write(page.as_bytes()).await.is_err() {
                return false;
            }
            state.complete().await.unwrap_or(false)
        }
    }
}
