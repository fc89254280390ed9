//! The response writer handed to server handlers.
//!
//! All response state lives in a detachable inner record: when the
//! handler finalizes, the record completes itself; when the handler just
//! drops the writer, the record travels back to the connection loop,
//! which finishes whatever is missing (a head, a chunk terminator, an
//! error page).

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::BytesMut;
use http::{StatusCode, Version};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::sync::oneshot;

use crate::body::{BoxIo, ChunkedWriter, ReadConn};
use crate::cookie::{fmt_http_date, Cookie};
use crate::header::{HeaderMap, HeaderName, HeaderValue};
use crate::proto::h1::role::{encode_response, ResponseHead};
use crate::proto::h2::{Pseudo, StreamHandle};
use crate::{Error, Result};

pub(crate) enum Backend {
    H1 {
        write: Option<WriteHalf<BoxIo>>,
        version: Version,
    },
    H2 {
        stream: StreamHandle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutFraming {
    Unset,
    Length,
    Chunked,
    CloseDelimited,
    NoBody,
}

pub(crate) struct ResponseState {
    pub(crate) backend: Backend,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) head_sent: bool,
    pub(crate) finalized: bool,
    pub(crate) switched: bool,
    pub(crate) framing: OutFraming,
    pub(crate) pending: BytesMut,
    pub(crate) declared: Option<u64>,
    pub(crate) written: u64,
    pub(crate) is_head: bool,
    pub(crate) keep_alive: bool,
    pub(crate) keepalive_timeout: Option<Duration>,
    pub(crate) server_string: Option<String>,
}

impl ResponseState {
    pub(crate) fn h1(
        write: WriteHalf<BoxIo>,
        version: Version,
        keep_alive: bool,
        keepalive_timeout: Option<Duration>,
        is_head: bool,
        server_string: Option<String>,
    ) -> ResponseState {
        ResponseState {
            backend: Backend::H1 {
                write: Some(write),
                version,
            },
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
            finalized: false,
            switched: false,
            framing: OutFraming::Unset,
            pending: BytesMut::new(),
            declared: None,
            written: 0,
            is_head,
            keep_alive,
            keepalive_timeout,
            server_string,
        }
    }

    pub(crate) fn h2(
        stream: StreamHandle,
        is_head: bool,
        server_string: Option<String>,
    ) -> ResponseState {
        ResponseState {
            backend: Backend::H2 { stream },
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
            finalized: false,
            switched: false,
            framing: OutFraming::Unset,
            pending: BytesMut::new(),
            declared: None,
            written: 0,
            is_head,
            keep_alive: true,
            keepalive_timeout: None,
            server_string,
        }
    }

    fn status_forbids_body(&self) -> bool {
        self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }

    fn add_standard_headers(&mut self) {
        if !self.headers.contains("date") {
            let date = fmt_http_date(std::time::SystemTime::now());
            let _ = self.headers.insert("Date", date);
        }
        if let Some(server) = self.server_string.clone() {
            if !self.headers.contains("server") {
                let _ = self.headers.insert("Server", server);
            }
        }
    }

    /// Serialize and send the HTTP/1.x head, deciding the body framing.
    async fn send_h1_head(&mut self, end_stream_known: bool) -> Result<()> {
        debug_assert!(!self.head_sent);
        self.add_standard_headers();

        use crate::proto::h1::content_length_parse;
        let declared = content_length_parse(&self.headers)
            .map_err(|()| Error::validation("invalid content-length in response"))?;
        let version = match &self.backend {
            Backend::H1 { version, .. } => *version,
            Backend::H2 { .. } => unreachable!("h1 head on an h2 stream"),
        };

        self.framing = if self.status_forbids_body() {
            OutFraming::NoBody
        } else if let Some(n) = declared {
            self.declared = Some(n);
            OutFraming::Length
        } else if end_stream_known {
            // the whole body is already buffered: a plain length beats
            // chunking it
            let n = self.pending.len() as u64;
            self.declared = Some(n);
            let _ = self.headers.insert("Content-Length", n.to_string());
            OutFraming::Length
        } else if version == Version::HTTP_11 {
            let _ = self.headers.insert("Transfer-Encoding", "chunked");
            OutFraming::Chunked
        } else {
            self.keep_alive = false;
            OutFraming::CloseDelimited
        };

        if !self.keep_alive {
            if !self.headers.contains("connection") {
                let _ = self.headers.insert("Connection", "close");
            }
        } else if version == Version::HTTP_10 {
            let _ = self.headers.insert("Connection", "keep-alive");
            if let Some(timeout) = self.keepalive_timeout {
                let _ = self
                    .headers
                    .insert("Keep-Alive", format!("timeout={}", timeout.as_secs()));
            }
        }

        let head = ResponseHead {
            status: self.status,
            version,
            headers: std::mem::take(&mut self.headers),
        };
        let mut out = BytesMut::new();
        encode_response(&head, &mut out);
        self.head_sent = true;
        let Backend::H1 { write, .. } = &mut self.backend else {
            unreachable!()
        };
        let writer = write.as_mut().expect("write half present until switch");
        writer.write_all(&out).await.map_err(Error::body)?;
        Ok(())
    }

    async fn send_head(&mut self, end_stream: bool) -> Result<()> {
        if self.head_sent {
            return Ok(());
        }
        if matches!(self.backend, Backend::H1 { .. }) {
            return self.send_h1_head(end_stream).await;
        }
        self.add_standard_headers();
        let pseudo = Pseudo::response(self.status);
        let headers = std::mem::take(&mut self.headers);
        let end = end_stream && (self.pending.is_empty() || self.is_head);
        self.head_sent = true;
        let Backend::H2 { stream } = &mut self.backend else {
            unreachable!()
        };
        stream.send_headers(pseudo, headers, end)
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finalized || self.switched {
            return Err(Error::validation("response already finalized"));
        }
        if !self.head_sent {
            // body bytes before an explicit head: buffer a little so a
            // small response can still go out with a plain length
            if self.pending.len() + data.len() <= 16 * 1024 {
                self.pending.extend_from_slice(data);
                return Ok(());
            }
            self.send_head(false).await?;
        }
        self.written += data.len() as u64;
        if self.is_head || self.framing == OutFraming::NoBody {
            // counted, never emitted
            return Ok(());
        }
        if let Some(declared) = self.declared {
            let already = self.written - data.len() as u64;
            if already + data.len() as u64 > declared {
                return Err(Error::validation("response exceeds declared content-length"));
            }
        }
        match &mut self.backend {
            Backend::H1 { write, .. } => {
                let writer = write.as_mut().expect("write half present until switch");
                match self.framing {
                    OutFraming::Chunked => {
                        self.pending.extend_from_slice(data);
                        Ok(())
                    }
                    _ => {
                        if !self.pending.is_empty() {
                            let buffered = std::mem::take(&mut self.pending);
                            writer.write_all(&buffered).await.map_err(Error::body)?;
                        }
                        writer.write_all(data).await.map_err(Error::body)
                    }
                }
            }
            Backend::H2 { stream } => {
                if !self.pending.is_empty() {
                    let buffered = std::mem::take(&mut self.pending);
                    stream.write(&buffered).await?;
                }
                stream.write(data).await
            }
        }
    }

    /// Push buffered output to the peer. On a chunked response every
    /// flush emits one chunk.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        if self.switched {
            return Ok(());
        }
        if !self.head_sent {
            self.send_head(false).await?;
        }
        match &mut self.backend {
            Backend::H1 { write, .. } => {
                let writer = write.as_mut().expect("write half present until switch");
                if self.framing == OutFraming::Chunked {
                    if !self.pending.is_empty() {
                        let chunk = std::mem::take(&mut self.pending);
                        let mut chunked = ChunkedWriter::new(&mut *writer);
                        chunked.write_chunk(&chunk).await.map_err(Error::body)?;
                    }
                } else if !self.pending.is_empty() && self.framing != OutFraming::NoBody {
                    let buffered = std::mem::take(&mut self.pending);
                    writer.write_all(&buffered).await.map_err(Error::body)?;
                }
                writer.flush().await.map_err(Error::body)
            }
            Backend::H2 { stream } => {
                if !self.pending.is_empty() {
                    let buffered = std::mem::take(&mut self.pending);
                    stream.write(&buffered).await?;
                }
                stream.flush().await
            }
        }
    }

    /// Complete the response: emit the head if it never went out, drain
    /// buffers, close the body framing. Returns whether the connection
    /// may be kept alive.
    pub(crate) async fn complete(&mut self) -> Result<bool> {
        if self.finalized || self.switched {
            return Ok(self.keep_alive);
        }
        if !self.head_sent {
            self.send_head(true).await?;
        }
        self.written += self.pending.len() as u64;
        match &mut self.backend {
            Backend::H1 { write, .. } => {
                let writer = write.as_mut().expect("write half present until switch");
                let suppress = self.is_head || self.framing == OutFraming::NoBody;
                match self.framing {
                    OutFraming::Chunked => {
                        let mut chunked = ChunkedWriter::new(&mut *writer);
                        if !self.pending.is_empty() && !suppress {
                            let chunk = std::mem::take(&mut self.pending);
                            chunked.write_chunk(&chunk).await.map_err(Error::body)?;
                        }
                        chunked.finish(None).await.map_err(Error::body)?;
                    }
                    _ => {
                        if !self.pending.is_empty() && !suppress {
                            let buffered = std::mem::take(&mut self.pending);
                            writer.write_all(&buffered).await.map_err(Error::body)?;
                        }
                    }
                }
                writer.flush().await.map_err(Error::body)?;
                if let Some(declared) = self.declared {
                    if !self.is_head && self.written < declared {
                        // a short body cannot be repaired; the transport
                        // closes so the peer sees the truncation
                        debug!(
                            "response under-wrote its content-length ({} < {declared})",
                            self.written
                        );
                        self.keep_alive = false;
                    }
                }
                if self.framing == OutFraming::CloseDelimited {
                    self.keep_alive = false;
                }
            }
            Backend::H2 { stream } => {
                if !self.pending.is_empty() && !self.is_head {
                    let buffered = std::mem::take(&mut self.pending);
                    stream.write(&buffered).await?;
                }
                stream.finalize().await?;
            }
        }
        self.finalized = true;
        Ok(self.keep_alive)
    }

    pub(crate) fn take_write_half(&mut self) -> Option<WriteHalf<BoxIo>> {
        match &mut self.backend {
            Backend::H1 { write, .. } => write.take(),
            Backend::H2 { .. } => None,
        }
    }
}

/// Writes one response. Obtained by the handler, finished with
/// [`finalize`](ResponseWriter::finalize) (or finished by the engine
/// when dropped).
pub struct ResponseWriter {
    state: Option<ResponseState>,
    tx: Option<oneshot::Sender<ResponseState>>,
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.state.as_ref().map(|s| s.status);
        f.debug_struct("ResponseWriter")
            .field("status", &status)
            .finish()
    }
}

impl ResponseWriter {
    pub(crate) fn new(
        state: ResponseState,
        tx: oneshot::Sender<ResponseState>,
    ) -> ResponseWriter {
        ResponseWriter {
            state: Some(state),
            tx: Some(tx),
        }
    }

    fn state(&mut self) -> &mut ResponseState {
        self.state.as_mut().expect("response state taken")
    }

    /// The status the response will carry.
    pub fn status(&self) -> StatusCode {
        self.state.as_ref().map(|s| s.status).unwrap_or_default()
    }

    /// Set the response status. Must precede `write_head`.
    pub fn set_status(&mut self, status: StatusCode) {
        self.state().status = status;
    }

    /// The response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.state().headers
    }

    /// Append a `Set-Cookie` header.
    pub fn set_cookie(&mut self, cookie: &Cookie) {
        let value = cookie.to_set_cookie();
        if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
            self.state()
                .headers
                .append(HeaderName::from_static("Set-Cookie"), value);
        }
    }

    /// Send the head now, before any body bytes.
    pub async fn write_head(&mut self) -> Result<()> {
        self.state().send_head(false).await
    }

    /// Write body octets.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state().write(data).await
    }

    /// Flush buffered output; on a chunked response this emits one chunk.
    pub async fn flush(&mut self) -> Result<()> {
        self.state().flush().await
    }

    /// Finish the response.
    pub async fn finalize(mut self) -> Result<()> {
        let mut state = self.state.take().expect("response state taken");
        let result = state.complete().await;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(state);
        }
        result.map(|_| ())
    }

    /// Respond with a redirect to `location` and finish.
    pub async fn redirect(mut self, location: &str, status: StatusCode) -> Result<()> {
        debug_assert!(status.is_redirection());
        self.set_status(status);
        let value = HeaderValue::from_bytes(location.as_bytes())
            .map_err(|_| Error::validation("invalid redirect location"))?;
        self.state()
            .headers
            .append(HeaderName::from_static("Location"), value);
        self.finalize().await
    }

    /// Switch to another protocol: responds `101 Switching Protocols`
    /// and hands back the raw transport. HTTP/1.x only; the request is
    /// needed to reclaim the connection's read half.
    pub async fn switch_protocol(
        mut self,
        protocol: &str,
        request: &mut super::request::Request,
    ) -> Result<RawStream> {
        let state = self.state();
        if matches!(state.backend, Backend::H2 { .. }) {
            return Err(Error::upgrade("cannot switch protocols on http2"));
        }
        let Some(read) = request.body_mut().take_read_conn() else {
            return Err(Error::upgrade("request body must be untouched to switch"));
        };
        state.status = StatusCode::SWITCHING_PROTOCOLS;
        let _ = state.headers.insert("Upgrade", protocol);
        let _ = state.headers.insert("Connection", "Upgrade");
        state.framing = OutFraming::NoBody;
        state.add_standard_headers();
        let version = match &state.backend {
            Backend::H1 { version, .. } => *version,
            Backend::H2 { .. } => unreachable!(),
        };
        let head = ResponseHead {
            status: state.status,
            version,
            headers: std::mem::take(&mut state.headers),
        };
        let mut out = BytesMut::new();
        encode_response(&head, &mut out);
        let mut write = state.take_write_half().expect("write half present");
        write.write_all(&out).await.map_err(Error::body)?;
        write.flush().await.map_err(Error::body)?;
        state.head_sent = true;
        state.switched = true;
        trace!("connection switched to {protocol}");

        let mut state = self.state.take().expect("response state taken");
        state.switched = true;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(state);
        }
        Ok(RawStream { read, write })
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if let (Some(state), Some(tx)) = (self.state.take(), self.tx.take()) {
            let _ = tx.send(state);
        }
    }
}

/// The raw duplex stream obtained from a protocol switch.
pub struct RawStream {
    read: ReadConn,
    write: WriteHalf<BoxIo>,
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStream").finish()
    }
}

impl AsyncRead for RawStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}
