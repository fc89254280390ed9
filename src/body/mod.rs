//! Message bodies and the byte-stream adapters they are built from.
//!
//! A [`Body`] is the single body type both engines hand out and accept:
//! inbound HTTP/1.x bodies wrap the connection in a framing adapter
//! chosen at header-parse time, inbound HTTP/2 bodies read from their
//! stream handle, and outbound bodies are buffers, channels or readers.

pub(crate) mod buffered;
mod adapters;

pub use self::adapters::{
    ByteStream, ChunkedReader, ChunkedWriter, CountingReader, EndCallbackReader, LimitedReader,
    TimeoutReader,
};
pub(crate) use self::buffered::{BoxIo, Buffered};

use std::{fmt, future::poll_fn, io, pin::Pin};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;

use crate::error::from_io;
use crate::header::HeaderMap;
use crate::proto::h2::StreamHandle;
use crate::{Error, Result};

/// The buffered read half of an HTTP/1.x connection.
pub(crate) type ReadConn = Buffered<tokio::io::ReadHalf<BoxIo>>;

/// What is left of a connection once its body is released.
pub(crate) enum Reclaimed {
    /// The framing ran to its natural end; the connection may be reused
    /// as is.
    Clean(ReadConn),
    /// Body octets are still on the wire; drain them (see
    /// [`drain_framing`]) before reusing the connection.
    Unread(H1Framing),
    /// The connection cannot carry another exchange.
    Broken,
}

/// Called with the connection's remains once an HTTP/1.x body is
/// finished or abandoned.
pub(crate) type Reclaim = Box<dyn FnOnce(Reclaimed) + Send>;

/// How the octets of an HTTP/1.x body are delimited on the wire.
pub(crate) enum H1Framing {
    Limited(LimitedReader<ReadConn>),
    Chunked(Box<ChunkedReader<ReadConn>>),
    Close(ReadConn),
    Empty(ReadConn),
}

/// Read an abandoned body to its end so the connection underneath stays
/// usable. Gives up (and the connection with it) past `limit` octets.
pub(crate) async fn drain_framing(framing: H1Framing, limit: u64) -> Option<ReadConn> {
    let mut budget = limit;
    let mut buf = [0u8; 8 * 1024];
    match framing {
        H1Framing::Empty(conn) => Some(conn),
        H1Framing::Close(_) => None,
        H1Framing::Limited(mut reader) => loop {
            if reader.is_exhausted() {
                return Some(reader.into_inner());
            }
            if budget == 0 {
                return None;
            }
            let want = buf.len().min(budget as usize);
            match reader.read(&mut buf[..want]).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => budget -= n as u64,
            }
        },
        H1Framing::Chunked(mut reader) => loop {
            match reader.read(&mut buf).await {
                Ok(0) => return Some(reader.into_inner()),
                Err(_) => return None,
                Ok(n) => {
                    if n as u64 > budget {
                        return None;
                    }
                    budget -= n as u64;
                }
            }
        },
    }
}

/// An inbound HTTP/1.x body holding its connection until drained.
pub(crate) struct H1Body {
    framing: Option<H1Framing>,
    reclaim: Option<Reclaim>,
    trailers: Option<HeaderMap>,
    /// Reject bodies that grow past this many octets.
    max: Option<u64>,
    read_total: u64,
}

impl H1Body {
    pub(crate) fn new(framing: H1Framing, reclaim: Reclaim, max: Option<u64>) -> H1Body {
        H1Body {
            framing: Some(framing),
            reclaim: Some(reclaim),
            trailers: None,
            max,
            read_total: 0,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(framing) = self.framing.as_mut() else {
            return Ok(0);
        };
        let n = match framing {
            H1Framing::Empty(_) => 0,
            H1Framing::Limited(reader) => reader.read(buf).await?,
            H1Framing::Chunked(reader) => reader.read(buf).await?,
            H1Framing::Close(conn) => conn.read(buf).await?,
        };
        if n == 0 {
            self.finish();
            return Ok(0);
        }
        self.read_total += n as u64;
        if let Some(max) = self.max {
            if self.read_total > max {
                self.framing = None;
                if let Some(reclaim) = self.reclaim.take() {
                    reclaim(Reclaimed::Broken);
                }
                return Err(io::Error::other(
                    Error::status_code(http::StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
                ));
            }
        }
        Ok(n)
    }

    /// Hand the connection's remains back. Only framings that ran to
    /// their natural end leave a directly reusable connection;
    /// close-delimited bodies never do, and an abandoned body travels
    /// back with its framing so the caller may drain it.
    fn finish(&mut self) {
        let Some(framing) = self.framing.take() else {
            return;
        };
        let reclaimed = match framing {
            H1Framing::Empty(conn) => Reclaimed::Clean(conn),
            H1Framing::Limited(reader) => {
                if reader.is_exhausted() {
                    Reclaimed::Clean(reader.into_inner())
                } else {
                    Reclaimed::Unread(H1Framing::Limited(reader))
                }
            }
            H1Framing::Chunked(mut reader) => {
                if reader.is_exhausted() {
                    let trailers = reader.take_trailers();
                    if !trailers.is_empty() {
                        self.trailers = Some(trailers);
                    }
                    Reclaimed::Clean(reader.into_inner())
                } else {
                    Reclaimed::Unread(H1Framing::Chunked(reader))
                }
            }
            H1Framing::Close(_) => Reclaimed::Broken,
        };
        if let Some(reclaim) = self.reclaim.take() {
            reclaim(reclaimed);
        }
    }

    fn least_size(&self) -> u64 {
        match &self.framing {
            Some(H1Framing::Limited(reader)) => reader.least_size(),
            Some(H1Framing::Chunked(reader)) => reader.least_size(),
            _ => 0,
        }
    }

    /// Take the connection out without reading or reclaiming, for a
    /// protocol switch.
    fn take_conn(&mut self) -> Option<ReadConn> {
        self.reclaim = None;
        match self.framing.take()? {
            H1Framing::Empty(conn) | H1Framing::Close(conn) => Some(conn),
            H1Framing::Limited(reader) => Some(reader.into_inner()),
            H1Framing::Chunked(reader) => Some(reader.into_inner()),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.framing.is_none()
    }
}

impl Drop for H1Body {
    fn drop(&mut self) {
        // an unread body still releases its connection; whether it can
        // be reused depends on how much framing was left
        self.finish();
    }
}

enum Inner {
    Empty,
    Full(Bytes),
    Channel {
        rx: mpsc::Receiver<Bytes>,
        current: Option<Bytes>,
    },
    H1(H1Body),
    H2(StreamHandle),
    Reader(Pin<Box<dyn ByteStream>>),
}

/// A streaming message body.
pub struct Body {
    inner: Inner,
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body { inner: Inner::Empty }
    }

    /// A sender/body pair for streaming an outbound body chunk by chunk.
    pub fn channel() -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(8);
        (
            BodySender { tx },
            Body {
                inner: Inner::Channel { rx, current: None },
            },
        )
    }

    /// Wrap any byte stream as a body.
    pub fn from_reader<S: ByteStream + 'static>(reader: S) -> Body {
        Body {
            inner: Inner::Reader(Box::pin(reader)),
        }
    }

    pub(crate) fn h1(body: H1Body) -> Body {
        Body {
            inner: Inner::H1(body),
        }
    }

    pub(crate) fn h2(stream: StreamHandle) -> Body {
        Body {
            inner: Inner::H2(stream),
        }
    }

    /// Reads body octets into `buf`; `Ok(0)` is end-of-body.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.inner {
            Inner::Empty => Ok(0),
            Inner::Full(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                bytes.advance(n);
                Ok(n)
            }
            Inner::Channel { rx, current } => loop {
                if let Some(chunk) = current {
                    if !chunk.is_empty() {
                        let n = chunk.len().min(buf.len());
                        buf[..n].copy_from_slice(&chunk[..n]);
                        chunk.advance(n);
                        return Ok(n);
                    }
                }
                match rx.recv().await {
                    Some(chunk) => *current = Some(chunk),
                    None => return Ok(0),
                }
            },
            Inner::H1(body) => body.read(buf).await.map_err(from_io),
            Inner::H2(stream) => stream.read(buf).await,
            Inner::Reader(reader) => {
                let mut read_buf = ReadBuf::new(buf);
                poll_fn(|cx| reader.as_mut().poll_read(cx, &mut read_buf))
                    .await
                    .map_err(from_io)?;
                Ok(read_buf.filled().len())
            }
        }
    }

    /// A lower bound on the octets still to come.
    pub fn least_size(&self) -> u64 {
        match &self.inner {
            Inner::Empty => 0,
            Inner::Full(bytes) => bytes.len() as u64,
            Inner::Channel { current, .. } => {
                current.as_ref().map(|c| c.len() as u64).unwrap_or(0)
            }
            Inner::H1(body) => body.least_size(),
            Inner::H2(_) => 0,
            Inner::Reader(reader) => reader.least_size(),
        }
    }

    /// True once the body is known to be finished.
    pub fn is_exhausted(&self) -> bool {
        match &self.inner {
            Inner::Empty => true,
            Inner::Full(bytes) => bytes.is_empty(),
            Inner::Channel { .. } => false,
            Inner::H1(body) => body.is_exhausted(),
            Inner::H2(_) => false,
            Inner::Reader(reader) => reader.is_exhausted(),
        }
    }

    /// Releases the body without draining it. An HTTP/1.x connection
    /// carrying unread octets will not be reused; an HTTP/2 stream is
    /// cancelled.
    pub fn close(&mut self) {
        if let Inner::H2(stream) = &mut self.inner {
            stream.close(None);
        }
        self.inner = Inner::Empty;
    }

    /// Trailer fields of a chunked body, available after the last octet
    /// was read.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        match &self.inner {
            Inner::H1(body) => body.trailers.as_ref(),
            _ => None,
        }
    }

    /// Take the raw connection back out of an unread HTTP/1.x body, for
    /// a protocol switch.
    pub(crate) fn take_read_conn(&mut self) -> Option<ReadConn> {
        match &mut self.inner {
            Inner::H1(body) => body.take_conn(),
            _ => None,
        }
    }

    /// The whole body, when it is a replayable buffer. An empty body
    /// counts: it replays as itself.
    pub(crate) fn as_full(&self) -> Option<Bytes> {
        match &self.inner {
            Inner::Empty => Some(Bytes::new()),
            Inner::Full(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Known total size, when one can be promised up front.
    pub(crate) fn size_hint(&self) -> Option<u64> {
        match &self.inner {
            Inner::Empty => Some(0),
            Inner::Full(bytes) => Some(bytes.len() as u64),
            _ => None,
        }
    }

    /// Pull the next outbound chunk; `None` is end-of-body.
    pub(crate) async fn data(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            Inner::Empty => Ok(None),
            Inner::Full(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            Inner::Channel { rx, current } => {
                if let Some(chunk) = current.take() {
                    if !chunk.is_empty() {
                        return Ok(Some(chunk));
                    }
                }
                Ok(rx.recv().await.filter(|c| !c.is_empty()))
            }
            _ => {
                let mut buf = BytesMut::zeroed(8 * 1024);
                let n = self.read(&mut buf).await?;
                if n == 0 {
                    Ok(None)
                } else {
                    buf.truncate(n);
                    Ok(Some(buf.freeze()))
                }
            }
        }
    }

    /// Reads the remaining body to completion and returns it whole.
    pub async fn bytes(mut self) -> Result<Bytes> {
        if let Inner::Full(bytes) = &mut self.inner {
            return Ok(std::mem::take(bytes));
        }
        let mut out = BytesMut::new();
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Reads the remaining body as UTF-8 text, replacing invalid bytes.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            Inner::Empty => "Empty",
            Inner::Full(_) => "Full",
            Inner::Channel { .. } => "Channel",
            Inner::H1(_) => "Http1",
            Inner::H2(_) => "Http2",
            Inner::Reader(_) => "Reader",
        };
        f.debug_tuple("Body").field(&kind).finish()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        if bytes.is_empty() {
            Body::empty()
        } else {
            Body {
                inner: Inner::Full(bytes),
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s.into_bytes()))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(s))
    }
}

/// Streams chunks into a [`Body::channel`] body.
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
}

impl BodySender {
    /// Queue one chunk. Fails once the body side is gone.
    pub async fn send<B: Into<Bytes>>(&self, chunk: B) -> Result<()> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(chunk)
            .await
            .map_err(|_| Error::closed("body receiver dropped"))
    }

    /// Finish the body. Dropping the sender does the same.
    pub fn finish(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_body_reads_and_hints() {
        let mut body = Body::from("hello");
        assert_eq!(body.least_size(), 5);
        assert_eq!(body.size_hint(), Some(5));
        let mut buf = [0u8; 3];
        assert_eq!(body.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(body.least_size(), 2);
        assert_eq!(body.read(&mut buf).await.unwrap(), 2);
        assert_eq!(body.read(&mut buf).await.unwrap(), 0);
        assert!(body.is_exhausted());
    }

    #[tokio::test]
    async fn channel_body_streams_chunks() {
        let (tx, mut body) = Body::channel();
        tokio::spawn(async move {
            tx.send("Hello").await.unwrap();
            tx.send(" World").await.unwrap();
        });
        let text = {
            let mut out = Vec::new();
            let mut buf = [0u8; 4];
            loop {
                let n = body.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            String::from_utf8(out).unwrap()
        };
        assert_eq!(text, "Hello World");
    }

    #[tokio::test]
    async fn data_yields_outbound_chunks() {
        let (tx, mut body) = Body::channel();
        tokio::spawn(async move {
            tx.send("a").await.unwrap();
            tx.send("bc").await.unwrap();
        });
        assert_eq!(body.data().await.unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(body.data().await.unwrap(), Some(Bytes::from_static(b"bc")));
        assert_eq!(body.data().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reader_body_via_adapter() {
        let data: &[u8] = b"0123456789";
        let mut body = Body::from_reader(LimitedReader::new(data, 4));
        let collected = {
            let mut out = Vec::new();
            let mut buf = [0u8; 16];
            loop {
                let n = body.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            out
        };
        assert_eq!(collected, b"0123");
    }
}
