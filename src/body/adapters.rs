//! Composable byte-stream adapters.
//!
//! Each adapter wraps a reader and changes what "the stream" means:
//! exactly N bytes, a dechunked HTTP/1.x body, a tallied stream, a
//! stream with an inactivity deadline, or a stream that announces its
//! own exhaustion. Composition is by nesting; the response machinery
//! picks a concrete stack at header-parse time and boxes it.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::BytesMut;
use pin_project_lite::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::header::{HeaderMap, HeaderName, HeaderValue};

/// A readable byte stream with residual-size hints.
pub trait ByteStream: AsyncRead + Send + Unpin {
    /// A lower bound on the octets still to come.
    fn least_size(&self) -> u64 {
        0
    }

    /// True once the stream is known to be finished.
    fn is_exhausted(&self) -> bool {
        false
    }
}

const SCRATCH: usize = 8 * 1024;

/// Exposes exactly `n` octets of the underlying stream; an early EOF
/// underneath is an error.
#[derive(Debug)]
pub struct LimitedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> LimitedReader<R> {
    /// Wrap `inner`, exposing exactly `n` octets.
    pub fn new(inner: R, n: u64) -> LimitedReader<R> {
        LimitedReader {
            inner,
            remaining: n,
        }
    }

    /// Octets not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let want = (self.remaining.min(buf.remaining() as u64) as usize).min(SCRATCH);
        let mut tmp = [0u8; SCRATCH];
        let mut sub = ReadBuf::new(&mut tmp[..want]);
        match Pin::new(&mut self.inner).poll_read(cx, &mut sub) {
            Poll::Ready(Ok(())) => {
                let filled = sub.filled();
                if filled.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body ended before its declared length",
                    )));
                }
                self.remaining -= filled.len() as u64;
                buf.put_slice(filled);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<R: AsyncRead + Send + Unpin> ByteStream for LimitedReader<R> {
    fn least_size(&self) -> u64 {
        self.remaining
    }

    fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    SizeExt,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    EndLf,
    End,
}

/// Decodes an HTTP/1.x chunked transfer coding.
///
/// Chunk-size extensions are ignored; a trailer section is collected and
/// left unmerged for the caller to pick up.
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    state: ChunkState,
    chunk_remaining: u64,
    size_seen: bool,
    trailer_line: Vec<u8>,
    trailers: HeaderMap,
}

impl<R> ChunkedReader<R> {
    pub fn new(inner: R) -> ChunkedReader<R> {
        ChunkedReader {
            inner,
            state: ChunkState::Size,
            chunk_remaining: 0,
            size_seen: false,
            trailer_line: Vec::new(),
            trailers: HeaderMap::new(),
        }
    }

    /// The trailer section, once the stream is exhausted.
    pub fn take_trailers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.trailers)
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn push_trailer_line(raw: &mut Vec<u8>, trailers: &mut HeaderMap) -> io::Result<()> {
    let line = std::mem::take(raw);
    let line = match line.strip_suffix(b"\r") {
        Some(stripped) => stripped,
        None => &line[..],
    };
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| bad_chunk("trailer line without colon"))?;
    let name = HeaderName::from_bytes(&line[..colon])
        .map_err(|_| bad_chunk("invalid trailer name"))?;
    let mut value = &line[colon + 1..];
    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        value = &value[1..];
    }
    let value = HeaderValue::from_bytes(value).map_err(|_| bad_chunk("invalid trailer value"))?;
    trailers.append(name, value);
    Ok(())
}

fn bad_chunk(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl<R: AsyncBufRead + Unpin> AsyncRead for ChunkedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.state == ChunkState::End {
                return Poll::Ready(Ok(()));
            }

            let available = match Pin::new(&mut this.inner).poll_fill_buf(cx) {
                Poll::Ready(Ok(bytes)) => bytes,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            if available.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a chunked body",
                )));
            }

            if this.state == ChunkState::Data {
                let n = (this.chunk_remaining.min(available.len() as u64) as usize)
                    .min(buf.remaining());
                buf.put_slice(&available[..n]);
                Pin::new(&mut this.inner).consume(n);
                this.chunk_remaining -= n as u64;
                if this.chunk_remaining == 0 {
                    this.state = ChunkState::DataCr;
                }
                return Poll::Ready(Ok(()));
            }

            // control bytes: consume one at a time through the state machine
            let mut consumed = 0;
            let mut error = None;
            for &byte in available {
                consumed += 1;
                match this.state {
                    ChunkState::Size => match byte {
                        b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                            let digit = (byte as char).to_digit(16).expect("hex digit") as u64;
                            if this.chunk_remaining > u64::MAX / 32 {
                                error = Some(bad_chunk("chunk size overflow"));
                                break;
                            }
                            this.chunk_remaining = this.chunk_remaining * 16 + digit;
                            this.size_seen = true;
                        }
                        b';' if this.size_seen => this.state = ChunkState::SizeExt,
                        b'\r' if this.size_seen => this.state = ChunkState::SizeLf,
                        _ => {
                            error = Some(bad_chunk("invalid chunk size"));
                            break;
                        }
                    },
                    ChunkState::SizeExt => {
                        if byte == b'\r' {
                            this.state = ChunkState::SizeLf;
                        }
                    }
                    ChunkState::SizeLf => {
                        if byte != b'\n' {
                            error = Some(bad_chunk("chunk size not terminated"));
                            break;
                        }
                        this.size_seen = false;
                        if this.chunk_remaining == 0 {
                            this.state = ChunkState::TrailerStart;
                        } else {
                            this.state = ChunkState::Data;
                            break;
                        }
                    }
                    ChunkState::DataCr => {
                        if byte != b'\r' {
                            error = Some(bad_chunk("chunk payload not terminated"));
                            break;
                        }
                        this.state = ChunkState::DataLf;
                    }
                    ChunkState::DataLf => {
                        if byte != b'\n' {
                            error = Some(bad_chunk("chunk payload not terminated"));
                            break;
                        }
                        this.state = ChunkState::Size;
                    }
                    ChunkState::TrailerStart => {
                        if byte == b'\r' {
                            this.state = ChunkState::EndLf;
                        } else {
                            this.trailer_line.push(byte);
                            this.state = ChunkState::Trailer;
                        }
                    }
                    ChunkState::Trailer => {
                        if byte == b'\n' {
                            if let Err(e) =
                                push_trailer_line(&mut this.trailer_line, &mut this.trailers)
                            {
                                error = Some(e);
                                break;
                            }
                            this.state = ChunkState::TrailerStart;
                        } else {
                            this.trailer_line.push(byte);
                        }
                    }
                    ChunkState::EndLf => {
                        if byte != b'\n' {
                            error = Some(bad_chunk("trailer section not terminated"));
                            break;
                        }
                        this.state = ChunkState::End;
                        break;
                    }
                    ChunkState::Data | ChunkState::End => break,
                }
            }
            Pin::new(&mut this.inner).consume(consumed);
            if let Some(e) = error {
                return Poll::Ready(Err(e));
            }
            if this.state == ChunkState::End {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl<R: AsyncBufRead + Send + Unpin> ByteStream for ChunkedReader<R> {
    fn least_size(&self) -> u64 {
        if self.state == ChunkState::Data {
            self.chunk_remaining
        } else {
            0
        }
    }

    fn is_exhausted(&self) -> bool {
        self.state == ChunkState::End
    }
}

/// Encodes an HTTP/1.x chunked transfer coding: one chunk per call, a
/// terminating zero chunk on `finish`.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    pub fn new(inner: W) -> ChunkedWriter<W> {
        ChunkedWriter {
            inner,
            finished: false,
        }
    }

    /// Emit `data` as a single chunk and flush it. Empty input is a
    /// no-op; a zero-length chunk would terminate the body.
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        debug_assert!(!self.finished);
        if data.is_empty() {
            return Ok(());
        }
        let mut frame = BytesMut::with_capacity(data.len() + 16);
        frame.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }

    /// Terminate the body with the zero chunk and an optional trailer
    /// section.
    pub async fn finish(&mut self, trailers: Option<&HeaderMap>) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut frame = BytesMut::from(&b"0\r\n"[..]);
        if let Some(trailers) = trailers {
            for (name, value) in trailers {
                frame.extend_from_slice(name.as_bytes());
                frame.extend_from_slice(b": ");
                frame.extend_from_slice(value.as_bytes());
                frame.extend_from_slice(b"\r\n");
            }
        }
        frame.extend_from_slice(b"\r\n");
        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Tallies the octets that pass through, for quotas and metrics.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> CountingReader<R> {
        CountingReader { inner, count: 0 }
    }

    /// Total octets read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                self.count += (buf.filled().len() - before) as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<R: AsyncRead + Send + Unpin> ByteStream for CountingReader<R> {}

pin_project! {
    /// Aborts reads once no progress has been made for the configured
    /// duration. The clock restarts on every successful read.
    #[derive(Debug)]
    pub struct TimeoutReader<R> {
        inner: R,
        duration: Duration,
        sleep: Pin<Box<tokio::time::Sleep>>,
    }
}

impl<R> TimeoutReader<R> {
    pub fn new(inner: R, duration: Duration) -> TimeoutReader<R> {
        TimeoutReader {
            inner,
            duration,
            sleep: Box::pin(tokio::time::sleep(duration)),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TimeoutReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match Pin::new(&mut *this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                let deadline = tokio::time::Instant::now() + *this.duration;
                this.sleep.as_mut().reset(deadline);
                Poll::Ready(result)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no read progress before the deadline",
                ))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<R: AsyncRead + Send + Unpin> ByteStream for TimeoutReader<R> {}

/// Invokes a callback exactly once when the stream reports end-of-file,
/// for resource release.
pub struct EndCallbackReader<R> {
    inner: R,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl<R> EndCallbackReader<R> {
    pub fn new<F>(inner: R, callback: F) -> EndCallbackReader<R>
    where
        F: FnOnce() + Send + 'static,
    {
        EndCallbackReader {
            inner,
            callback: Some(Box::new(callback)),
        }
    }
}

impl<R> std::fmt::Debug for EndCallbackReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndCallbackReader")
            .field("armed", &self.callback.is_some())
            .finish()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EndCallbackReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before {
                    if let Some(callback) = self.callback.take() {
                        callback();
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<R: AsyncRead + Send + Unpin> ByteStream for EndCallbackReader<R> {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn limited_exposes_exactly_n() {
        let data: &[u8] = b"0123456789";
        let mut reader = LimitedReader::new(data, 4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123");
        assert!(reader.is_exhausted());
    }

    #[tokio::test]
    async fn limited_errors_on_early_eof() {
        let data: &[u8] = b"ab";
        let mut reader = LimitedReader::new(data, 5);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunked_decodes_and_collects_trailers() {
        let wire: &[u8] =
            b"5\r\nHello\r\n6\r\n World\r\n0\r\nX-Check: sum\r\n\r\nleftover for next message";
        let mut reader = ChunkedReader::new(BufReader::new(wire));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"Hello World");
        assert!(reader.is_exhausted());
        let trailers = reader.take_trailers();
        assert_eq!(trailers.get_str("x-check"), Some("sum"));
    }

    #[tokio::test]
    async fn chunked_ignores_extensions() {
        let wire: &[u8] = b"5;name=val\r\nhello\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(BufReader::new(wire));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn chunked_rejects_garbage_size() {
        let wire: &[u8] = b"zz\r\nhello\r\n";
        let mut reader = ChunkedReader::new(BufReader::new(wire));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn chunked_eof_mid_body_is_an_error() {
        let wire: &[u8] = b"ff\r\nshort";
        let mut reader = ChunkedReader::new(BufReader::new(wire));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn writer_then_reader_roundtrip() {
        let mut wire = Vec::new();
        {
            let mut writer = ChunkedWriter::new(&mut wire);
            writer.write_chunk(b"Hello").await.unwrap();
            writer.write_chunk(b" World").await.unwrap();
            writer.finish(None).await.unwrap();
        }
        assert_eq!(wire, b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n");

        let mut reader = ChunkedReader::new(BufReader::new(&wire[..]));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"Hello World");
    }

    #[tokio::test]
    async fn counting_tallies() {
        let data: &[u8] = b"some bytes here";
        let mut reader = CountingReader::new(data);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(reader.count(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_without_progress() {
        let (client, _server) = tokio::io::duplex(16);
        let mut reader = TimeoutReader::new(client, Duration::from_secs(3));
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn end_callback_fires_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let fired = Arc::new(AtomicUsize::new(0));
        let data: &[u8] = b"tail";
        let counter = fired.clone();
        let mut reader = EndCallbackReader::new(data, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // another read at EOF stays silent
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
