//! A read-buffered transport wrapper.
//!
//! Every HTTP/1.x connection reads through one of these: message heads
//! are parsed straight out of the buffer, and whatever the parser leaves
//! behind is what the body adapters consume first.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};

/// Transport object: any duplex byte stream.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A boxed transport, as stored in connections and bodies.
pub(crate) type BoxIo = Box<dyn Io>;

const READ_CHUNK: usize = 8 * 1024;

/// A transport with a pull-through read buffer.
#[derive(Debug)]
pub(crate) struct Buffered<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> Buffered<R> {
    pub(crate) fn new(inner: R) -> Buffered<R> {
        Buffered {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub(crate) fn with_readahead(inner: R, readahead: BytesMut) -> Buffered<R> {
        Buffered {
            inner,
            buf: readahead,
        }
    }

    /// The unconsumed buffered bytes.
    pub(crate) fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub(crate) fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub(crate) fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

impl<R: AsyncRead + Unpin> Buffered<R> {
    /// Read more transport bytes into the buffer. Returns 0 at EOF.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Buffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(buf.remaining());
            buf.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R: AsyncRead + Unpin> AsyncBufRead for Buffered<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            this.buf.reserve(READ_CHUNK);
            let mut tmp = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    this.buf.extend_from_slice(read_buf.filled());
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(&this.buf[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().buf.advance(amt);
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for Buffered<R> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn readahead_is_served_first() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b" world").await.unwrap();
        });
        let mut buffered = Buffered::with_readahead(client, BytesMut::from(&b"hello"[..]));
        let mut out = vec![0u8; 5];
        buffered.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
        buffered.read_exact(&mut out[..1]).await.unwrap();
        assert_eq!(&out[..1], b" ");
    }
}
