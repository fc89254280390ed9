//! A pooled HTTP/1.x client connection.
//!
//! The transport is split once at creation; the read half lives inside a
//! buffered reader that message heads are parsed from and that body
//! adapters consume, the write half serializes heads and bodies. The
//! halves travel together again whenever the connection sits idle in
//! the pool.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::io::WriteHalf;

use crate::body::{BoxIo, Buffered, ReadConn};

pub(crate) struct Http1Conn {
    pub(crate) read: ReadConn,
    pub(crate) write: WriteHalf<BoxIo>,
    pub(crate) remote_addr: Option<SocketAddr>,
    /// Completed exchanges on this connection.
    pub(crate) requests_made: u32,
    /// Peer-declared `Keep-Alive: max=` cap.
    pub(crate) max_requests: Option<u32>,
    /// Current keep-alive idle allowance.
    pub(crate) keepalive: Duration,
    pub(crate) idle_since: Instant,
}

impl Http1Conn {
    pub(crate) fn new(io: BoxIo, remote_addr: Option<SocketAddr>, keepalive: Duration) -> Http1Conn {
        let (read, write) = tokio::io::split(io);
        Http1Conn {
            read: Buffered::new(read),
            write,
            remote_addr,
            requests_made: 0,
            max_requests: None,
            keepalive,
            idle_since: Instant::now(),
        }
    }

    /// Reassemble after a body reclaimed the read half.
    pub(crate) fn reassemble(
        read: ReadConn,
        write: WriteHalf<BoxIo>,
        remote_addr: Option<SocketAddr>,
        requests_made: u32,
        max_requests: Option<u32>,
        keepalive: Duration,
    ) -> Http1Conn {
        Http1Conn {
            read,
            write,
            remote_addr,
            requests_made,
            max_requests,
            keepalive,
            idle_since: Instant::now(),
        }
    }

    /// The idle timer fired, or the peer's request budget ran out.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        if now.duration_since(self.idle_since) >= self.keepalive {
            return true;
        }
        match self.max_requests {
            Some(max) => self.requests_made >= max,
            None => false,
        }
    }
}
