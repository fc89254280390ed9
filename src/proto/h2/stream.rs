//! Per-stream state: the protocol state machine, the buffer rings for
//! each direction, and the handle exposed to application code.
//!
//! A stream record lives in its session's stream table and is only ever
//! mutated under the session lock. The handle owns no state of its own;
//! every operation locks, inspects, and either completes or parks on one
//! of the stream's two condition signals (receive readiness and send
//! readiness).

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use super::frame::{Priority, Reason, StreamId};
use super::flow::{RecvFlow, SendFlow};
use super::hpack::Pseudo;
use super::session::{Shared, StreamError};
use crate::header::HeaderMap;
use crate::{Error, Result};

/// Handling of a stream's buffered octets once released.
///
/// `Zeroize` wipes buffer chunks before they are freed. `Lock`
/// additionally pins chunks to their ring slot for their lifetime; a
/// portable crate cannot promise more than that, so the wipe is the
/// guarantee both levels share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemorySafety {
    /// Plain buffers.
    #[default]
    None,
    /// Wipe buffer chunks when they are released.
    Zeroize,
    /// Wipe and pin buffer chunks.
    Lock,
}

/// Stream states, named after the protocol RFC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl State {
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }

    /// Can the peer still send us DATA/HEADERS on this stream?
    pub(crate) fn is_recv_open(&self) -> bool {
        matches!(
            self,
            State::Idle | State::ReservedRemote | State::Open | State::HalfClosedLocal
        )
    }

    /// Can we still send on this stream?
    pub(crate) fn is_send_open(&self) -> bool {
        matches!(
            self,
            State::Idle | State::ReservedLocal | State::Open | State::HalfClosedRemote
        )
    }

    /// Advance for locally-sent HEADERS.
    pub(crate) fn send_headers(&mut self, end_stream: bool) {
        *self = match (*self, end_stream) {
            (State::Idle, false) => State::Open,
            (State::Idle, true) => State::HalfClosedLocal,
            (State::ReservedLocal, false) => State::HalfClosedRemote,
            (State::ReservedLocal, true) => State::Closed,
            (state, _) => state,
        };
        if end_stream {
            self.send_end();
        }
    }

    /// Advance for peer-received HEADERS.
    pub(crate) fn recv_headers(&mut self, end_stream: bool) {
        *self = match *self {
            State::Idle => State::Open,
            State::ReservedRemote => State::HalfClosedLocal,
            state => state,
        };
        if end_stream {
            self.recv_end();
        }
    }

    /// We attached END_STREAM to an outbound frame.
    pub(crate) fn send_end(&mut self) {
        *self = match *self {
            State::Open => State::HalfClosedLocal,
            State::HalfClosedRemote | State::ReservedLocal => State::Closed,
            State::Idle => State::HalfClosedLocal,
            state => state,
        };
    }

    /// The peer attached END_STREAM.
    pub(crate) fn recv_end(&mut self) {
        *self = match *self {
            State::Open => State::HalfClosedRemote,
            State::HalfClosedLocal | State::ReservedRemote => State::Closed,
            State::Idle => State::HalfClosedRemote,
            state => state,
        };
    }
}

/// A stream record in the session table. All fields are guarded by the
/// session lock.
#[derive(Debug)]
pub(crate) struct StreamRec {
    pub(crate) id: StreamId,
    pub(crate) state: State,

    pub(crate) recv_buf: VecDeque<BytesMut>,
    pub(crate) recv_buffered: usize,
    pub(crate) recv_flow: RecvFlow,
    /// Headers delivered by the read loop, pending pickup by the handle.
    /// A second entry is the trailer block.
    pub(crate) recv_headers: VecDeque<(Pseudo, HeaderMap)>,
    pub(crate) recv_end: bool,

    pub(crate) send_buf: VecDeque<BytesMut>,
    pub(crate) send_buffered: usize,
    /// Ring capacity in octets: nominal window plus two chunks.
    pub(crate) send_capacity: usize,
    pub(crate) send_flow: SendFlow,
    /// Outbound head staged until the write loop may emit HEADERS.
    pub(crate) pending_headers: Option<(Pseudo, HeaderMap, bool)>,
    pub(crate) headers_sent: bool,
    /// `finalize()` latch: END_STREAM rides the last DATA frame.
    pub(crate) finalizing: bool,
    pub(crate) end_sent: bool,

    pub(crate) pending_priority: Option<Priority>,
    pub(crate) weight: u8,
    pub(crate) pending_window_update: u32,
    pub(crate) pending_reset: Option<Reason>,
    pub(crate) reset_sent: bool,

    pub(crate) paused: bool,
    pub(crate) dirty: bool,
    pub(crate) error: Option<StreamError>,
    pub(crate) memory: MemorySafety,
    /// The application dropped its handle; the record may be reaped once
    /// both halves close.
    pub(crate) released: bool,

    pub(crate) recv_notify: Arc<Notify>,
    pub(crate) send_notify: Arc<Notify>,
}

impl StreamRec {
    pub(crate) fn new(
        id: StreamId,
        state: State,
        recv_window: u32,
        send_window: u32,
        max_frame_size: u32,
    ) -> StreamRec {
        StreamRec {
            id,
            state,
            recv_buf: VecDeque::new(),
            recv_buffered: 0,
            recv_flow: RecvFlow::new(recv_window),
            recv_headers: VecDeque::new(),
            recv_end: false,
            send_buf: VecDeque::new(),
            send_buffered: 0,
            send_capacity: send_window as usize + 2 * max_frame_size as usize,
            send_flow: SendFlow::new(send_window),
            pending_headers: None,
            headers_sent: false,
            finalizing: false,
            end_sent: false,
            pending_priority: None,
            weight: 15,
            pending_window_update: 0,
            pending_reset: None,
            reset_sent: false,
            paused: false,
            dirty: false,
            error: None,
            memory: MemorySafety::None,
            released: false,
            recv_notify: Arc::new(Notify::new()),
            send_notify: Arc::new(Notify::new()),
        }
    }

    /// Queue received DATA. The caller has already accounted for flow
    /// control.
    pub(crate) fn push_recv(&mut self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        // copy into an owned chunk so it can be wiped independently of
        // the shared parse buffer
        let chunk = BytesMut::from(&payload[..]);
        self.recv_buffered += chunk.len();
        self.recv_buf.push_back(chunk);
    }

    /// Pop received octets into `dst`, returning how many were copied.
    pub(crate) fn pop_recv(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(mut chunk) = self.recv_buf.pop_front() else {
                break;
            };
            let take = chunk.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;
            if take < chunk.len() {
                let mut rest = chunk.split_off(take);
                self.wipe(&mut chunk);
                self.recv_buf.push_front(rest.split());
                break;
            }
            self.wipe(&mut chunk);
        }
        self.recv_buffered -= copied;
        copied
    }

    /// Queue outbound octets, bounded by the ring capacity. Returns how
    /// many were accepted.
    pub(crate) fn push_send(&mut self, src: &[u8]) -> usize {
        let room = self.send_capacity.saturating_sub(self.send_buffered);
        let take = room.min(src.len());
        if take > 0 {
            self.send_buf.push_back(BytesMut::from(&src[..take]));
            self.send_buffered += take;
        }
        take
    }

    /// Pull at most `limit` octets off the send ring for framing.
    pub(crate) fn pop_send(&mut self, limit: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(limit.min(self.send_buffered));
        while out.len() < limit {
            let Some(mut chunk) = self.send_buf.pop_front() else {
                break;
            };
            let take = chunk.len().min(limit - out.len());
            out.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                let rest = chunk.split_off(take);
                self.wipe(&mut chunk);
                self.send_buf.push_front(rest);
                break;
            }
            self.wipe(&mut chunk);
        }
        self.send_buffered -= out.len();
        out.freeze()
    }

    fn wipe(&self, chunk: &mut BytesMut) {
        if !matches!(self.memory, MemorySafety::None) {
            chunk.fill(0);
        }
    }

    /// Tear the stream down with `err`, waking both directions. Already
    /// buffered receive data stays readable; the send side is dropped.
    pub(crate) fn fail(&mut self, err: StreamError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.state = State::Closed;
        let wipe = !matches!(self.memory, MemorySafety::None);
        for chunk in self.send_buf.iter_mut() {
            if wipe {
                chunk.fill(0);
            }
        }
        self.send_buf.clear();
        self.send_buffered = 0;
        self.pending_headers = None;
        self.recv_notify.notify_waiters();
        self.send_notify.notify_waiters();
    }

    pub(crate) fn notify_all(&self) {
        self.recv_notify.notify_waiters();
        self.send_notify.notify_waiters();
    }

    /// Both halves closed and nothing is left to write.
    pub(crate) fn is_spent(&self) -> bool {
        self.state.is_closed()
            && self.send_buffered == 0
            && self.pending_headers.is_none()
            && self.pending_reset.is_none()
    }
}

/// One HTTP/2 stream, presented as a byte-oriented duplex channel.
///
/// Reads blocks until data arrives, end-of-stream, or a stream error;
/// writes block while both flow-control windows are exhausted or the
/// outbound ring is full. Dropping the last handle releases the stream;
/// the record lingers until both halves close on the wire.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) id: StreamId,
}

impl StreamHandle {
    /// The stream identifier.
    pub fn id(&self) -> u32 {
        self.id.value()
    }

    /// Stage this side's header block (a server response head, or
    /// trailers). The write loop emits it in priority order.
    pub fn send_headers(
        &mut self,
        pseudo: Pseudo,
        headers: HeaderMap,
        end_stream: bool,
    ) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(err) = &state.fatal {
            return Err(err.to_error());
        }
        let Some(stream) = state.streams.get_mut(&self.id) else {
            return Err(Error::closed("stream released"));
        };
        if let Some(err) = &stream.error {
            return Err(err.to_error());
        }
        if stream.headers_sent || stream.pending_headers.is_some() {
            return Err(Error::validation("header block already staged"));
        }
        stream.pending_headers = Some((pseudo, headers, end_stream));
        if end_stream {
            stream.finalizing = true;
        }
        state.mark_dirty(self.id);
        drop(state);
        self.shared.write_notify.notify_one();
        Ok(())
    }

    /// Reads body octets into `buf`. Returns `Ok(0)` at end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notify = {
                let mut state = self.shared.lock();
                let fatal = state.fatal;
                let Some(stream) = state.streams.get_mut(&self.id) else {
                    return Err(Error::closed("stream released"));
                };
                if stream.recv_buffered > 0 {
                    let n = stream.pop_recv(buf);
                    let paused = stream.paused;
                    let released = if paused { None } else { stream.recv_flow.release(n) };
                    if let Some(increment) = released {
                        stream.pending_window_update += increment;
                        state.mark_dirty(self.id);
                    }
                    if !paused {
                        state.release_connection(n);
                    }
                    drop(state);
                    self.shared.write_notify.notify_one();
                    return Ok(n);
                }
                if stream.recv_end {
                    return Ok(0);
                }
                if let Some(err) = &stream.error {
                    return Err(err.to_error());
                }
                if let Some(err) = &fatal {
                    return Err(err.to_error());
                }
                stream.recv_notify.clone()
            };
            notify.notified().await;
        }
    }

    /// Waits for the next header block from the peer: the response head
    /// on a client stream, trailers on either side.
    pub async fn read_headers(&mut self) -> Result<(Pseudo, HeaderMap)> {
        loop {
            let notify = {
                let mut state = self.shared.lock();
                let fatal = state.fatal;
                let Some(stream) = state.streams.get_mut(&self.id) else {
                    return Err(Error::closed("stream released"));
                };
                if let Some(head) = stream.recv_headers.pop_front() {
                    return Ok(head);
                }
                if let Some(err) = &stream.error {
                    return Err(err.to_error());
                }
                if stream.recv_end {
                    return Err(Error::closed("stream ended without headers"));
                }
                if let Some(err) = &fatal {
                    return Err(err.to_error());
                }
                stream.recv_notify.clone()
            };
            notify.notified().await;
        }
    }

    /// Writes body octets. Completes once every octet is buffered for
    /// the write loop; blocks while the outbound ring is full.
    pub async fn write(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let notify = {
                let mut state = self.shared.lock();
                if let Some(err) = &state.fatal {
                    return Err(err.to_error());
                }
                let Some(stream) = state.streams.get_mut(&self.id) else {
                    return Err(Error::closed("stream released"));
                };
                if let Some(err) = &stream.error {
                    return Err(err.to_error());
                }
                if !stream.state.is_send_open() || stream.finalizing {
                    return Err(Error::stream(Reason::STREAM_CLOSED));
                }
                let accepted = stream.push_send(buf);
                if accepted > 0 {
                    buf = &buf[accepted..];
                    state.mark_dirty(self.id);
                    drop(state);
                    self.shared.write_notify.notify_one();
                    continue;
                }
                stream.send_notify.clone()
            };
            notify.notified().await;
        }
        Ok(())
    }

    /// Blocks until every buffered octet of this stream has been framed
    /// and handed to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        loop {
            let notify = {
                let mut state = self.shared.lock();
                let Some(stream) = state.streams.get_mut(&self.id) else {
                    return Err(Error::closed("stream released"));
                };
                if let Some(err) = &stream.error {
                    return Err(err.to_error());
                }
                if stream.send_buffered == 0 && stream.pending_headers.is_none() {
                    return Ok(());
                }
                if let Some(err) = &state.fatal {
                    return Err(err.to_error());
                }
                state.mark_dirty(self.id);
                let stream = state.streams.get_mut(&self.id).expect("stream present");
                stream.send_notify.clone()
            };
            self.shared.write_notify.notify_one();
            notify.notified().await;
        }
    }

    /// Half-closes the local direction: END_STREAM rides the last DATA
    /// frame (or the header block when nothing was written). Idempotent.
    pub async fn finalize(&mut self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let Some(stream) = state.streams.get_mut(&self.id) else {
                return Err(Error::closed("stream released"));
            };
            if stream.finalizing || stream.end_sent {
                return Ok(());
            }
            stream.finalizing = true;
            state.mark_dirty(self.id);
        }
        self.shared.write_notify.notify_one();
        self.flush().await
    }

    /// Closes the stream. With no error and both halves already closed
    /// this is a no-op; otherwise RST_STREAM is sent with the given code
    /// (CANCEL by default). Idempotent.
    pub fn close(&mut self, error: Option<Reason>) {
        let mut state = self.shared.lock();
        let Some(stream) = state.streams.get_mut(&self.id) else {
            return;
        };
        if stream.state.is_closed() || stream.reset_sent || stream.pending_reset.is_some() {
            return;
        }
        let reason = error.unwrap_or(Reason::CANCEL);
        stream.pending_reset = Some(reason);
        stream.fail(StreamError::Reset(reason));
        state.mark_dirty(self.id);
        drop(state);
        self.shared.write_notify.notify_one();
    }

    /// Schedules a PRIORITY frame carrying the given weight (1..=256)
    /// and dependency.
    pub fn set_priority(&mut self, weight: u16, parent: u32, exclusive: bool) {
        let weight = weight.clamp(1, 256) as u8;
        let mut state = self.shared.lock();
        let Some(stream) = state.streams.get_mut(&self.id) else {
            return;
        };
        let wire_weight = weight.saturating_sub(1);
        stream.weight = wire_weight;
        stream.pending_priority = Some(Priority {
            stream_id: self.id,
            dependency: StreamId::new(parent),
            exclusive,
            weight: wire_weight,
        });
        state.mark_dirty(self.id);
        drop(state);
        self.shared.write_notify.notify_one();
    }

    /// Stops returning receive credit to the peer. Inbound DATA is still
    /// buffered until the already-granted window runs dry, after which
    /// the peer is back-pressured.
    pub fn pause(&mut self) {
        let mut state = self.shared.lock();
        if let Some(stream) = state.streams.get_mut(&self.id) {
            stream.paused = true;
        }
    }

    /// Resumes receive credit, flushing any withheld WINDOW_UPDATE.
    pub fn unpause(&mut self) {
        let mut state = self.shared.lock();
        let Some(stream) = state.streams.get_mut(&self.id) else {
            return;
        };
        if !stream.paused {
            return;
        }
        stream.paused = false;
        let pending = stream.recv_flow.take_pending();
        if let Some(increment) = pending {
            stream.pending_window_update += increment;
            state.release_connection(increment as usize);
            state.mark_dirty(self.id);
            drop(state);
            self.shared.write_notify.notify_one();
        }
    }

    /// Selects buffer hygiene for this stream. Only applies while both
    /// rings are empty.
    pub fn set_memory_safety(&mut self, memory: MemorySafety) -> Result<()> {
        let mut state = self.shared.lock();
        let Some(stream) = state.streams.get_mut(&self.id) else {
            return Err(Error::closed("stream released"));
        };
        if stream.recv_buffered != 0 || stream.send_buffered != 0 {
            return Err(Error::validation(
                "memory safety can only change while buffers are empty",
            ));
        }
        stream.memory = memory;
        Ok(())
    }

    /// Measures round-trip time to the peer with a PING frame.
    pub async fn ping(&self) -> Result<Duration> {
        self.shared.ping().await
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let reap = match state.streams.get_mut(&self.id) {
            Some(stream) => {
                stream.released = true;
                stream.is_spent()
            }
            None => false,
        };
        if reap {
            state.reap(self.id);
        }
        drop(state);
        if reap {
            self.shared.idle_notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_both_ends() {
        let mut state = State::Idle;
        state.send_headers(false);
        assert_eq!(state, State::Open);
        state.send_end();
        assert_eq!(state, State::HalfClosedLocal);
        state.recv_end();
        assert_eq!(state, State::Closed);
    }

    #[test]
    fn headers_with_end_stream_half_close() {
        let mut state = State::Idle;
        state.recv_headers(true);
        assert_eq!(state, State::HalfClosedRemote);
        assert!(state.is_send_open());
        assert!(!state.is_recv_open());
        state.send_end();
        assert!(state.is_closed());
    }

    #[test]
    fn reserved_streams_mirror() {
        let mut remote = State::ReservedRemote;
        remote.recv_headers(false);
        assert_eq!(remote, State::HalfClosedLocal);

        let mut local = State::ReservedLocal;
        local.send_headers(false);
        assert_eq!(local, State::HalfClosedRemote);
    }

    #[test]
    fn ring_pop_partial_chunk() {
        let mut rec = StreamRec::new(StreamId::new(1), State::Open, 65_535, 65_535, 16_384);
        rec.push_recv(Bytes::from_static(b"hello world"));
        let mut buf = [0u8; 5];
        assert_eq!(rec.pop_recv(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(rec.recv_buffered, 6);
        let mut rest = [0u8; 16];
        assert_eq!(rec.pop_recv(&mut rest), 6);
        assert_eq!(&rest[..6], b" world");
    }

    #[test]
    fn send_ring_respects_capacity() {
        let mut rec = StreamRec::new(StreamId::new(1), State::Open, 16, 16, 8);
        // capacity = window + 2 chunks = 16 + 16 = 32
        let accepted = rec.push_send(&[0x61; 100]);
        assert_eq!(accepted, 32);
        assert_eq!(rec.push_send(b"x"), 0);
        let frame = rec.pop_send(10);
        assert_eq!(frame.len(), 10);
        assert_eq!(rec.send_buffered, 22);
        assert_eq!(rec.push_send(b"x"), 1);
    }
}
