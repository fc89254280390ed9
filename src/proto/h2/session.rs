//! The HTTP/2 session engine: one multiplexer per transport connection.
//!
//! A session runs two tasks. The read task parses frames off the
//! transport and dispatches them into the shared state; the write task
//! blocks on a single signal and, when woken, drains the control queue,
//! opens pending streams (subject to the peer's concurrency limit) and
//! services dirty streams in priority order. Application handles talk to
//! both tasks exclusively through the shared state and the per-stream
//! signals; the transport halves are each owned by exactly one task.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::{Bytes, BytesMut};
use http::Method;
use log::{debug, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{oneshot, Notify},
};

use super::flow::{RecvFlow, SendFlow};
use super::frame::{
    Continuation, Data, Frame, GoAway, Headers, Ping, Reason, Reset, Settings, StreamId,
    WindowUpdate, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, PREFACE,
};
use super::hpack::{Decoder, Encoder, HeaderBlockError, Pseudo};
use super::stream::{State, StreamHandle, StreamRec};
use crate::header::HeaderMap;
use crate::{Error, Result};

/// Which side of the connection this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Session configuration: the SETTINGS we announce plus timer policy.
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Our settings, announced in the initial SETTINGS frame.
    pub settings: Settings,
    /// Emit keep-alive PINGs at this interval while the session is idle.
    pub ping_interval: Option<Duration>,
    /// Tear the session down when no transport bytes arrive for this long.
    pub max_inactivity: Option<Duration>,
}

impl Default for H2Config {
    fn default() -> H2Config {
        H2Config {
            settings: Settings::default(),
            ping_interval: None,
            max_inactivity: None,
        }
    }
}

/// Resolved setting values, defaults applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Applied {
    pub(crate) enable_push: bool,
    pub(crate) max_concurrent_streams: u32,
    pub(crate) initial_window_size: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) max_header_list_size: u32,
}

impl Applied {
    fn new(settings: &Settings, role: Role) -> Applied {
        Applied {
            // locally, push only matters to the side that would receive it
            enable_push: settings.enable_push.unwrap_or(role == Role::Server),
            max_concurrent_streams: settings.max_concurrent_streams.unwrap_or(u32::MAX),
            initial_window_size: settings
                .initial_window_size
                .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: settings.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: settings.max_header_list_size.unwrap_or(u32::MAX),
        }
    }

    /// Overlay announced values; returns the INITIAL_WINDOW_SIZE delta
    /// to fan out to existing streams.
    fn merge(&mut self, settings: &Settings) -> i64 {
        let mut delta = 0;
        if let Some(v) = settings.enable_push {
            self.enable_push = v;
        }
        if let Some(v) = settings.max_concurrent_streams {
            self.max_concurrent_streams = v;
        }
        if let Some(v) = settings.initial_window_size {
            delta = v as i64 - self.initial_window_size as i64;
            self.initial_window_size = v;
        }
        if let Some(v) = settings.max_frame_size {
            self.max_frame_size = v;
        }
        if let Some(v) = settings.max_header_list_size {
            self.max_header_list_size = v;
        }
        delta
    }
}

/// A session-fatal condition, shared with every stream.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SessionError {
    Closed(&'static str),
    Protocol(Reason, &'static str),
    Timeout(&'static str),
}

impl SessionError {
    pub(crate) fn to_error(&self) -> Error {
        match self {
            SessionError::Closed(what) => Error::closed(what),
            SessionError::Protocol(reason, msg) => Error::protocol(*reason, msg),
            SessionError::Timeout(op) => Error::timeout(op),
        }
    }
}

/// Why a single stream failed while the session lives on.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StreamError {
    /// RST_STREAM sent or received with this code.
    Reset(Reason),
    /// The peer went away before processing this stream.
    Refused,
    /// The whole session failed.
    Session(SessionError),
}

impl StreamError {
    pub(crate) fn to_error(&self) -> Error {
        match self {
            StreamError::Reset(reason) => Error::stream(*reason),
            StreamError::Refused => Error::stream(Reason::REFUSED_STREAM),
            StreamError::Session(err) => err.to_error(),
        }
    }
}

struct PendingPing {
    sent_at: Instant,
    tx: oneshot::Sender<Duration>,
}

struct HeaderAccum {
    stream_id: StreamId,
    /// Set for PUSH_PROMISE blocks: the reserved stream id.
    promised: Option<StreamId>,
    end_stream: bool,
    fragments: BytesMut,
}

/// A request the read loop accepted, waiting for the server engine.
#[derive(Debug)]
pub struct PeerRequest {
    /// The pseudo-header fields of the request head.
    pub pseudo: Pseudo,
    /// The regular request headers.
    pub headers: HeaderMap,
    /// True when the request carries no body.
    pub end_stream: bool,
    /// The stream the response goes out on.
    pub stream: StreamHandle,
}

pub(crate) struct SessionState {
    pub(crate) streams: HashMap<StreamId, StreamRec>,
    dirty: VecDeque<StreamId>,
    pending_open: VecDeque<StreamId>,
    control: VecDeque<Frame>,
    pub(crate) fatal: Option<SessionError>,

    local: Applied,
    peer: Applied,
    conn_send: SendFlow,
    conn_recv: RecvFlow,

    next_local_id: StreamId,
    max_peer_id: StreamId,
    goaway_sent: Option<(StreamId, Reason)>,
    goaway_recv: Option<(StreamId, Reason)>,

    pings: HashMap<[u8; 8], PendingPing>,
    ping_seq: u32,

    accept_queue: VecDeque<(StreamId, Pseudo, HeaderMap, bool)>,
    accept_closed: bool,
    /// Parked push promises, keyed by request fingerprint.
    pushed: HashMap<String, StreamId>,
    /// Ids we reset recently; frames racing the reset are tolerated.
    recently_reset: VecDeque<StreamId>,
    header_accum: Option<HeaderAccum>,

    hpack_tx: Encoder,
    hpack_rx: Decoder,
}

const RESET_GRACE_ENTRIES: usize = 32;

impl SessionState {
    /// Queue the stream for the write loop.
    pub(crate) fn mark_dirty(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if !stream.dirty {
                stream.dirty = true;
                self.dirty.push_back(id);
            }
        }
    }

    /// The application consumed `n` octets: feed the connection-level
    /// WINDOW_UPDATE policy.
    pub(crate) fn release_connection(&mut self, n: usize) {
        if let Some(increment) = self.conn_recv.release(n) {
            self.control.push_back(Frame::WindowUpdate(WindowUpdate {
                stream_id: StreamId::ZERO,
                increment,
            }));
        }
    }

    /// Drop a finished stream record.
    pub(crate) fn reap(&mut self, id: StreamId) {
        if self.streams.remove(&id).is_some() {
            trace!("stream {id} reaped");
        }
    }

    fn remember_reset(&mut self, id: StreamId) {
        if self.recently_reset.len() == RESET_GRACE_ENTRIES {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(id);
    }

    fn local_active(&self, role: Role) -> usize {
        self.streams
            .values()
            .filter(|s| {
                s.headers_sent
                    && !s.state.is_closed()
                    && match role {
                        Role::Client => s.id.is_client_initiated(),
                        Role::Server => s.id.is_server_initiated(),
                    }
            })
            .count()
    }

    fn peer_active(&self, role: Role) -> usize {
        self.streams
            .values()
            .filter(|s| {
                !s.state.is_closed()
                    && match role {
                        Role::Client => s.id.is_server_initiated(),
                        Role::Server => s.id.is_client_initiated(),
                    }
            })
            .count()
    }

    fn new_stream(&mut self, id: StreamId, state: State) -> &mut StreamRec {
        let rec = StreamRec::new(
            id,
            state,
            self.local.initial_window_size,
            self.peer.initial_window_size,
            self.peer.max_frame_size,
        );
        self.streams.entry(id).or_insert(rec)
    }
}

pub(crate) struct Shared {
    pub(crate) role: Role,
    state: Mutex<SessionState>,
    pub(crate) write_notify: Notify,
    accept_notify: Notify,
    pub(crate) idle_notify: Notify,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("h2::Shared").field("role", &self.role).finish()
    }
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Round-trip a PING and measure the elapsed time.
    pub(crate) async fn ping(&self) -> Result<Duration> {
        let rx = {
            let mut state = self.lock();
            if let Some(err) = &state.fatal {
                return Err(err.to_error());
            }
            // opaque payload: time of day plus a sequence number, so
            // concurrent pings stay distinguishable
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos() as u64 ^ (d.as_secs() << 32))
                .unwrap_or(0);
            state.ping_seq = state.ping_seq.wrapping_add(1);
            let mut payload = [0u8; 8];
            payload[..4].copy_from_slice(&(nanos as u32).to_be_bytes());
            payload[4..].copy_from_slice(&state.ping_seq.to_be_bytes());

            let (tx, rx) = oneshot::channel();
            state.pings.insert(
                payload,
                PendingPing {
                    sent_at: Instant::now(),
                    tx,
                },
            );
            state.control.push_back(Frame::Ping(Ping::new(payload)));
            rx
        };
        self.write_notify.notify_one();
        rx.await.map_err(|_| Error::closed("session closed"))
    }

    /// Mark the session failed, poison every stream and wake the world.
    fn fail(&self, state: &mut SessionState, err: SessionError) {
        if state.fatal.is_some() {
            return;
        }
        debug!("session failed: {:?}", err);
        state.fatal = Some(err);
        if let SessionError::Protocol(reason, _) = err {
            if state.goaway_sent.is_none() {
                let last = state.max_peer_id;
                state.goaway_sent = Some((last, reason));
                state.control.push_back(Frame::GoAway(GoAway::new(last, reason)));
            }
        }
        for stream in state.streams.values_mut() {
            stream.fail(StreamError::Session(err));
        }
        state.pings.clear();
        state.accept_closed = true;
        self.accept_notify.notify_waiters();
        self.idle_notify.notify_waiters();
        self.write_notify.notify_one();
    }
}

/// An HTTP/2 session over one transport connection.
///
/// Cloning yields another handle to the same session; the session stays
/// alive while any stream is still draining.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Starts a client session: sends the connection preface and the
    /// initial SETTINGS, then drives frames both ways.
    pub fn client<T>(io: T, config: H2Config) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(io, Role::Client, config, Bytes::new(), true, None)
    }

    /// Starts a server session. `readahead` carries transport bytes the
    /// caller consumed while sniffing the protocol; the client preface
    /// is expected at the front.
    pub fn server<T>(io: T, config: H2Config, readahead: Bytes) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(io, Role::Server, config, readahead, false, None)
    }

    /// Client side of the h2c upgrade: the request already went out on
    /// HTTP/1.1, its response arrives as stream 1.
    pub(crate) fn client_upgraded<T>(
        io: T,
        config: H2Config,
        readahead: Bytes,
    ) -> (Session, StreamHandle)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Session::start(io, Role::Client, config, readahead, true, Some(Upgraded::Client));
        let handle = StreamHandle {
            shared: session.shared.clone(),
            id: StreamId::new(1),
        };
        (session, handle)
    }

    /// Server side of the h2c upgrade: the request that carried the
    /// upgrade is delivered as stream 1, already half-closed remote.
    /// `readahead` holds transport bytes consumed past the 101; the
    /// connection preface is still expected at the front of the stream.
    pub(crate) fn server_upgraded<T>(
        io: T,
        config: H2Config,
        readahead: Bytes,
        peer_settings: Settings,
        pseudo: Pseudo,
        headers: HeaderMap,
        body: Bytes,
    ) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(
            io,
            Role::Server,
            config,
            readahead,
            false,
            Some(Upgraded::Server {
                peer_settings,
                pseudo,
                headers,
                body,
            }),
        )
    }

    fn start<T>(
        io: T,
        role: Role,
        config: H2Config,
        readahead: Bytes,
        send_preface: bool,
        upgraded: Option<Upgraded>,
    ) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let local = Applied::new(&config.settings, role);
        let peer_defaults = Settings::default();
        let mut state = SessionState {
            streams: HashMap::new(),
            dirty: VecDeque::new(),
            pending_open: VecDeque::new(),
            control: VecDeque::new(),
            fatal: None,
            local,
            peer: Applied::new(&peer_defaults, role),
            conn_send: SendFlow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            conn_recv: RecvFlow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            next_local_id: match role {
                Role::Client => StreamId::new(1),
                Role::Server => StreamId::new(2),
            },
            max_peer_id: StreamId::ZERO,
            goaway_sent: None,
            goaway_recv: None,
            pings: HashMap::new(),
            ping_seq: 0,
            accept_queue: VecDeque::new(),
            accept_closed: false,
            pushed: HashMap::new(),
            recently_reset: VecDeque::new(),
            header_accum: None,
            hpack_tx: Encoder::new(),
            hpack_rx: Decoder::new(local.max_header_list_size),
        };

        // seed stream 1 for the h2c upgrade dance
        match upgraded {
            Some(Upgraded::Client) => {
                let id = StreamId::new(1);
                state.next_local_id = StreamId::new(3);
                let rec = state.new_stream(id, State::HalfClosedLocal);
                rec.headers_sent = true;
                rec.end_sent = true;
                rec.finalizing = true;
            }
            Some(Upgraded::Server {
                peer_settings,
                pseudo,
                headers,
                body,
            }) => {
                let id = StreamId::new(1);
                state.peer.merge(&peer_settings);
                state.max_peer_id = id;
                let rec = state.new_stream(id, State::HalfClosedRemote);
                rec.recv_end = true;
                if !body.is_empty() {
                    rec.push_recv(body);
                }
                state.accept_queue.push_back((id, pseudo, headers, true));
            }
            None => {}
        }

        let shared = Arc::new(Shared {
            role,
            state: Mutex::new(state),
            write_notify: Notify::new(),
            accept_notify: Notify::new(),
            idle_notify: Notify::new(),
        });
        if !shared.lock().accept_queue.is_empty() {
            shared.accept_notify.notify_one();
        }

        let (read_half, write_half) = tokio::io::split(io);
        let announce = config.settings;

        tokio::spawn(read_loop(
            shared.clone(),
            read_half,
            readahead,
            role == Role::Server,
            config.max_inactivity,
        ));
        tokio::spawn(write_loop(shared.clone(), write_half, send_preface, announce));
        if let Some(interval) = config.ping_interval {
            tokio::spawn(keepalive_loop(
                shared.clone(),
                interval,
                config.max_inactivity.unwrap_or(interval * 3),
            ));
        }

        Session { shared }
    }

    /// Opens a new locally-initiated stream carrying the given request
    /// head. The HEADERS frame goes out once the peer's concurrency
    /// limit permits; stream ids are assigned in call order.
    ///
    /// A parked PUSH_PROMISE matching the request fingerprint fulfills
    /// the request without sending anything.
    pub fn start_request(
        &self,
        pseudo: Pseudo,
        headers: HeaderMap,
        end_stream: bool,
    ) -> Result<StreamHandle> {
        let mut state = self.shared.lock();
        if let Some(err) = &state.fatal {
            return Err(err.to_error());
        }
        if state.goaway_recv.is_some() || state.goaway_sent.is_some() {
            return Err(Error::closed("session is going away"));
        }

        if pseudo.method == Some(Method::GET) {
            if let Some(id) = state.pushed.remove(&fingerprint(&pseudo)) {
                trace!("request fulfilled by pushed stream {id}");
                return Ok(StreamHandle {
                    shared: self.shared.clone(),
                    id,
                });
            }
        }

        let id = state.next_local_id;
        state.next_local_id = id.next();
        let rec = state.new_stream(id, State::Idle);
        rec.pending_headers = Some((pseudo, headers, end_stream));
        if end_stream {
            rec.finalizing = true;
        }
        state.pending_open.push_back(id);
        drop(state);
        self.shared.write_notify.notify_one();
        Ok(StreamHandle {
            shared: self.shared.clone(),
            id,
        })
    }

    /// Waits for the next peer-initiated request. Returns `None` once
    /// the session is closing and nothing further will arrive.
    pub async fn accept(&self) -> Option<PeerRequest> {
        loop {
            {
                let mut state = self.shared.lock();
                if let Some((id, pseudo, headers, end_stream)) = state.accept_queue.pop_front() {
                    return Some(PeerRequest {
                        pseudo,
                        headers,
                        end_stream,
                        stream: StreamHandle {
                            shared: self.shared.clone(),
                            id,
                        },
                    });
                }
                if state.accept_closed || state.fatal.is_some() {
                    return None;
                }
            }
            self.shared.accept_notify.notified().await;
        }
    }

    /// Measures round-trip time to the peer.
    pub async fn ping(&self) -> Result<Duration> {
        self.shared.ping().await
    }

    /// Sends GOAWAY with the given error code. Idempotent.
    pub fn stop(&self, reason: Reason) {
        let mut state = self.shared.lock();
        if state.goaway_sent.is_some() {
            return;
        }
        let last = state.max_peer_id;
        state.goaway_sent = Some((last, reason));
        state.accept_closed = true;
        state.control.push_back(Frame::GoAway(GoAway::new(last, reason)));
        drop(state);
        self.shared.accept_notify.notify_waiters();
        self.shared.write_notify.notify_one();
    }

    /// Graceful shutdown: advertise a zero concurrency limit as a
    /// shutdown notice, wait for in-flight streams to finish, then send
    /// GOAWAY(NO_ERROR).
    pub async fn stop_gracefully(&self) {
        {
            let mut state = self.shared.lock();
            if state.goaway_sent.is_some() {
                return;
            }
            state.accept_closed = true;
            let notice = Settings {
                max_concurrent_streams: Some(0),
                ..Settings::default()
            };
            state.control.push_back(Frame::Settings(notice));
        }
        self.shared.accept_notify.notify_waiters();
        self.shared.write_notify.notify_one();

        loop {
            {
                let state = self.shared.lock();
                if state.fatal.is_some() || state.streams.is_empty() {
                    break;
                }
            }
            self.shared.idle_notify.notified().await;
        }
        self.stop(Reason::NO_ERROR);
    }

    /// True once the session can no longer carry new streams.
    pub fn is_closed(&self) -> bool {
        let state = self.shared.lock();
        state.fatal.is_some() || state.goaway_sent.is_some() || state.goaway_recv.is_some()
    }

    /// True while a new request could be started right now without
    /// exceeding the peer's concurrency limit.
    pub fn can_open(&self) -> bool {
        let state = self.shared.lock();
        state.fatal.is_none()
            && state.goaway_sent.is_none()
            && state.goaway_recv.is_none()
            && ((state.local_active(self.shared.role) + state.pending_open.len()) as u32)
                < state.peer.max_concurrent_streams
    }

    /// Count of live streams.
    pub fn active_streams(&self) -> usize {
        self.shared.lock().streams.len()
    }
}

enum Upgraded {
    Client,
    Server {
        peer_settings: Settings,
        pseudo: Pseudo,
        headers: HeaderMap,
        body: Bytes,
    },
}

fn fingerprint(pseudo: &Pseudo) -> String {
    format!(
        "{}\n{}\n{}",
        pseudo.method.as_ref().map(Method::as_str).unwrap_or(""),
        pseudo.scheme.as_deref().unwrap_or(""),
        pseudo.path.as_deref().unwrap_or("")
    )
}

// ===== read loop =====

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut io: R,
    readahead: Bytes,
    expect_preface: bool,
    max_inactivity: Option<Duration>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    buf.extend_from_slice(&readahead);

    if expect_preface {
        if let Err(err) = read_preface(&mut io, &mut buf, max_inactivity).await {
            let mut state = shared.lock();
            shared.fail(&mut state, err);
            return;
        }
    }

    loop {
        // drain complete frames
        loop {
            let max_frame_size = shared.lock().local.max_frame_size;
            let mut flow_len = 0;
            match Frame::parse(&mut buf, max_frame_size, &mut flow_len) {
                Ok(Some(frame)) => {
                    if dispatch(&shared, frame, flow_len).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(fe) => {
                    warn!("frame error: {fe}");
                    let mut state = shared.lock();
                    shared.fail(
                        &mut state,
                        SessionError::Protocol(fe.reason(), "malformed frame"),
                    );
                    return;
                }
            }
        }

        let read = match max_inactivity {
            Some(limit) => match tokio::time::timeout(limit, io.read_buf(&mut buf)).await {
                Ok(res) => res,
                Err(_) => {
                    let mut state = shared.lock();
                    shared.fail(&mut state, SessionError::Timeout("session inactivity"));
                    return;
                }
            },
            None => io.read_buf(&mut buf).await,
        };
        match read {
            Ok(0) => {
                let mut state = shared.lock();
                shared.fail(&mut state, SessionError::Closed("peer closed transport"));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("transport read error: {e}");
                let mut state = shared.lock();
                shared.fail(&mut state, SessionError::Closed("transport read failed"));
                return;
            }
        }
    }
}

async fn read_preface<R>(
    io: &mut R,
    buf: &mut BytesMut,
    max_inactivity: Option<Duration>,
) -> std::result::Result<(), SessionError>
where
    R: AsyncRead + Send + Unpin,
{
    while buf.len() < PREFACE.len() {
        let read = match max_inactivity {
            Some(limit) => tokio::time::timeout(limit, io.read_buf(buf))
                .await
                .map_err(|_| SessionError::Timeout("connection preface"))?,
            None => io.read_buf(buf).await,
        };
        match read {
            Ok(0) => return Err(SessionError::Closed("peer closed transport")),
            Ok(_) => {}
            Err(_) => return Err(SessionError::Closed("transport read failed")),
        }
    }
    if &buf[..PREFACE.len()] != PREFACE {
        return Err(SessionError::Protocol(
            Reason::PROTOCOL_ERROR,
            "bad connection preface",
        ));
    }
    let _ = buf.split_to(PREFACE.len());
    Ok(())
}

/// Route one parsed frame. `Err(())` means the session is over.
fn dispatch(shared: &Shared, frame: Frame, flow_len: usize) -> std::result::Result<(), ()> {
    let mut state = shared.lock();
    if state.fatal.is_some() {
        return Err(());
    }

    // a started header block admits nothing but its own CONTINUATIONs
    if let Some(accum) = &state.header_accum {
        match &frame {
            Frame::Continuation(c) if c.stream_id == accum.stream_id => {}
            _ => {
                shared.fail(
                    &mut state,
                    SessionError::Protocol(
                        Reason::PROTOCOL_ERROR,
                        "interleaved frame inside header block",
                    ),
                );
                return Err(());
            }
        }
    }

    let result = match frame {
        Frame::Settings(settings) => on_settings(shared, &mut state, settings),
        Frame::Ping(ping) => on_ping(&mut state, ping),
        Frame::GoAway(goaway) => on_goaway(shared, &mut state, goaway),
        Frame::WindowUpdate(update) => on_window_update(shared, &mut state, update),
        Frame::Headers(headers) => on_headers(shared, &mut state, headers),
        Frame::Continuation(cont) => on_continuation(shared, &mut state, cont),
        Frame::Data(data) => on_data(shared, &mut state, data, flow_len),
        Frame::PushPromise(pp) => on_push_promise(shared, &mut state, pp),
        Frame::Reset(reset) => on_reset(shared, &mut state, reset),
        Frame::Priority(priority) => {
            if let Some(stream) = state.streams.get_mut(&priority.stream_id) {
                stream.weight = priority.weight;
            }
            Ok(())
        }
        Frame::Unknown => Ok(()),
    };

    match result {
        Ok(()) => {
            drop(state);
            shared.write_notify.notify_one();
            Ok(())
        }
        Err(err) => {
            shared.fail(&mut state, err);
            Err(())
        }
    }
}

type Dispatch = std::result::Result<(), SessionError>;

fn on_settings(shared: &Shared, state: &mut SessionState, settings: Settings) -> Dispatch {
    if settings.ack {
        trace!("peer acknowledged our settings");
        return Ok(());
    }
    let _ = shared;
    let delta = state.peer.merge(&settings);
    if delta != 0 {
        for stream in state.streams.values_mut() {
            if stream.send_flow.adjust(delta).is_err() {
                return Err(SessionError::Protocol(
                    Reason::FLOW_CONTROL_ERROR,
                    "INITIAL_WINDOW_SIZE overflow",
                ));
            }
            stream.send_notify.notify_waiters();
        }
        // windows may have opened: reschedule streams with buffered data
        let ids: Vec<StreamId> = state
            .streams
            .values()
            .filter(|s| s.send_buffered > 0)
            .map(|s| s.id)
            .collect();
        for id in ids {
            state.mark_dirty(id);
        }
    }
    state.control.push_back(Frame::Settings(Settings::ack()));
    Ok(())
}

fn on_ping(state: &mut SessionState, ping: Ping) -> Dispatch {
    if ping.ack {
        if let Some(pending) = state.pings.remove(&ping.payload) {
            let _ = pending.tx.send(pending.sent_at.elapsed());
        }
        return Ok(());
    }
    state.control.push_back(Frame::Ping(Ping::pong(ping.payload)));
    Ok(())
}

fn on_goaway(shared: &Shared, state: &mut SessionState, goaway: GoAway) -> Dispatch {
    debug!(
        "received GOAWAY last_stream_id={} reason={:?}",
        goaway.last_stream_id, goaway.reason
    );
    state.goaway_recv = Some((goaway.last_stream_id, goaway.reason));
    state.accept_closed = true;
    // streams past the watermark were never processed
    let locally_initiated = |id: StreamId| match shared.role {
        Role::Client => id.is_client_initiated(),
        Role::Server => id.is_server_initiated(),
    };
    for stream in state.streams.values_mut() {
        if locally_initiated(stream.id) && stream.id > goaway.last_stream_id {
            stream.fail(StreamError::Refused);
        }
    }
    state
        .pending_open
        .retain(|id| *id <= goaway.last_stream_id);
    shared.accept_notify.notify_waiters();
    Ok(())
}

fn on_window_update(shared: &Shared, state: &mut SessionState, update: WindowUpdate) -> Dispatch {
    if update.stream_id.is_zero() {
        if state.conn_send.expand(update.increment).is_err() {
            return Err(SessionError::Protocol(
                Reason::PROTOCOL_ERROR,
                "connection window overflow",
            ));
        }
        let ids: Vec<StreamId> = state
            .streams
            .values()
            .filter(|s| s.send_buffered > 0)
            .map(|s| s.id)
            .collect();
        for id in ids {
            state.mark_dirty(id);
        }
        for stream in state.streams.values() {
            stream.send_notify.notify_waiters();
        }
        return Ok(());
    }
    let _ = shared;
    let id = update.stream_id;
    let outcome = match state.streams.get_mut(&id) {
        Some(stream) => {
            if stream.send_flow.expand(update.increment).is_err() {
                stream.fail(StreamError::Reset(Reason::PROTOCOL_ERROR));
                Some(Err(Reason::PROTOCOL_ERROR))
            } else {
                stream.send_notify.notify_waiters();
                Some(Ok(stream.send_buffered > 0))
            }
        }
        None => None,
    };
    match outcome {
        Some(Err(reason)) => {
            if let Some(stream) = state.streams.get_mut(&id) {
                stream.pending_reset = Some(reason);
            }
            state.remember_reset(id);
            state.mark_dirty(id);
            Ok(())
        }
        Some(Ok(has_data)) => {
            if has_data {
                state.mark_dirty(id);
            }
            Ok(())
        }
        None => {
            // tolerated on recently-reset streams, idle ids are fatal
            if id > state.max_peer_id && id >= state.next_local_id {
                Err(SessionError::Protocol(
                    Reason::PROTOCOL_ERROR,
                    "WINDOW_UPDATE on idle stream",
                ))
            } else {
                Ok(())
            }
        }
    }
}

fn on_headers(shared: &Shared, state: &mut SessionState, headers: Headers) -> Dispatch {
    let id = headers.stream_id;
    if let Some(priority) = headers.priority {
        if let Some(stream) = state.streams.get_mut(&id) {
            stream.weight = priority.weight;
        }
    }
    let accum = HeaderAccum {
        stream_id: id,
        promised: None,
        end_stream: headers.end_stream,
        fragments: BytesMut::from(&headers.fragment[..]),
    };
    if headers.end_headers {
        finish_header_block(shared, state, accum)
    } else {
        state.header_accum = Some(accum);
        Ok(())
    }
}

fn on_continuation(shared: &Shared, state: &mut SessionState, cont: Continuation) -> Dispatch {
    let Some(mut accum) = state.header_accum.take() else {
        return Err(SessionError::Protocol(
            Reason::PROTOCOL_ERROR,
            "CONTINUATION without open header block",
        ));
    };
    accum.fragments.extend_from_slice(&cont.fragment);
    if cont.end_headers {
        finish_header_block(shared, state, accum)
    } else {
        state.header_accum = Some(accum);
        Ok(())
    }
}

fn finish_header_block(
    shared: &Shared,
    state: &mut SessionState,
    accum: HeaderAccum,
) -> Dispatch {
    let id = accum.stream_id;
    let (pseudo, headers) = match state.hpack_rx.decode(&accum.fragments) {
        Ok(decoded) => decoded,
        Err(HeaderBlockError::Compression) => {
            return Err(SessionError::Protocol(
                Reason::COMPRESSION_ERROR,
                "header block failed to decode",
            ));
        }
        Err(HeaderBlockError::TooLarge) => {
            // the dynamic table was still updated consistently; only
            // this stream is punished
            let target = accum.promised.unwrap_or(id);
            reset_stream(state, target, Reason::ENHANCE_YOUR_CALM);
            return Ok(());
        }
        Err(HeaderBlockError::Malformed(msg)) => {
            debug!("malformed header block on stream {id}: {msg}");
            let target = accum.promised.unwrap_or(id);
            reset_stream(state, target, Reason::PROTOCOL_ERROR);
            return Ok(());
        }
    };

    if let Some(promised) = accum.promised {
        let rec = state.new_stream(promised, State::ReservedRemote);
        rec.headers_sent = true;
        rec.end_sent = true;
        rec.finalizing = true;
        state.pushed.insert(fingerprint(&pseudo), promised);
        trace!("parked push promise for stream {promised}");
        return Ok(());
    }

    match shared.role {
        Role::Server => on_request_head(shared, state, id, pseudo, headers, accum.end_stream),
        Role::Client => {
            let Some(stream) = state.streams.get_mut(&id) else {
                if state.recently_reset.contains(&id) {
                    return Ok(());
                }
                return Err(SessionError::Protocol(
                    Reason::PROTOCOL_ERROR,
                    "HEADERS on unknown stream",
                ));
            };
            if !stream.state.is_recv_open() {
                reset_stream(state, id, Reason::STREAM_CLOSED);
                return Ok(());
            }
            stream.recv_headers.push_back((pseudo, headers));
            stream.state.recv_headers(accum.end_stream);
            if accum.end_stream {
                stream.recv_end = true;
            }
            stream.recv_notify.notify_waiters();
            Ok(())
        }
    }
}

fn on_request_head(
    shared: &Shared,
    state: &mut SessionState,
    id: StreamId,
    pseudo: Pseudo,
    headers: HeaderMap,
    end_stream: bool,
) -> Dispatch {
    if let Some(stream) = state.streams.get_mut(&id) {
        // trailers on an already-open request
        if !stream.state.is_recv_open() {
            reset_stream(state, id, Reason::STREAM_CLOSED);
            return Ok(());
        }
        stream.recv_headers.push_back((pseudo, headers));
        stream.state.recv_headers(end_stream);
        if end_stream {
            stream.recv_end = true;
        }
        stream.recv_notify.notify_waiters();
        return Ok(());
    }

    if !id.is_client_initiated() || id <= state.max_peer_id {
        return Err(SessionError::Protocol(
            Reason::PROTOCOL_ERROR,
            "stream id not monotonic",
        ));
    }
    state.max_peer_id = id;

    if !pseudo.is_request() {
        return Err(SessionError::Protocol(
            Reason::PROTOCOL_ERROR,
            "request without :method",
        ));
    }

    if state.goaway_sent.is_some() || state.accept_closed {
        // the shutdown notice already went out; refuse without
        // processing any application logic
        state
            .control
            .push_back(Frame::Reset(Reset {
                stream_id: id,
                reason: Reason::REFUSED_STREAM,
            }));
        state.remember_reset(id);
        return Ok(());
    }

    if state.peer_active(shared.role) as u32 >= state.local.max_concurrent_streams {
        state
            .control
            .push_back(Frame::Reset(Reset {
                stream_id: id,
                reason: Reason::REFUSED_STREAM,
            }));
        state.remember_reset(id);
        return Ok(());
    }

    let rec = state.new_stream(id, State::Idle);
    rec.state.recv_headers(end_stream);
    if end_stream {
        rec.recv_end = true;
    }
    state.accept_queue.push_back((id, pseudo, headers, end_stream));
    shared.accept_notify.notify_one();
    Ok(())
}

fn on_data(shared: &Shared, state: &mut SessionState, data: Data, flow_len: usize) -> Dispatch {
    // the connection window covers every DATA octet, streamless or not
    if state.conn_recv.receive(flow_len).is_err() {
        return Err(SessionError::Protocol(
            Reason::FLOW_CONTROL_ERROR,
            "connection flow window exceeded",
        ));
    }

    let id = data.stream_id;
    let Some(stream) = state.streams.get_mut(&id) else {
        let idle = match shared.role {
            Role::Server => id > state.max_peer_id,
            Role::Client => id >= state.next_local_id,
        };
        if idle {
            return Err(SessionError::Protocol(
                Reason::PROTOCOL_ERROR,
                "DATA on idle stream",
            ));
        }
        // closed or recently reset: swallow and refund the credit
        state.release_connection(flow_len);
        if !state.recently_reset.contains(&id) {
            state.control.push_back(Frame::Reset(Reset {
                stream_id: id,
                reason: Reason::STREAM_CLOSED,
            }));
            state.remember_reset(id);
        }
        return Ok(());
    };

    if stream.recv_flow.receive(flow_len).is_err() {
        return Err(SessionError::Protocol(
            Reason::FLOW_CONTROL_ERROR,
            "stream flow window exceeded",
        ));
    }

    if !stream.state.is_recv_open() {
        reset_stream(state, id, Reason::STREAM_CLOSED);
        state.release_connection(flow_len);
        return Ok(());
    }

    stream.push_recv(data.payload);
    if data.end_stream {
        stream.recv_end = true;
        stream.state.recv_end();
    }
    stream.recv_notify.notify_waiters();
    let spent = stream.released && stream.is_spent();
    if spent {
        state.reap(id);
        shared.idle_notify.notify_waiters();
    }
    Ok(())
}

fn on_push_promise(shared: &Shared, state: &mut SessionState, pp: crate::proto::h2::frame::PushPromise) -> Dispatch {
    if shared.role == Role::Server {
        return Err(SessionError::Protocol(
            Reason::PROTOCOL_ERROR,
            "PUSH_PROMISE from client",
        ));
    }
    if !state.local.enable_push {
        return Err(SessionError::Protocol(
            Reason::PROTOCOL_ERROR,
            "push is disabled",
        ));
    }
    if !pp.promised_id.is_server_initiated() || pp.promised_id <= state.max_peer_id {
        return Err(SessionError::Protocol(
            Reason::PROTOCOL_ERROR,
            "promised stream id not monotonic",
        ));
    }
    state.max_peer_id = pp.promised_id;
    let accum = HeaderAccum {
        stream_id: pp.stream_id,
        promised: Some(pp.promised_id),
        end_stream: false,
        fragments: BytesMut::from(&pp.fragment[..]),
    };
    if pp.end_headers {
        finish_header_block(shared, state, accum)
    } else {
        state.header_accum = Some(accum);
        Ok(())
    }
}

fn on_reset(shared: &Shared, state: &mut SessionState, reset: Reset) -> Dispatch {
    let id = reset.stream_id;
    if let Some(stream) = state.streams.get_mut(&id) {
        debug!("stream {id} reset by peer: {:?}", reset.reason);
        stream.fail(StreamError::Reset(reset.reason));
        let spent = stream.released;
        state.remember_reset(id);
        if spent {
            state.reap(id);
            shared.idle_notify.notify_waiters();
        }
    }
    Ok(())
}

fn reset_stream(state: &mut SessionState, id: StreamId, reason: Reason) {
    if let Some(stream) = state.streams.get_mut(&id) {
        stream.pending_reset = Some(reason);
        stream.fail(StreamError::Reset(reason));
        state.mark_dirty(id);
    } else {
        state.control.push_back(Frame::Reset(Reset {
            stream_id: id,
            reason,
        }));
    }
    state.remember_reset(id);
}

// ===== write loop =====

async fn write_loop<W>(shared: Arc<Shared>, mut io: W, send_preface: bool, announce: Settings)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut out = BytesMut::with_capacity(16 * 1024);
    if send_preface {
        out.extend_from_slice(PREFACE);
    }
    Frame::Settings(announce).encode(&mut out);

    loop {
        if out.is_empty() {
            let finished = {
                let mut state = shared.lock();
                build_batch(&shared, &mut state, &mut out)
            };
            if out.is_empty() {
                if finished {
                    break;
                }
                shared.write_notify.notified().await;
                continue;
            }
        }
        if let Err(e) = io.write_all(&out).await {
            debug!("transport write error: {e}");
            let mut state = shared.lock();
            shared.fail(&mut state, SessionError::Closed("transport write failed"));
            return;
        }
        out.clear();
        if let Err(e) = io.flush().await {
            debug!("transport flush error: {e}");
            let mut state = shared.lock();
            shared.fail(&mut state, SessionError::Closed("transport write failed"));
            return;
        }
    }
    let _ = io.shutdown().await;
}

/// Serialize everything currently writable. Returns true when the
/// session has nothing left to do, ever.
fn build_batch(shared: &Shared, state: &mut SessionState, out: &mut BytesMut) -> bool {
    let st = &mut *state;

    // control frames first: SETTINGS (and their ACKs), PING ACKs,
    // GOAWAY and connection window updates never queue behind DATA
    for frame in st.control.drain(..) {
        frame.encode(out);
    }

    // open pending streams, oldest first, inside the concurrency cap
    while let Some(&id) = st.pending_open.front() {
        if st.fatal.is_some() {
            break;
        }
        let active = st.local_active(shared.role) as u32;
        if active >= st.peer.max_concurrent_streams {
            trace!("holding stream {id}: peer concurrency limit reached");
            break;
        }
        st.pending_open.pop_front();
        let Some(stream) = st.streams.get_mut(&id) else {
            continue;
        };
        if stream.error.is_some() {
            continue;
        }
        let Some((pseudo, headers, end_stream)) = stream.pending_headers.take() else {
            continue;
        };
        let end_stream = end_stream || (stream.finalizing && stream.send_buffered == 0);
        let block = st.hpack_tx.encode(&pseudo, &headers);
        emit_header_block(out, id, &block, end_stream, st.peer.max_frame_size);
        stream.headers_sent = true;
        stream.state.send_headers(end_stream);
        if end_stream {
            stream.end_sent = true;
        }
        stream.send_notify.notify_waiters();
    }

    // dirty streams, highest priority weight first
    let mut round: Vec<StreamId> = st.dirty.drain(..).collect();
    round.sort_by_key(|id| {
        std::cmp::Reverse(st.streams.get(id).map(|s| s.weight).unwrap_or(0))
    });
    for id in round {
        // a stream still queued behind the concurrency gate must not
        // leak its head through the dirty path
        let gated = st.pending_open.contains(&id);
        let Some(stream) = st.streams.get_mut(&id) else {
            continue;
        };
        stream.dirty = false;

        if let Some(priority) = stream.pending_priority.take() {
            Frame::Priority(priority).encode(out);
        }

        if stream.pending_window_update > 0 {
            let increment = stream.pending_window_update;
            stream.pending_window_update = 0;
            Frame::WindowUpdate(WindowUpdate {
                stream_id: id,
                increment,
            })
            .encode(out);
        }

        // a server response head (client request heads go via pending_open)
        if stream.pending_reset.is_none() && !gated {
            if let Some((pseudo, headers, end_stream)) = stream.pending_headers.take() {
                let end_stream = end_stream || (stream.finalizing && stream.send_buffered == 0);
                let block = st.hpack_tx.encode(&pseudo, &headers);
                emit_header_block(out, id, &block, end_stream, st.peer.max_frame_size);
                stream.headers_sent = true;
                stream.state.send_headers(end_stream);
                if end_stream {
                    stream.end_sent = true;
                }
            }
        }

        // DATA, bounded by both windows and the peer's frame size
        if stream.headers_sent && stream.pending_reset.is_none() {
            while stream.send_buffered > 0 {
                let window = stream
                    .send_flow
                    .available()
                    .min(st.conn_send.available());
                if window <= 0 {
                    // parked until a WINDOW_UPDATE re-marks us dirty
                    trace!("stream {id} blocked on flow control");
                    break;
                }
                let budget = (window as usize)
                    .min(st.peer.max_frame_size as usize)
                    .min(stream.send_buffered);
                let payload = stream.pop_send(budget);
                let len = payload.len();
                stream.send_flow.consume(len);
                st.conn_send.consume(len);
                let end_stream =
                    stream.finalizing && stream.send_buffered == 0 && !stream.end_sent;
                if end_stream {
                    stream.end_sent = true;
                    stream.state.send_end();
                }
                Frame::Data(Data {
                    stream_id: id,
                    payload,
                    end_stream,
                })
                .encode(out);
            }
            // room freed for writers, and flush() watchers may proceed
            stream.send_notify.notify_waiters();

            // bare END_STREAM after the buffer drained
            if stream.finalizing && stream.send_buffered == 0 && !stream.end_sent {
                stream.end_sent = true;
                stream.state.send_end();
                Frame::Data(Data {
                    stream_id: id,
                    payload: Bytes::new(),
                    end_stream: true,
                })
                .encode(out);
            }
        }

        if let Some(reason) = stream.pending_reset.take() {
            if !stream.reset_sent {
                stream.reset_sent = true;
                stream.state = State::Closed;
                Frame::Reset(Reset {
                    stream_id: id,
                    reason,
                })
                .encode(out);
            }
        }

        let spent = stream.is_spent() && stream.released;
        if spent {
            st.reap(id);
            shared.idle_notify.notify_waiters();
        }
    }

    if st.fatal.is_some() {
        return st.control.is_empty();
    }
    st.goaway_sent.is_some()
        && st.control.is_empty()
        && st.dirty.is_empty()
        && st.pending_open.is_empty()
        && st.streams.is_empty()
}

/// Split a header block into HEADERS + CONTINUATION frames of at most
/// `max_frame_size` octets each.
fn emit_header_block(
    out: &mut BytesMut,
    id: StreamId,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) {
    let max = max_frame_size as usize;
    let first_len = block.len().min(max);
    let (first, mut rest) = block.split_at(first_len);
    Frame::Headers(Headers {
        stream_id: id,
        fragment: Bytes::copy_from_slice(first),
        end_stream,
        end_headers: rest.is_empty(),
        priority: None,
    })
    .encode(out);
    while !rest.is_empty() {
        let take = rest.len().min(max);
        let (chunk, remaining) = rest.split_at(take);
        rest = remaining;
        Frame::Continuation(Continuation {
            stream_id: id,
            fragment: Bytes::copy_from_slice(chunk),
            end_headers: rest.is_empty(),
        })
        .encode(out);
    }
}

// ===== keep-alive =====

async fn keepalive_loop(shared: Arc<Shared>, interval: Duration, timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        {
            let state = shared.lock();
            if state.fatal.is_some() {
                return;
            }
        }
        match tokio::time::timeout(timeout, shared.ping()).await {
            Ok(Ok(rtt)) => trace!("keep-alive ping rtt={rtt:?}"),
            Ok(Err(_)) => return,
            Err(_) => {
                let mut state = shared.lock();
                shared.fail(&mut state, SessionError::Timeout("keep-alive ping"));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_defaults() {
        let applied = Applied::new(&Settings::default(), Role::Client);
        assert!(!applied.enable_push);
        assert_eq!(applied.max_concurrent_streams, u32::MAX);
        assert_eq!(applied.initial_window_size, DEFAULT_INITIAL_WINDOW_SIZE);
        assert_eq!(applied.max_frame_size, DEFAULT_MAX_FRAME_SIZE);

        let server = Applied::new(&Settings::default(), Role::Server);
        assert!(server.enable_push);
    }

    #[test]
    fn merge_reports_window_delta() {
        let mut applied = Applied::new(&Settings::default(), Role::Client);
        let update = Settings {
            initial_window_size: Some(1024),
            ..Settings::default()
        };
        assert_eq!(applied.merge(&update), 1024 - 65_535);
        assert_eq!(applied.initial_window_size, 1024);
    }

    #[test]
    fn fingerprint_shape() {
        let pseudo = Pseudo::request(Method::GET, "https", "example.com", "/a");
        assert_eq!(fingerprint(&pseudo), "GET\nhttps\n/a");
    }

    #[test]
    fn header_block_fragmentation() {
        let mut out = BytesMut::new();
        let block = vec![0xaa; 40];
        emit_header_block(&mut out, StreamId::new(1), &block, true, 16);
        // HEADERS(16) + CONTINUATION(16) + CONTINUATION(8)
        let mut flow = 0;
        let first = Frame::parse(&mut out, 16_384, &mut flow).unwrap().unwrap();
        match first {
            Frame::Headers(h) => {
                assert_eq!(h.fragment.len(), 16);
                assert!(h.end_stream);
                assert!(!h.end_headers);
            }
            other => panic!("{other:?}"),
        }
        let second = Frame::parse(&mut out, 16_384, &mut flow).unwrap().unwrap();
        match second {
            Frame::Continuation(c) => {
                assert_eq!(c.fragment.len(), 16);
                assert!(!c.end_headers);
            }
            other => panic!("{other:?}"),
        }
        let third = Frame::parse(&mut out, 16_384, &mut flow).unwrap().unwrap();
        match third {
            Frame::Continuation(c) => {
                assert_eq!(c.fragment.len(), 8);
                assert!(c.end_headers);
            }
            other => panic!("{other:?}"),
        }
    }
}
