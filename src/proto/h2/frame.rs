//! HTTP/2 frame types and the wire codec.
//!
//! Every frame knows how to `load` itself from a frame head plus payload
//! bytes and how to `encode` itself onto an output buffer. `parse` drives
//! the inbound direction: it consumes complete frames from a receive
//! buffer and leaves partial frames untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The 9-byte fixed frame header length.
pub const HEADER_LEN: usize = 9;

/// The 24-octet client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default value of SETTINGS_MAX_FRAME_SIZE.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Upper bound of SETTINGS_MAX_FRAME_SIZE.
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Default value of SETTINGS_INITIAL_WINDOW_SIZE.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Largest legal flow-control window.
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

const END_STREAM: u8 = 0x1;
const ACK: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;

/// A 31-bit stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

impl StreamId {
    /// Stream id zero, the connection itself.
    pub const ZERO: StreamId = StreamId(0);

    pub(crate) fn new(id: u32) -> StreamId {
        StreamId(id & 0x7fff_ffff)
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Client-initiated streams are odd.
    pub(crate) fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Server-initiated (push) streams are even.
    pub(crate) fn is_server_initiated(&self) -> bool {
        self.0 != 0 && self.0 % 2 == 0
    }

    pub(crate) fn value(&self) -> u32 {
        self.0
    }

    pub(crate) fn next(&self) -> StreamId {
        StreamId(self.0 + 2)
    }

    fn parse(buf: &[u8]) -> StreamId {
        debug_assert!(buf.len() >= 4);
        StreamId(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & 0x7fff_ffff)
    }
}

impl From<u32> for StreamId {
    fn from(src: u32) -> StreamId {
        StreamId::new(src)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// HTTP/2 error codes, used in RST_STREAM and GOAWAY frames.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reason(u32);

impl Reason {
    pub const NO_ERROR: Reason = Reason(0);
    pub const PROTOCOL_ERROR: Reason = Reason(1);
    pub const INTERNAL_ERROR: Reason = Reason(2);
    pub const FLOW_CONTROL_ERROR: Reason = Reason(3);
    pub const SETTINGS_TIMEOUT: Reason = Reason(4);
    pub const STREAM_CLOSED: Reason = Reason(5);
    pub const FRAME_SIZE_ERROR: Reason = Reason(6);
    pub const REFUSED_STREAM: Reason = Reason(7);
    pub const CANCEL: Reason = Reason(8);
    pub const COMPRESSION_ERROR: Reason = Reason(9);
    pub const CONNECT_ERROR: Reason = Reason(10);
    pub const ENHANCE_YOUR_CALM: Reason = Reason(11);
    pub const INADEQUATE_SECURITY: Reason = Reason(12);
    pub const HTTP_1_1_REQUIRED: Reason = Reason(13);

    /// A human description of the error code.
    pub fn description(&self) -> &str {
        match self.0 {
            0 => "not a result of an error",
            1 => "unspecific protocol error detected",
            2 => "unexpected internal error encountered",
            3 => "flow-control protocol violated",
            4 => "settings ACK not received in timely manner",
            5 => "received frame when stream half-closed",
            6 => "frame with invalid size",
            7 => "refused stream before processing any application logic",
            8 => "stream no longer needed",
            9 => "unable to maintain the header compression context",
            10 => "connection established in response to a CONNECT request was reset or abnormally closed",
            11 => "detected excessive load generating behavior",
            12 => "security properties do not meet minimum requirements",
            13 => "endpoint requires HTTP/1.1",
            _ => "unknown reason",
        }
    }
}

impl From<u32> for Reason {
    fn from(src: u32) -> Reason {
        Reason(src)
    }
}

impl From<Reason> for u32 {
    fn from(src: Reason) -> u32 {
        src.0
    }
}

impl std::fmt::Debug for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            0 => "NO_ERROR",
            1 => "PROTOCOL_ERROR",
            2 => "INTERNAL_ERROR",
            3 => "FLOW_CONTROL_ERROR",
            4 => "SETTINGS_TIMEOUT",
            5 => "STREAM_CLOSED",
            6 => "FRAME_SIZE_ERROR",
            7 => "REFUSED_STREAM",
            8 => "CANCEL",
            9 => "COMPRESSION_ERROR",
            10 => "CONNECT_ERROR",
            11 => "ENHANCE_YOUR_CALM",
            12 => "INADEQUATE_SECURITY",
            13 => "HTTP_1_1_REQUIRED",
            other => return write!(f, "Reason({other})"),
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Frame type octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Data = 0,
    Headers = 1,
    Priority = 2,
    Reset = 3,
    Settings = 4,
    PushPromise = 5,
    Ping = 6,
    GoAway = 7,
    WindowUpdate = 8,
    Continuation = 9,
}

impl Kind {
    fn from_u8(byte: u8) -> Option<Kind> {
        match byte {
            0 => Some(Kind::Data),
            1 => Some(Kind::Headers),
            2 => Some(Kind::Priority),
            3 => Some(Kind::Reset),
            4 => Some(Kind::Settings),
            5 => Some(Kind::PushPromise),
            6 => Some(Kind::Ping),
            7 => Some(Kind::GoAway),
            8 => Some(Kind::WindowUpdate),
            9 => Some(Kind::Continuation),
            _ => None,
        }
    }
}

/// Errors produced while loading a frame from the wire.
///
/// Connection-level mapping to an HTTP/2 error code happens in the
/// session; the variants keep enough detail to pick the right one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload longer than the locally applied MAX_FRAME_SIZE.
    Oversized,
    /// A length value other than 8 was set on a PING frame.
    BadFrameSize,
    /// The padding length was larger than the payload.
    TooMuchPadding,
    /// The payload was shorter than the frame type requires.
    PayloadLengthTooShort,
    /// SETTINGS payload length not a multiple of 6.
    PartialSettingLength,
    /// Received a SETTINGS ACK with a non-empty payload.
    InvalidPayloadAckSettings,
    /// A connection-scoped frame carried a non-zero stream id, or vice versa.
    InvalidStreamId,
    /// A setting carried a value outside its legal range.
    InvalidSettingValue(Reason),
    /// WINDOW_UPDATE with a zero increment.
    ZeroWindowIncrement,
}

impl FrameError {
    /// The error code a GOAWAY for this violation should carry.
    pub fn reason(&self) -> Reason {
        match self {
            FrameError::Oversized
            | FrameError::BadFrameSize
            | FrameError::PayloadLengthTooShort
            | FrameError::PartialSettingLength
            | FrameError::InvalidPayloadAckSettings => Reason::FRAME_SIZE_ERROR,
            FrameError::InvalidSettingValue(reason) => *reason,
            _ => Reason::PROTOCOL_ERROR,
        }
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized => f.write_str("frame exceeds MAX_FRAME_SIZE"),
            FrameError::BadFrameSize => f.write_str("frame with invalid size"),
            FrameError::TooMuchPadding => f.write_str("padding longer than payload"),
            FrameError::PayloadLengthTooShort => f.write_str("payload too short for frame type"),
            FrameError::PartialSettingLength => f.write_str("partial SETTINGS entry"),
            FrameError::InvalidPayloadAckSettings => f.write_str("SETTINGS ACK with payload"),
            FrameError::InvalidStreamId => f.write_str("invalid stream id for frame type"),
            FrameError::InvalidSettingValue(_) => f.write_str("setting value out of range"),
            FrameError::ZeroWindowIncrement => f.write_str("WINDOW_UPDATE with zero increment"),
        }
    }
}

impl std::error::Error for FrameError {}

/// The 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct Head {
    kind_byte: u8,
    flag: u8,
    stream_id: StreamId,
}

impl Head {
    pub(crate) fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Head {
        Head {
            kind_byte: kind as u8,
            flag,
            stream_id,
        }
    }

    pub(crate) fn kind(&self) -> Option<Kind> {
        Kind::from_u8(self.kind_byte)
    }

    pub(crate) fn flag(&self) -> u8 {
        self.flag
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn parse(buf: &[u8]) -> (usize, Head) {
        debug_assert!(buf.len() >= HEADER_LEN);
        let len = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
        let head = Head {
            kind_byte: buf[3],
            flag: buf[4],
            stream_id: StreamId::parse(&buf[5..9]),
        };
        (len, head)
    }

    pub(crate) fn encode<B: BufMut>(&self, payload_len: usize, dst: &mut B) {
        debug_assert!(payload_len < 1 << 24);
        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind_byte);
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.value());
    }
}

/// DATA frame. Padding is stripped on load and never emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub stream_id: StreamId,
    pub payload: Bytes,
    pub end_stream: bool,
}

impl Data {
    /// The flow-controlled size of the frame as received, including any
    /// padding that was stripped.
    pub(crate) fn load(head: Head, mut payload: Bytes, flow_len: &mut usize) -> Result<Data, FrameError> {
        if head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        *flow_len = payload.len();
        if head.flag() & PADDED != 0 {
            strip_padding(&mut payload)?;
        }
        Ok(Data {
            stream_id: head.stream_id(),
            payload,
            end_stream: head.flag() & END_STREAM != 0,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let flags = if self.end_stream { END_STREAM } else { 0 };
        Head::new(Kind::Data, flags, self.stream_id).encode(self.payload.len(), dst);
        dst.put_slice(&self.payload);
    }
}

/// Stream dependency carried by PRIORITY frames and the HEADERS priority
/// flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub stream_id: StreamId,
    pub dependency: StreamId,
    pub exclusive: bool,
    /// Wire weight; effective weight is this plus one (1..=256).
    pub weight: u8,
}

impl Priority {
    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Priority, FrameError> {
        if head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        if payload.len() != 5 {
            return Err(FrameError::BadFrameSize);
        }
        let (dependency, exclusive, weight) = parse_dependency(payload);
        Ok(Priority {
            stream_id: head.stream_id(),
            dependency,
            exclusive,
            weight,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        Head::new(Kind::Priority, 0, self.stream_id).encode(5, dst);
        let mut dep = self.dependency.value();
        if self.exclusive {
            dep |= 1 << 31;
        }
        dst.put_u32(dep);
        dst.put_u8(self.weight);
    }
}

fn parse_dependency(buf: &[u8]) -> (StreamId, bool, u8) {
    let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    (StreamId::new(raw), raw & (1 << 31) != 0, buf[4])
}

/// HEADERS frame carrying an opaque header-block fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub stream_id: StreamId,
    pub fragment: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<Priority>,
}

impl Headers {
    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<Headers, FrameError> {
        if head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        if head.flag() & PADDED != 0 {
            strip_padding(&mut payload)?;
        }
        let priority = if head.flag() & PRIORITY != 0 {
            if payload.len() < 5 {
                return Err(FrameError::PayloadLengthTooShort);
            }
            let (dependency, exclusive, weight) = parse_dependency(&payload);
            payload.advance(5);
            Some(Priority {
                stream_id: head.stream_id(),
                dependency,
                exclusive,
                weight,
            })
        } else {
            None
        };
        Ok(Headers {
            stream_id: head.stream_id(),
            fragment: payload,
            end_stream: head.flag() & END_STREAM != 0,
            end_headers: head.flag() & END_HEADERS != 0,
            priority,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let mut flags = 0;
        if self.end_stream {
            flags |= END_STREAM;
        }
        if self.end_headers {
            flags |= END_HEADERS;
        }
        debug_assert!(self.priority.is_none(), "priority is sent as its own frame");
        Head::new(Kind::Headers, flags, self.stream_id).encode(self.fragment.len(), dst);
        dst.put_slice(&self.fragment);
    }
}

/// CONTINUATION frame extending a header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub stream_id: StreamId,
    pub fragment: Bytes,
    pub end_headers: bool,
}

impl Continuation {
    pub(crate) fn load(head: Head, payload: Bytes) -> Result<Continuation, FrameError> {
        if head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        Ok(Continuation {
            stream_id: head.stream_id(),
            fragment: payload,
            end_headers: head.flag() & END_HEADERS != 0,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let flags = if self.end_headers { END_HEADERS } else { 0 };
        Head::new(Kind::Continuation, flags, self.stream_id).encode(self.fragment.len(), dst);
        dst.put_slice(&self.fragment);
    }
}

/// PUSH_PROMISE frame reserving a server-initiated stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromise {
    pub stream_id: StreamId,
    pub promised_id: StreamId,
    pub fragment: Bytes,
    pub end_headers: bool,
}

impl PushPromise {
    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<PushPromise, FrameError> {
        if head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        if head.flag() & PADDED != 0 {
            strip_padding(&mut payload)?;
        }
        if payload.len() < 4 {
            return Err(FrameError::PayloadLengthTooShort);
        }
        let promised_id = StreamId::parse(&payload);
        payload.advance(4);
        if promised_id.is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        Ok(PushPromise {
            stream_id: head.stream_id(),
            promised_id,
            fragment: payload,
            end_headers: head.flag() & END_HEADERS != 0,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let flags = if self.end_headers { END_HEADERS } else { 0 };
        Head::new(Kind::PushPromise, flags, self.stream_id).encode(4 + self.fragment.len(), dst);
        dst.put_u32(self.promised_id.value());
        dst.put_slice(&self.fragment);
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reset {
    pub stream_id: StreamId,
    pub reason: Reason,
}

impl Reset {
    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Reset, FrameError> {
        if head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        if payload.len() != 4 {
            return Err(FrameError::BadFrameSize);
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(Reset {
            stream_id: head.stream_id(),
            reason: code.into(),
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        Head::new(Kind::Reset, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.reason.into());
    }
}

/// PING frame with its 8 octets of opaque data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub ack: bool,
    pub payload: [u8; 8],
}

impl Ping {
    pub(crate) fn new(payload: [u8; 8]) -> Ping {
        Ping { ack: false, payload }
    }

    pub(crate) fn pong(payload: [u8; 8]) -> Ping {
        Ping { ack: true, payload }
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Ping, FrameError> {
        if !head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        if payload.len() != 8 {
            return Err(FrameError::BadFrameSize);
        }
        let mut data = [0; 8];
        data.copy_from_slice(payload);
        Ok(Ping {
            ack: head.flag() & ACK != 0,
            payload: data,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let flags = if self.ack { ACK } else { 0 };
        Head::new(Kind::Ping, flags, StreamId::ZERO).encode(8, dst);
        dst.put_slice(&self.payload);
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub reason: Reason,
    pub debug_data: Bytes,
}

impl GoAway {
    pub(crate) fn new(last_stream_id: StreamId, reason: Reason) -> GoAway {
        GoAway {
            last_stream_id,
            reason,
            debug_data: Bytes::new(),
        }
    }

    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<GoAway, FrameError> {
        if !head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        if payload.len() < 8 {
            return Err(FrameError::BadFrameSize);
        }
        let last_stream_id = StreamId::parse(&payload);
        let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        payload.advance(8);
        Ok(GoAway {
            last_stream_id,
            reason: code.into(),
            debug_data: payload,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        Head::new(Kind::GoAway, 0, StreamId::ZERO).encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id.value());
        dst.put_u32(self.reason.into());
        dst.put_slice(&self.debug_data);
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub stream_id: StreamId,
    pub increment: u32,
}

impl WindowUpdate {
    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<WindowUpdate, FrameError> {
        if payload.len() != 4 {
            return Err(FrameError::BadFrameSize);
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
        if increment == 0 {
            return Err(FrameError::ZeroWindowIncrement);
        }
        Ok(WindowUpdate {
            stream_id: head.stream_id(),
            increment,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        Head::new(Kind::WindowUpdate, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.increment);
    }
}

/// The SETTINGS parameter set.
///
/// Both endpoints hold two copies, the locally applied values and the
/// peer-applied values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub ack: bool,
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            ack: false,
            header_table_size: None,
            enable_push: None,
            max_concurrent_streams: None,
            initial_window_size: None,
            max_frame_size: None,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    pub(crate) fn ack() -> Settings {
        Settings {
            ack: true,
            ..Settings::default()
        }
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Settings, FrameError> {
        if !head.stream_id().is_zero() {
            return Err(FrameError::InvalidStreamId);
        }
        if head.flag() & ACK != 0 {
            if !payload.is_empty() {
                return Err(FrameError::InvalidPayloadAckSettings);
            }
            return Ok(Settings::ack());
        }
        let mut settings = Settings::parse_payload(payload)?;
        settings.ack = false;
        Ok(settings)
    }

    /// Parse a bare SETTINGS payload, 6-byte entries, unknown ids ignored.
    ///
    /// Also used for the `HTTP2-Settings` header of the h2c upgrade.
    pub fn parse_payload(payload: &[u8]) -> Result<Settings, FrameError> {
        if payload.len() % 6 != 0 {
            return Err(FrameError::PartialSettingLength);
        }
        let mut settings = Settings::default();
        for entry in payload.chunks(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                SETTINGS_HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                SETTINGS_ENABLE_PUSH => match value {
                    0 => settings.enable_push = Some(false),
                    1 => settings.enable_push = Some(true),
                    _ => {
                        return Err(FrameError::InvalidSettingValue(Reason::PROTOCOL_ERROR));
                    }
                },
                SETTINGS_MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(FrameError::InvalidSettingValue(Reason::FLOW_CONTROL_ERROR));
                    }
                    settings.initial_window_size = Some(value);
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(FrameError::InvalidSettingValue(Reason::PROTOCOL_ERROR));
                    }
                    settings.max_frame_size = Some(value);
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(settings)
    }

    /// Serialize the bare payload, without the frame header.
    pub fn pack_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6 * 6);
        let mut put = |id: u16, value: u32| {
            buf.put_u16(id);
            buf.put_u32(value);
        };
        if let Some(v) = self.header_table_size {
            put(SETTINGS_HEADER_TABLE_SIZE, v);
        }
        if let Some(v) = self.enable_push {
            put(SETTINGS_ENABLE_PUSH, v as u32);
        }
        if let Some(v) = self.max_concurrent_streams {
            put(SETTINGS_MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            put(SETTINGS_INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.max_frame_size {
            put(SETTINGS_MAX_FRAME_SIZE, v);
        }
        if let Some(v) = self.max_header_list_size {
            put(SETTINGS_MAX_HEADER_LIST_SIZE, v);
        }
        buf.freeze()
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let flags = if self.ack { ACK } else { 0 };
        let payload = if self.ack { Bytes::new() } else { self.pack_payload() };
        Head::new(Kind::Settings, flags, StreamId::ZERO).encode(payload.len(), dst);
        dst.put_slice(&payload);
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Data),
    Headers(Headers),
    Priority(Priority),
    Reset(Reset),
    Settings(Settings),
    PushPromise(PushPromise),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
    Continuation(Continuation),
    /// Unknown frame types are ignored per the protocol.
    Unknown,
}

impl Frame {
    /// Serialize this frame onto `dst`. The payload must fit the 24-bit
    /// length field; callers fragment DATA and header blocks beforehand.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        match self {
            Frame::Data(f) => f.encode(dst),
            Frame::Headers(f) => f.encode(dst),
            Frame::Priority(f) => f.encode(dst),
            Frame::Reset(f) => f.encode(dst),
            Frame::Settings(f) => f.encode(dst),
            Frame::PushPromise(f) => f.encode(dst),
            Frame::Ping(f) => f.encode(dst),
            Frame::GoAway(f) => f.encode(dst),
            Frame::WindowUpdate(f) => f.encode(dst),
            Frame::Continuation(f) => f.encode(dst),
            Frame::Unknown => unreachable!("unknown frames are never sent"),
        }
    }

    /// Consume one complete frame from `buf`, or return `Ok(None)` when
    /// more transport bytes are needed.
    ///
    /// `flow_len` reports the flow-controlled size of a DATA frame (its
    /// payload length before padding removal); zero for all other kinds.
    pub fn parse(
        buf: &mut BytesMut,
        max_frame_size: u32,
        flow_len: &mut usize,
    ) -> Result<Option<Frame>, FrameError> {
        *flow_len = 0;
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let (len, head) = Head::parse(buf);
        if len as u32 > max_frame_size {
            return Err(FrameError::Oversized);
        }
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();

        let frame = match head.kind() {
            Some(Kind::Data) => Frame::Data(Data::load(head, payload, flow_len)?),
            Some(Kind::Headers) => Frame::Headers(Headers::load(head, payload)?),
            Some(Kind::Priority) => Frame::Priority(Priority::load(head, &payload)?),
            Some(Kind::Reset) => Frame::Reset(Reset::load(head, &payload)?),
            Some(Kind::Settings) => Frame::Settings(Settings::load(head, &payload)?),
            Some(Kind::PushPromise) => Frame::PushPromise(PushPromise::load(head, payload)?),
            Some(Kind::Ping) => Frame::Ping(Ping::load(head, &payload)?),
            Some(Kind::GoAway) => Frame::GoAway(GoAway::load(head, payload)?),
            Some(Kind::WindowUpdate) => Frame::WindowUpdate(WindowUpdate::load(head, &payload)?),
            Some(Kind::Continuation) => Frame::Continuation(Continuation::load(head, payload)?),
            None => Frame::Unknown,
        };
        Ok(Some(frame))
    }
}

fn strip_padding(payload: &mut Bytes) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::PayloadLengthTooShort);
    }
    let pad_len = payload[0] as usize;
    payload.advance(1);
    if pad_len > payload.len() {
        return Err(FrameError::TooMuchPadding);
    }
    payload.truncate(payload.len() - pad_len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(bytes: &[u8]) -> Result<Option<Frame>, FrameError> {
        let mut buf = BytesMut::from(bytes);
        let mut flow = 0;
        Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE, &mut flow)
    }

    #[test]
    fn data_roundtrip() {
        let frame = Data {
            stream_id: 1.into(),
            payload: Bytes::from_static(b"hello"),
            end_stream: true,
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(&buf[..HEADER_LEN], &[0, 0, 5, 0, 0x1, 0, 0, 0, 1]);
        match parse_one(&buf).unwrap().unwrap() {
            Frame::Data(parsed) => assert_eq!(parsed, frame),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn needs_more_bytes() {
        let frame = Data {
            stream_id: 3.into(),
            payload: Bytes::from_static(b"body bytes"),
            end_stream: false,
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let partial = &buf[..buf.len() - 1];
        assert_eq!(parse_one(partial).unwrap(), None);
        assert_eq!(parse_one(&buf[..4]).unwrap(), None);
    }

    #[test]
    fn padded_data_is_stripped_but_flow_counts_padding() {
        // length 10: pad-len octet + 5 payload + 4 padding
        let mut buf = BytesMut::new();
        Head::new(Kind::Data, PADDED | END_STREAM, 5.into()).encode(10, &mut buf);
        buf.put_u8(4);
        buf.put_slice(b"hello");
        buf.put_slice(&[0; 4]);
        let mut parse_buf = BytesMut::from(&buf[..]);
        let mut flow = 0;
        match Frame::parse(&mut parse_buf, DEFAULT_MAX_FRAME_SIZE, &mut flow) {
            Ok(Some(Frame::Data(data))) => {
                assert_eq!(data.payload, Bytes::from_static(b"hello"));
                assert!(data.end_stream);
                assert_eq!(flow, 10);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn padding_longer_than_payload() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Data, PADDED, 5.into()).encode(3, &mut buf);
        buf.put_u8(200);
        buf.put_slice(b"hi");
        assert_eq!(parse_one(&buf), Err(FrameError::TooMuchPadding));
    }

    #[test]
    fn settings_roundtrip_and_unknown_ids_ignored() {
        let settings = Settings {
            max_concurrent_streams: Some(100),
            initial_window_size: Some(1024),
            ..Settings::default()
        };
        let mut payload = BytesMut::from(&settings.pack_payload()[..]);
        // an unknown id the parser must skip
        payload.put_u16(0x99);
        payload.put_u32(7);
        let parsed = Settings::parse_payload(&payload).unwrap();
        assert_eq!(parsed.max_concurrent_streams, Some(100));
        assert_eq!(parsed.initial_window_size, Some(1024));
        assert_eq!(parsed.max_frame_size, None);
    }

    #[test]
    fn settings_ack_with_payload_is_invalid() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Settings, ACK, StreamId::ZERO).encode(6, &mut buf);
        buf.put_slice(&[0, 3, 0, 0, 0, 1]);
        assert_eq!(parse_one(&buf), Err(FrameError::InvalidPayloadAckSettings));
    }

    #[test]
    fn settings_rejects_out_of_range_values() {
        let mut payload = BytesMut::new();
        payload.put_u16(SETTINGS_INITIAL_WINDOW_SIZE);
        payload.put_u32(1 << 31);
        assert_eq!(
            Settings::parse_payload(&payload),
            Err(FrameError::InvalidSettingValue(Reason::FLOW_CONTROL_ERROR))
        );

        let mut payload = BytesMut::new();
        payload.put_u16(SETTINGS_MAX_FRAME_SIZE);
        payload.put_u32(1);
        assert_eq!(
            Settings::parse_payload(&payload),
            Err(FrameError::InvalidSettingValue(Reason::PROTOCOL_ERROR))
        );
    }

    #[test]
    fn ping_requires_eight_octets() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Ping, 0, StreamId::ZERO).encode(4, &mut buf);
        buf.put_slice(&[1, 2, 3, 4]);
        assert_eq!(parse_one(&buf), Err(FrameError::BadFrameSize));
    }

    #[test]
    fn ping_on_nonzero_stream_is_invalid() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Ping, 0, 3.into()).encode(8, &mut buf);
        buf.put_slice(&[0; 8]);
        assert_eq!(parse_one(&buf), Err(FrameError::InvalidStreamId));
    }

    #[test]
    fn window_update_of_zero_is_invalid() {
        let mut buf = BytesMut::new();
        Head::new(Kind::WindowUpdate, 0, 1.into()).encode(4, &mut buf);
        buf.put_u32(0);
        assert_eq!(parse_one(&buf), Err(FrameError::ZeroWindowIncrement));
    }

    #[test]
    fn goaway_carries_debug_data() {
        let frame = GoAway {
            last_stream_id: 7.into(),
            reason: Reason::ENHANCE_YOUR_CALM,
            debug_data: Bytes::from_static(b"slow down"),
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        match parse_one(&buf).unwrap().unwrap() {
            Frame::GoAway(parsed) => {
                assert_eq!(parsed.last_stream_id, StreamId::new(7));
                assert_eq!(parsed.reason, Reason::ENHANCE_YOUR_CALM);
                assert_eq!(parsed.debug_data, Bytes::from_static(b"slow down"));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Data, 0, 1.into()).encode(DEFAULT_MAX_FRAME_SIZE as usize + 1, &mut buf);
        assert_eq!(parse_one(&buf), Err(FrameError::Oversized));
    }

    #[test]
    fn unknown_frame_kind_is_skipped() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Data, 0, 1.into()).encode(2, &mut buf);
        buf[3] = 0x42;
        buf.put_slice(b"??");
        assert_eq!(parse_one(&buf).unwrap(), Some(Frame::Unknown));
    }

    #[test]
    fn headers_priority_flag_is_parsed() {
        let mut buf = BytesMut::new();
        Head::new(Kind::Headers, PRIORITY | END_HEADERS, 5.into()).encode(8, &mut buf);
        buf.put_u32((1 << 31) | 3); // exclusive dependency on stream 3
        buf.put_u8(15);
        buf.put_slice(b"abc");
        match parse_one(&buf).unwrap().unwrap() {
            Frame::Headers(headers) => {
                let priority = headers.priority.unwrap();
                assert!(priority.exclusive);
                assert_eq!(priority.dependency, StreamId::new(3));
                assert_eq!(priority.weight, 15);
                assert_eq!(headers.fragment, Bytes::from_static(b"abc"));
                assert!(headers.end_headers);
            }
            other => panic!("{other:?}"),
        }
    }
}
