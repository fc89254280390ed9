//! The HTTP/2 engine: framing, flow control, streams and the session
//! multiplexer.

pub(crate) mod flow;
pub mod frame;
pub(crate) mod hpack;
pub mod session;
pub mod stream;

pub use self::frame::{Reason, Settings, StreamId, PREFACE};
pub use self::hpack::Pseudo;
pub use self::session::{H2Config, PeerRequest, Role, Session};
pub use self::stream::{MemorySafety, StreamHandle};
