use std::{error::Error as StdError, fmt, io};

use http::{StatusCode, Uri};

use crate::proto::h2::Reason;

/// A `Result` alias where the `Err` case is `weft::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur when processing a request, serving a
/// connection, or driving an HTTP/2 session.
///
/// Note: Errors may include the full URI used to make the request. If the
/// URI contains sensitive information (e.g. an API key as a query
/// parameter), be sure to remove it ([`without_uri`](Error::without_uri)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    uri: Option<Uri>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                uri: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Request, Some(e))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn redirect<E: Into<BoxError>>(e: E, uri: Uri) -> Error {
        Error::new(Kind::Redirect, Some(e)).with_uri(uri)
    }

    pub(crate) fn upgrade<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Upgrade, Some(e))
    }

    #[cfg(feature = "tls")]
    pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Tls, Some(e))
    }

    pub(crate) fn timeout(op: &'static str) -> Error {
        Error::new(Kind::Timeout(op), None::<Error>)
    }

    pub(crate) fn closed(reason: &'static str) -> Error {
        Error::new(Kind::Closed(reason), None::<Error>)
    }

    pub(crate) fn protocol(reason: Reason, msg: &'static str) -> Error {
        Error::new(Kind::Protocol(reason, msg), None::<Error>)
    }

    pub(crate) fn stream(reason: Reason) -> Error {
        Error::new(Kind::Stream(reason), None::<Error>)
    }

    pub(crate) fn validation(msg: &'static str) -> Error {
        Error::new(Kind::Validation(msg), None::<Error>)
    }

    /// An HTTP status carried as an error, raised by handlers or the
    /// engine's own limit checks.
    pub fn status_code(status: StatusCode, msg: &'static str) -> Error {
        Error::new(Kind::Status(status, msg), None::<Error>)
    }
}

impl Error {
    /// Returns a possible URI related to this error.
    pub fn uri(&self) -> Option<&Uri> {
        self.inner.uri.as_ref()
    }

    /// Add a URI related to this error (overwriting any existing).
    pub fn with_uri(mut self, uri: Uri) -> Self {
        self.inner.uri = Some(uri);
        self
    }

    /// Strip the related URI from this error (if, for example, it
    /// contains sensitive information).
    pub fn without_uri(mut self) -> Self {
        self.inner.uri = None;
        self
    }

    /// Returns true if the error is from a builder.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error came from the redirect policy.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect)
    }

    /// Returns true if the error carries an HTTP status.
    pub fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status(_, _))
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout(_)) {
            return true;
        }
        let mut source = self.source();
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            if let Some(nested) = err.downcast_ref::<Error>() {
                if nested.is_timeout() {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }

    /// Returns true if the transport closed underneath the operation.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed(_))
    }

    /// Returns true if the peer or this endpoint violated the HTTP/2
    /// protocol and the session was torn down.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol(_, _))
    }

    /// Returns true if a single stream failed while the session survived.
    pub fn is_stream(&self) -> bool {
        matches!(self.inner.kind, Kind::Stream(_))
    }

    /// Returns true if the error is related to the request.
    pub fn is_request(&self) -> bool {
        matches!(self.inner.kind, Kind::Request)
    }

    /// Returns true if the error is related to the request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if the error is related to decoding a message.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true for malformed input the peer sent.
    pub fn is_validation(&self) -> bool {
        matches!(self.inner.kind, Kind::Validation(_))
    }

    /// Returns true if the error is related to upgrading the connection.
    pub fn is_upgrade(&self) -> bool {
        matches!(self.inner.kind, Kind::Upgrade)
    }

    /// Returns true if the error is related to TLS.
    #[cfg(feature = "tls")]
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if the error is related to a connection reset.
    pub fn is_connection_reset(&self) -> bool {
        let mut source = self.source();
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::ConnectionReset {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }

    /// Returns the status code, if the error carries one.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Status(code, _) => Some(code),
            _ => None,
        }
    }

    /// Returns the HTTP/2 error code, for protocol and stream errors.
    pub fn reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::Protocol(reason, _) | Kind::Stream(reason) => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn status_message(&self) -> &'static str {
        match self.inner.kind {
            Kind::Status(_, msg) => msg,
            _ => "",
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

/// Pull a `weft::Error` back out of an `io::Error` that wrapped one.
pub(crate) fn from_io(e: io::Error) -> Error {
    if e.get_ref().map(|r| r.is::<Error>()).unwrap_or(false) {
        *e.into_inner()
            .expect("io::Error::get_ref was Some(_)")
            .downcast::<Error>()
            .expect("StdError::is() was true")
    } else if e.kind() == io::ErrorKind::TimedOut {
        Error::new(Kind::Timeout("io"), Some(e))
    } else if matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
    ) {
        Error::new(Kind::Closed("transport"), Some(e))
    } else {
        Error::body(e)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("weft::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref uri) = self.inner.uri {
            builder.field("uri", uri);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Decode => f.write_str("error decoding message")?,
            Kind::Redirect => f.write_str("error following redirect")?,
            Kind::Upgrade => f.write_str("error upgrading connection")?,
            #[cfg(feature = "tls")]
            Kind::Tls => f.write_str("tls error")?,
            Kind::Timeout(op) => write!(f, "operation timed out ({op})")?,
            Kind::Closed(what) => write!(f, "connection closed ({what})")?,
            Kind::Protocol(reason, msg) => write!(f, "http2 protocol error ({reason:?}): {msg}")?,
            Kind::Stream(reason) => write!(f, "stream error ({reason:?})")?,
            Kind::Validation(msg) => write!(f, "malformed message: {msg}")?,
            Kind::Status(ref code, msg) => {
                let prefix = if code.is_client_error() {
                    "HTTP status client error"
                } else if code.is_server_error() {
                    "HTTP status server error"
                } else {
                    "HTTP status error"
                };
                if msg.is_empty() {
                    write!(f, "{prefix} ({code})")?;
                } else {
                    write!(f, "{prefix} ({code}): {msg}")?;
                }
            }
        };

        if let Some(uri) = &self.inner.uri {
            write!(f, " for uri ({uri})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Request,
    Redirect,
    Status(StatusCode, &'static str),
    Body,
    Decode,
    Upgrade,
    #[cfg(feature = "tls")]
    Tls,
    /// The operation that was blocked when the deadline fired.
    Timeout(&'static str),
    /// What observed the close.
    Closed(&'static str),
    /// Session-fatal HTTP/2 violation, sent or received via GOAWAY.
    Protocol(Reason, &'static str),
    /// Stream-local failure, sent or received via RST_STREAM.
    Stream(Reason),
    Validation(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Request, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::body(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn roundtrip_io_error() {
        let orig = Error::stream(Reason::CANCEL);
        let io = orig.into_io();
        let err = from_io(io);
        assert_eq!(err.reason(), Some(Reason::CANCEL));
    }

    #[test]
    fn io_eof_is_closed() {
        let err = from_io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(err.is_closed());
    }

    #[test]
    fn is_timeout_through_sources() {
        let err = Error::timeout("request");
        assert!(err.is_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::request(io);
        assert!(nested.is_timeout());
    }

    #[test]
    fn is_connection_reset() {
        let err = Error::request(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert!(err.is_connection_reset());
    }

    #[test]
    fn status_predicates() {
        let err = Error::status_code(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        assert!(err.is_status());
        assert_eq!(err.status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
    }
}
