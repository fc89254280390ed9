#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # weft
//!
//! A dual-version HTTP/1.x and HTTP/2 client and server library.
//!
//! - Keep-alive connection [pooling](#making-requests) with same-origin
//!   redirect handling and cookie stores
//! - An HTTP/2 session engine multiplexing many streams over one
//!   transport, with flow control and graceful shutdown
//! - Opportunistic HTTP/2: ALPN on TLS, the `h2c` cleartext upgrade, and
//!   prior-knowledge cleartext sessions
//! - A server with SNI virtual hosts, per-request handler tasks and
//!   engine-generated error pages
//! - Composable [body adapters](body): limited, chunked, counting,
//!   timeout and end-callback streams
//!
//! ## Making requests
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), weft::Error> {
//! let client = weft::Client::new();
//! let body = client
//!     .get("http://httpbin.org/ip")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, it is best to
//! create a [`Client`] and reuse it, taking advantage of keep-alive
//! connection pooling.
//!
//! ## Serving requests
//!
//! ```rust,no_run
//! use weft::server::{Request, ResponseWriter, Server};
//!
//! # async fn run() -> Result<(), weft::Error> {
//! let server = Server::builder()
//!     .port(8080)
//!     .handler(|_req: Request, mut res: ResponseWriter| async move {
//!         res.write(b"hello\n").await?;
//!         res.finalize().await
//!     })
//!     .start()
//!     .await?;
//!
//! # server.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Handlers run once per request; on HTTP/2 every stream gets its own
//! task. A handler that returns an error is turned into an error page by
//! the configured error-page handler.

mod error;

pub mod body;
pub mod client;
pub mod cookie;
pub mod header;
pub mod proto;
pub mod server;
#[cfg(feature = "tls")]
#[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
pub mod tls;

pub use self::body::{Body, BodySender};
pub use self::client::{Client, ClientBuilder, H2ClientConfig, Request, RequestBuilder, Response};
pub use self::error::{BoxError, Error, Result};
pub use self::header::{HeaderMap, HeaderName, HeaderValue};
pub use self::proto::h2::{MemorySafety, Reason, Settings};
pub use self::server::{Server, ServerBuilder};
pub use http::{Method, StatusCode, Uri, Version};
pub use url::Url;

use once_cell::sync::Lazy;

// process-wide default client behind the shortcut functions; tests and
// long-lived applications build their own
static DEFAULT_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// Shortcut: perform a GET with the process-wide default client.
///
/// See [`Client::get`].
pub async fn get(url: &str) -> Result<Response> {
    DEFAULT_CLIENT.get(url).send().await
}
