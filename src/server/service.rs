//! The request-handler seam and the engine's own error pages.

use std::{future::Future, pin::Pin, sync::Arc};

use http::StatusCode;

use super::request::Request;
use super::response::ResponseWriter;
use crate::Result;

/// A request handler.
///
/// Implemented for every `Fn(Request, ResponseWriter) -> Future` closure;
/// the engine invokes it once per request, on HTTP/2 once per stream in
/// its own task. A handler that returns without finalizing the response
/// gets an empty-bodied response finalized for it; a handler that
/// returns an error is routed through the error-page handler.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn call(
        &self,
        request: Request,
        response: ResponseWriter,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(
        &self,
        request: Request,
        response: ResponseWriter,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin((self)(request, response))
    }
}

/// Builds the body of an engine-generated error response.
///
/// Arguments: status code, human message, and the error's debug
/// rendering when stack traces are enabled.
pub type ErrorPageHandler =
    Arc<dyn Fn(StatusCode, &str, Option<&str>) -> String + Send + Sync>;

pub(crate) fn default_error_page(
    status: StatusCode,
    message: &str,
    detail: Option<&str>,
) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut page = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{code} {reason}</title></head>\n\
         <body>\n<h1>{code} {reason}</h1>\n",
        code = status.as_u16(),
    );
    if !message.is_empty() {
        page.push_str(&format!("<p>{message}</p>\n"));
    }
    if let Some(detail) = detail {
        page.push_str(&format!("<pre>{detail}</pre>\n"));
    }
    page.push_str("</body>\n</html>\n");
    page
}

/// Request-processing toggles, mirrored from the listener settings.
///
/// The body-parsing flags (`parse_form`, `parse_json`,
/// `parse_multipart`) are accepted for configuration compatibility but
/// body parsers are external collaborators; the flags are inert here.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub parse_url: bool,
    pub parse_query: bool,
    pub parse_form: bool,
    pub parse_json: bool,
    pub parse_multipart: bool,
    pub parse_cookies: bool,
    pub distribute: bool,
    pub error_stack_traces: bool,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            parse_url: true,
            parse_query: true,
            parse_form: false,
            parse_json: false,
            parse_multipart: false,
            parse_cookies: true,
            distribute: false,
            error_stack_traces: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_mentions_status_and_message() {
        let page = default_error_page(StatusCode::NOT_FOUND, "no such route", None);
        assert!(page.contains("404 Not Found"));
        assert!(page.contains("no such route"));
        assert!(!page.contains("<pre>"));

        let with_detail =
            default_error_page(StatusCode::INTERNAL_SERVER_ERROR, "", Some("trace here"));
        assert!(with_detail.contains("<pre>trace here</pre>"));
    }
}
