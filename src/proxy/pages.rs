//! Fixed pages served by the proxy itself

use hyper::header::{HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};

use crate::error::Result;
use crate::proxy::body::{self, ProxyBody};
use crate::proxy::middleware::AuthVerdict;

pub const INFO_TEXT: &str = "This is ShadowProxy.";

const PROXY_REALM: &str = "Basic realm=\"Secure Web Proxy\"";

const AUTH_FAIL_TEXT: &str = "Please authenticate yourself to the proxy.";
const AUTH_OK_TEXT: &str =
    "Congratulations, you are successfully authenticated to the proxy! Go browse all the things!";

/// Answer to `GET /info`
pub fn info_response() -> Result<Response<ProxyBody>> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(body::full(INFO_TEXT))?)
}

/// Status page shown on the probe-resist domain
///
/// Rejected clients get a `407` challenge so browsers prompt for
/// credentials; authenticated clients get a plain confirmation.
pub fn hidden_page(verdict: &AuthVerdict) -> Result<Response<ProxyBody>> {
    let builder = Response::builder().header(CONTENT_TYPE, HeaderValue::from_static("text/html"));

    let response = if verdict.is_authenticated() {
        builder
            .status(StatusCode::OK)
            .body(body::full(render_hidden_page(AUTH_OK_TEXT)))?
    } else {
        builder
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(PROXY_AUTHENTICATE, HeaderValue::from_static(PROXY_REALM))
            .body(body::full(render_hidden_page(AUTH_FAIL_TEXT)))?
    };

    Ok(response)
}

fn render_hidden_page(message: &str) -> String {
    format!(
        "<html>\n\
         <head>\n  <title>ShadowProxy</title>\n</head>\n\
         <body>\n\
         <h1>ShadowProxy Hidden Proxy Page!</h1>\n\
         {}<br/>\n\
         </body>\n\
         </html>",
        message
    )
}
