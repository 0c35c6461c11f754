//! HTTP client capability.
//!
//! The fetcher only needs "send a GET, hand me the response". The response
//! body stays a stream so a connection that dies mid-body is reported
//! separately from one that never connected.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streaming response body.
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Boxed future alias for HTTP client results.
pub type ResponseFuture<'a> =
    Pin<Box<dyn Future<Output = Result<http::Response<ResponseBody>, BoxError>> + Send + 'a>>;

/// Asynchronous HTTP client, injected so tests can script responses.
pub trait HttpClient: Send + Sync {
    /// Dispatch a body-less request. Errors are transport failures only;
    /// any status code is a successful response.
    fn send(&self, request: http::Request<()>) -> ResponseFuture<'_>;
}

/// Wrap bytes as a complete response body.
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-HTTP client on hyper's pooled legacy client.
#[derive(Clone)]
pub struct HyperHttpClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl HyperHttpClient {
    /// `timeout` bounds the wait for response headers.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout,
        }
    }
}

impl HttpClient for HyperHttpClient {
    fn send(&self, request: http::Request<()>) -> ResponseFuture<'_> {
        let request = request.map(|()| Empty::<Bytes>::new());
        Box::pin(async move {
            let uri = request.uri().clone();
            let response = match tokio::time::timeout(self.timeout, self.client.request(request))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    debug!(%uri, "http request timed out");
                    return Err(format!("request to {uri} timed out after {:?}", self.timeout).into());
                }
            };
            debug!(%uri, status = %response.status(), "http response received");
            Ok(response.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed()))
        })
    }
}
