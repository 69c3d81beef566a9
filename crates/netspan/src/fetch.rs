//! Promise-style call surface.
//!
//! Uses native async fn in traits; [`FetchSurfaceBoxed`] is the object-safe
//! companion for dynamic dispatch.

use crate::instrumentation::{InFlight, Instrumentation};
use crate::request::{BodyError, HttpRequest, HttpResponse, NetworkError, RequestKind};
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// An HTTP client whose calls settle as a single future.
pub trait FetchSurface: Send + Sync {
    fn fetch(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, NetworkError>> + Send;
}

/// Object-safe version of [`FetchSurface`].
pub trait FetchSurfaceBoxed: Send + Sync {
    fn fetch_boxed(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, NetworkError>> + Send + '_>>;
}

impl<T: FetchSurface> FetchSurfaceBoxed for T {
    fn fetch_boxed(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, NetworkError>> + Send + '_>> {
        Box::pin(self.fetch(request))
    }
}

/// A [`FetchSurface`] that reports every call to an [`Instrumentation`].
///
/// The inner result is returned untouched. A call whose future is dropped
/// before it settles publishes a start event and nothing else.
pub struct InstrumentedFetch<F> {
    inner: F,
    instrumentation: Arc<Instrumentation>,
}

impl<F: FetchSurface> InstrumentedFetch<F> {
    pub fn new(inner: F, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            inner,
            instrumentation,
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: FetchSurface> FetchSurface for InstrumentedFetch<F> {
    async fn fetch(&self, mut request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        let in_flight = InFlight::begin(
            &self.instrumentation,
            RequestKind::Fetch,
            &request.method,
            &request.url,
            &mut request.headers,
        );

        let result = self.inner.fetch(request).await;

        let (status, body) = match &result {
            Ok(response) => {
                let body = match response.text() {
                    Ok(text) => self.instrumentation.truncate_body(text),
                    Err(e) => e.to_string(),
                };
                (response.status, body)
            }
            Err(e) => (0, self.instrumentation.format_failure(e)),
        };
        self.instrumentation
            .publish_complete(&in_flight.complete(status, Some(body)));

        result
    }
}

/// Production [`FetchSurface`] backed by a `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl FetchSurface for ReqwestFetch {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| NetworkError::Blocked(format!("invalid method: {}", e)))?;
        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| BodyError::Read(e.to_string()));

        Ok(HttpResponse { status, body })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> NetworkError {
    if error.is_builder() {
        return NetworkError::Blocked(error.to_string());
    }
    if error.is_connect() && is_resolution_failure(&error) {
        let host = error
            .url()
            .and_then(|url| url.host_str())
            .unwrap_or("<unknown>")
            .to_string();
        return NetworkError::Dns(host);
    }
    NetworkError::Failed(Box::new(error))
}

/// The connector reports lookup failures only as text somewhere in the
/// source chain ("dns error", "failed to lookup address information").
fn is_resolution_failure(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(cause) = current {
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        current = cause.source();
    }
    false
}
