//! HTTP instrumentation for the `appinsights` correlation engine.
//!
//! Two halves, tied together by the core crate's
//! [`TelemetryScope`](appinsights::TelemetryScope):
//!
//! * [`HttpMiddleware`] tracks inbound requests: it decodes correlation
//!   headers, opens an [`Operation`](appinsights::Operation) for the
//!   request, runs the handler under a scope, and finalizes Request
//!   telemetry — including the failure path, where a handler panic becomes
//!   Exception telemetry and is then resumed unchanged.
//! * [`InstrumentedHttpClient`] tracks outbound calls: it injects
//!   correlation headers (unless the destination is excluded or the scope is
//!   ignored), times the call, inspects the response for the callee's
//!   identity, and emits RemoteDependency telemetry.
//!
//! Web-framework adapters translate their request/response abstractions
//! onto [`HttpMiddleware::instrument`]; they carry no decision logic and
//! live outside this crate.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod dependencies;
pub mod headers;
pub mod requests;

pub use dependencies::{DependencyTrackingConfig, InstrumentedHttpClient};
pub use requests::{HttpMiddleware, RequestTrackingConfig};

#[cfg(feature = "reqwest")]
mod reqwest {
    use appinsights::http_client::{Bytes, HttpClient, HttpError, Request, Response};
    use async_trait::async_trait;

    /// [`HttpClient`] backed by a [`reqwest::Client`].
    ///
    /// Non-success statuses are returned as responses, not errors: the
    /// resolver and the dependency tracker both classify on the raw status
    /// code.
    #[derive(Clone, Debug, Default)]
    pub struct ReqwestClient(pub ::reqwest::Client);

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            let request = request.try_into()?;
            let mut response = self.0.execute(request).await?;
            let headers = std::mem::take(response.headers_mut());
            let mut http_response = Response::builder()
                .status(response.status())
                .body(response.bytes().await?)?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }
}

#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
pub use crate::reqwest::ReqwestClient;
