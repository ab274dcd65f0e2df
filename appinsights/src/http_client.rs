//! The minimal HTTP interface shared by the app id resolver and the outbound
//! instrumentation layer.

use std::fmt::Debug;

use async_trait::async_trait;

#[doc(no_inline)]
pub use bytes::Bytes;
#[doc(no_inline)]
pub use http::{Request, Response};

pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A minimal interface necessary for sending requests over HTTP.
///
/// Users sometimes choose HTTP clients that rely on a certain async runtime;
/// this trait lets them bring their own. Implementations for common clients
/// live in the companion instrumentation crate behind feature flags.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send the specified HTTP request with `Bytes` payload.
    ///
    /// Returns the HTTP response including the status code and body, or an
    /// error if the request could not be completed, e.g. because of a
    /// timeout or a loss of connection.
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}
