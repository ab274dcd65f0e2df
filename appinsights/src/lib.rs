//! Client-side distributed-tracing correlation for a telemetry SDK.
//!
//! This crate assigns, parses, and propagates the hierarchical operation
//! identifiers that let independent services stitch their telemetry into one
//! causal trace, and decides which telemetry survives statistical sampling.
//!
//! It provides:
//!
//! * [`OperationId`] — the identifier algebra: root generation, root
//!   extraction, overflow-truncating suffix append, and the deterministic
//!   sampling hash shared across SDKs.
//! * [`CorrelationContext`] — an operation's name, id, parent id, and custom
//!   property bag.
//! * [`AppIdResolver`] — asynchronous, deduplicating resolution of an
//!   instrumentation key to the public application id used in correlation
//!   headers, with retry and permanent caching.
//! * [`TelemetryClient`] and [`Operation`] — sampled telemetry emission
//!   through an external transport, consumed via the [`TelemetryChannel`]
//!   seam.
//! * [`TelemetryScope`] — the explicit request-scoped context threaded
//!   through the HTTP instrumentation pipeline in the companion
//!   `appinsights-http` crate.
//!
//! The transport, the envelope schema, and concrete web frameworks are
//! external collaborators; only their minimal contracts appear here.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod context;
pub mod correlation;
pub mod http_client;
pub mod operation;
pub mod operation_id;
pub mod resolver;
pub mod scope;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

pub use client::{TelemetryClient, TelemetryConfig};
pub use context::{tags, TelemetryContext};
pub use correlation::{CorrelationContext, CorrelationProperties};
pub use http_client::{HttpClient, HttpError};
pub use operation::Operation;
pub use operation_id::{IdGenerator, OperationId};
pub use resolver::{AppIdResolver, AppIdResult, ResolveError, CORRELATION_ID_PREFIX};
pub use scope::TelemetryScope;
pub use telemetry::{
    Envelope, EventTelemetry, ExceptionTelemetry, RemoteDependencyTelemetry, RequestTelemetry,
    Telemetry, TelemetryChannel, TelemetryData,
};
