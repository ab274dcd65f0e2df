//! Inbound request tracking.
//!
//! The middleware decodes correlation headers, opens an [`Operation`] for
//! the request, runs the handler under a [`TelemetryScope`], and finalizes
//! Request telemetry when the handler returns or panics. Web-framework
//! adapters are thin shims over [`HttpMiddleware::instrument`]; nothing
//! framework-specific lives here.

use std::future::Future;
use std::net::IpAddr;
use std::panic;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use http::{HeaderMap, Request, Response};

use appinsights::context::tags;
use appinsights::{
    CorrelationContext, Operation, RequestTelemetry, TelemetryClient, TelemetryScope,
};

use crate::headers::{parse_request_headers, set_response_headers};

/// Flags that modify the behavior of inbound request tracking.
#[derive(Clone, Debug)]
pub struct RequestTrackingConfig {
    /// Whether to advertise this service's identity on responses.
    pub send_correlation_headers: bool,
    /// Whether to record the caller's user agent. Off by default for data
    /// usage savings.
    pub log_user_agent: bool,
}

impl Default for RequestTrackingConfig {
    fn default() -> Self {
        RequestTrackingConfig {
            send_correlation_headers: true,
            log_user_agent: false,
        }
    }
}

/// Tracks incoming requests against a [`TelemetryClient`].
#[derive(Debug)]
pub struct HttpMiddleware {
    client: Arc<TelemetryClient>,
    config: RequestTrackingConfig,
}

impl HttpMiddleware {
    pub fn new(client: Arc<TelemetryClient>) -> Self {
        Self::with_config(client, RequestTrackingConfig::default())
    }

    pub fn with_config(client: Arc<TelemetryClient>, config: RequestTrackingConfig) -> Self {
        HttpMiddleware { client, config }
    }

    /// Runs `handler` for `request`, tracking it as Request telemetry.
    ///
    /// The handler receives the request back along with the
    /// [`TelemetryScope`] carrying the request's [`Operation`]; outbound
    /// calls made through an instrumented client with that scope are
    /// correlated as children of this request. The response's status code is
    /// the recorded response code.
    ///
    /// A handler panic is recorded as Exception telemetry plus a failed
    /// (500) Request, and then resumed unchanged so outer layers still
    /// observe it.
    pub async fn instrument<B, RB, F, Fut>(
        &self,
        request: Request<B>,
        remote_addr: Option<&str>,
        handler: F,
    ) -> Response<RB>
    where
        F: FnOnce(TelemetryScope, Request<B>) -> Fut,
        Fut: Future<Output = Response<RB>>,
    {
        let (mut telemetry, operation) = self.begin_request(&request, remote_addr);
        let scope = TelemetryScope::with_operation(operation.clone());
        let start = Instant::now();

        let outcome = panic::AssertUnwindSafe(handler(scope, request))
            .catch_unwind()
            .await;

        match outcome {
            Ok(mut response) => {
                telemetry.set_response_code(response.status().as_u16());
                telemetry.duration = start.elapsed();
                if self.config.send_correlation_headers {
                    set_response_headers(response.headers_mut(), &operation);
                }
                operation.track(telemetry);
                response
            }
            Err(cause) => {
                telemetry.set_response_code(500);
                telemetry.duration = start.elapsed();
                operation.track_exception(panic_message(&cause));
                operation.track(telemetry);
                panic::resume_unwind(cause);
            }
        }
    }

    /// Decodes correlation headers and opens the request's operation and
    /// telemetry item. Exposed for adapters that drive the lifecycle
    /// manually.
    pub fn begin_request<B>(
        &self,
        request: &Request<B>,
        remote_addr: Option<&str>,
    ) -> (RequestTelemetry, Arc<Operation>) {
        let headers = parse_request_headers(request.headers(), self.client.id_generator());
        let name = format!("{} {}", request.method(), request.uri().path());

        let mut telemetry = RequestTelemetry::new(
            request.method().as_str(),
            &request.uri().to_string(),
            Duration::ZERO,
            "200",
        );
        telemetry.name = name.clone();
        telemetry.id = headers.request_id.clone();
        telemetry.source = headers.source();

        // The request item records the wire-level parent, which in legacy
        // mode may differ from the operation's own parent tag.
        let parent_tag = if headers.parent_id.is_empty() {
            headers.root_id.clone()
        } else {
            headers.parent_id.as_str().to_string()
        };
        telemetry
            .tags
            .insert(tags::OPERATION_PARENT_ID.to_string(), parent_tag);
        telemetry.tags.insert(
            tags::LOCATION_IP.to_string(),
            client_ip(request.headers(), remote_addr),
        );
        if self.config.log_user_agent {
            let agent = request
                .headers()
                .get(http::header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            telemetry
                .tags
                .insert("ai.user.userAgent".to_string(), agent.to_string());
        }

        let correlation = CorrelationContext::new(
            headers.request_id.get_root(),
            headers.request_id,
            name,
            headers.properties,
        );
        let operation = Arc::new(Operation::new(self.client.clone(), correlation));

        (telemetry, operation)
    }
}

/// Picks the client IP: the first valid `x-forwarded-for` entry, else the
/// connection's remote address with IPv6 brackets and any port stripped.
fn client_ip(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !forwarded.is_empty() {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if first.parse::<IpAddr>().is_ok() {
            return first.to_string();
        }
    }

    if let Some(addr) = remote_addr {
        if let Some(rest) = addr.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                let ip = &rest[..end];
                if ip.parse::<IpAddr>().is_ok() {
                    return ip.to_string();
                }
            }
        }

        if let Some((ip, _port)) = addr.split_once(':') {
            if ip.parse::<IpAddr>().is_ok() {
                return ip.to_string();
            }
        }

        if addr.parse::<IpAddr>().is_ok() {
            return addr.to_string();
        }
    }

    String::new()
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
