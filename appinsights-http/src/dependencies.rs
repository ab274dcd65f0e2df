//! Outbound dependency tracking.
//!
//! Wraps an [`HttpClient`] so every call made through it is timed, tagged
//! with a child identifier of the active operation, and reported as
//! RemoteDependency telemetry. Hosts matching the exclusion globs never
//! receive correlation headers; ignored scopes bypass tracking entirely.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use appinsights::http_client::{Bytes, HttpClient, HttpError, Request, Response};
use appinsights::{
    OperationId, RemoteDependencyTelemetry, TelemetryClient, TelemetryScope,
    CORRELATION_ID_PREFIX,
};

use crate::headers::{attach_request_context, attach_request_headers, parse_response_headers};

const DEPENDENCY_TYPE_HTTP: &str = "Http";
const DEPENDENCY_TYPE_TRACKED: &str = "Http (tracked component)";

/// Storage services never return correlation headers; sending them ours
/// would leak internal operation ids for nothing.
const DEFAULT_EXCLUDED_DOMAINS: &[&str] = &[
    "*.core.windows.net",
    "*.core.chinacloudapi.cn",
    "*.core.cloudapi.de",
    "*.core.usgovcloudapi.net",
    "dc.services.visualstudio.com",
];

/// Flags that modify the behavior of outbound dependency tracking.
#[derive(Clone, Debug)]
pub struct DependencyTrackingConfig {
    /// Whether dependency calls ever emit correlation headers upstream.
    pub send_correlation_headers: bool,
    /// Domains that must never receive correlation headers. `*` matches any
    /// run of characters; matching is case-insensitive.
    pub exclude_domains: Vec<String>,
}

impl Default for DependencyTrackingConfig {
    fn default() -> Self {
        DependencyTrackingConfig {
            send_correlation_headers: true,
            exclude_domains: DEFAULT_EXCLUDED_DOMAINS
                .iter()
                .map(|domain| domain.to_string())
                .collect(),
        }
    }
}

/// An [`HttpClient`] wrapper that tracks remote dependencies against a
/// [`TelemetryClient`].
#[derive(Debug)]
pub struct InstrumentedHttpClient {
    inner: Arc<dyn HttpClient>,
    client: Arc<TelemetryClient>,
    config: DependencyTrackingConfig,
    excluded: GlobSet,
}

impl InstrumentedHttpClient {
    pub fn new(inner: Arc<dyn HttpClient>, client: Arc<TelemetryClient>) -> Self {
        Self::with_config(inner, client, DependencyTrackingConfig::default())
    }

    pub fn with_config(
        inner: Arc<dyn HttpClient>,
        client: Arc<TelemetryClient>,
        config: DependencyTrackingConfig,
    ) -> Self {
        let excluded = compile_globs(&config.exclude_domains);
        InstrumentedHttpClient {
            inner,
            client,
            config,
            excluded,
        }
    }

    /// Sends `request`, correlating and tracking it under `scope`.
    ///
    /// The response or transport error is returned unchanged; telemetry is
    /// submitted through the scope's operation when one is active, else
    /// through the root client.
    pub async fn send(
        &self,
        scope: &TelemetryScope,
        mut request: Request<Bytes>,
    ) -> Result<Response<Bytes>, HttpError> {
        if scope.is_ignored() {
            return self.inner.send(request).await;
        }

        let operation = scope.operation();
        let host = request.uri().host().unwrap_or("").to_string();
        let authority = request
            .uri()
            .authority()
            .map(|authority| authority.as_str().to_string())
            .unwrap_or_default();
        let name = format!("{} {}", request.method(), request.uri().path());
        let data = request.uri().to_string();

        let mut id = OperationId::default();
        if self.config.send_correlation_headers && !self.excluded.is_match(&host) {
            match operation {
                Some(operation) => id = attach_request_headers(request.headers_mut(), operation),
                None => attach_request_context(request.headers_mut(), &self.client),
            }
        }

        let timestamp = SystemTime::now();
        let start = Instant::now();
        let result = self.inner.send(request).await;

        let mut telemetry =
            RemoteDependencyTelemetry::new(&name, DEPENDENCY_TYPE_HTTP, &authority, false);
        telemetry.id = id;
        telemetry.data = data;
        telemetry.timestamp = timestamp;
        telemetry.duration = start.elapsed();

        match &result {
            Err(_) => {
                telemetry.success = false;
                telemetry.result_code = "0".to_string();
            }
            Ok(response) => {
                let status = response.status().as_u16();
                telemetry.success = status < 400;
                telemetry.result_code = status.to_string();

                let peer = parse_response_headers(response.headers());
                if !peer.app_id.is_empty() && peer.app_id != CORRELATION_ID_PREFIX {
                    telemetry.target = peer.target(&host);
                    telemetry.dependency_type = DEPENDENCY_TYPE_TRACKED.to_string();
                }
            }
        }

        match operation {
            Some(operation) => operation.track(telemetry),
            None => self.client.track(telemetry),
        }

        result
    }
}

fn compile_globs(domains: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for domain in domains {
        match GlobBuilder::new(domain).case_insensitive(true).build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(error) => {
                tracing::warn!(%domain, %error, "invalid excluded domain pattern");
            }
        }
    }

    builder.build().unwrap_or_else(|error| {
        tracing::warn!(%error, "failed to compile excluded domain set");
        GlobSet::empty()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use appinsights::testing::{InMemoryChannel, StaticProfileClient};
    use appinsights::{
        AppIdResolver, CorrelationContext, CorrelationProperties, Operation, TelemetryConfig,
        TelemetryData,
    };
    use async_trait::async_trait;
    use http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records the headers of every request and answers with a canned
    /// response.
    #[derive(Debug, Default)]
    struct RecordingServer {
        status: u16,
        response_headers: HeaderMap,
        fail: bool,
        hits: AtomicUsize,
        seen: Mutex<Vec<HeaderMap>>,
    }

    impl RecordingServer {
        fn ok() -> Arc<Self> {
            Arc::new(RecordingServer {
                status: 200,
                ..Default::default()
            })
        }

        fn last_headers(&self) -> HeaderMap {
            self.seen.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl HttpClient for RecordingServer {
        async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.headers().clone());
            if self.fail {
                return Err("connection refused".into());
            }

            let mut response = Response::builder()
                .status(self.status)
                .body(Bytes::new())
                .unwrap();
            response.headers_mut().extend(self.response_headers.clone());
            Ok(response)
        }
    }

    fn telemetry_client(channel: Arc<InMemoryChannel>) -> Arc<TelemetryClient> {
        let resolver = Arc::new(AppIdResolver::new(Arc::new(StaticProfileClient::new(
            200, "me",
        ))));
        Arc::new(TelemetryClient::new(
            TelemetryConfig::new("ikey"),
            channel,
            resolver,
        ))
    }

    fn scope_for(client: &Arc<TelemetryClient>) -> TelemetryScope {
        let correlation = CorrelationContext::new(
            OperationId::from("root"),
            OperationId::from("|root.1_"),
            "GET /",
            CorrelationProperties::new(),
        );
        TelemetryScope::with_operation(Arc::new(Operation::new(client.clone(), correlation)))
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    fn dependency(envelope: &appinsights::Envelope) -> &RemoteDependencyTelemetry {
        match &envelope.data {
            TelemetryData::RemoteDependency(dependency) => dependency,
            other => panic!("expected dependency telemetry, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_a_successful_dependency_with_child_id() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        let server = RecordingServer::ok();
        let instrumented = InstrumentedHttpClient::new(server.clone(), client.clone());

        let scope = scope_for(&client);
        instrumented
            .send(&scope, get("http://api.example.com/things"))
            .await
            .unwrap();

        let headers = server.last_headers();
        let sent_id = headers.get("request-id").unwrap().to_str().unwrap();
        assert!(sent_id.starts_with("|root.1_"));
        assert!(sent_id.ends_with('.'));
        assert_eq!(headers.get("x-ms-request-id").unwrap(), "root");

        let envelopes = channel.envelopes();
        assert_eq!(envelopes.len(), 1);
        let telemetry = dependency(&envelopes[0]);
        assert_eq!(telemetry.id.as_str(), sent_id);
        assert_eq!(telemetry.name, "GET /things");
        assert_eq!(telemetry.result_code, "200");
        assert!(telemetry.success);
        assert_eq!(telemetry.dependency_type, "Http");
        assert_eq!(telemetry.target, "api.example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_status_marks_the_dependency_failed() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        let server = Arc::new(RecordingServer {
            status: 503,
            ..Default::default()
        });
        let instrumented = InstrumentedHttpClient::new(server, client.clone());

        let scope = scope_for(&client);
        instrumented
            .send(&scope, get("http://api.example.com/things"))
            .await
            .unwrap();

        let telemetry_items = channel.envelopes();
        let telemetry = dependency(&telemetry_items[0]);
        assert!(!telemetry.success);
        assert_eq!(telemetry.result_code, "503");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_yields_result_code_zero() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        let server = Arc::new(RecordingServer {
            fail: true,
            ..Default::default()
        });
        let instrumented = InstrumentedHttpClient::new(server, client.clone());

        let scope = scope_for(&client);
        let result = instrumented
            .send(&scope, get("http://api.example.com/things"))
            .await;
        assert!(result.is_err(), "transport error must surface to the caller");

        let envelopes = channel.envelopes();
        let telemetry = dependency(&envelopes[0]);
        assert!(!telemetry.success);
        assert_eq!(telemetry.result_code, "0");
    }

    #[tokio::test(start_paused = true)]
    async fn correlated_response_sets_target_and_tracked_type() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            "request-context",
            "appId=cid-v1:callee,roleName=db".parse().unwrap(),
        );
        let server = Arc::new(RecordingServer {
            status: 200,
            response_headers,
            ..Default::default()
        });
        let instrumented = InstrumentedHttpClient::new(server, client.clone());

        let scope = scope_for(&client);
        instrumented
            .send(&scope, get("http://db.example.com:5432/query"))
            .await
            .unwrap();

        let envelopes = channel.envelopes();
        let telemetry = dependency(&envelopes[0]);
        assert_eq!(telemetry.dependency_type, "Http (tracked component)");
        assert_eq!(
            telemetry.target,
            "db.example.com | cid-v1:callee | roleName:db"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_identity_is_not_a_tracked_component() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        let mut response_headers = HeaderMap::new();
        response_headers.insert("request-context", "appId=cid-v1:".parse().unwrap());
        let server = Arc::new(RecordingServer {
            status: 200,
            response_headers,
            ..Default::default()
        });
        let instrumented = InstrumentedHttpClient::new(server, client.clone());

        let scope = scope_for(&client);
        instrumented
            .send(&scope, get("http://api.example.com/"))
            .await
            .unwrap();

        let envelopes = channel.envelopes();
        assert_eq!(dependency(&envelopes[0]).dependency_type, "Http");
    }

    #[tokio::test(start_paused = true)]
    async fn excluded_domains_receive_no_correlation_headers() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        let server = RecordingServer::ok();
        let instrumented = InstrumentedHttpClient::new(server.clone(), client.clone());

        let scope = scope_for(&client);
        instrumented
            .send(&scope, get("https://myaccount.blob.CORE.windows.net/c/b"))
            .await
            .unwrap();

        let headers = server.last_headers();
        assert!(headers.get("request-id").is_none());
        assert!(headers.get("request-context").is_none());

        // The call is still tracked, just uncorrelated.
        let envelopes = channel.envelopes();
        assert!(dependency(&envelopes[0]).id.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_scope_is_passthrough() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        let server = RecordingServer::ok();
        let instrumented = InstrumentedHttpClient::new(server.clone(), client.clone());

        instrumented
            .send(&TelemetryScope::ignored(), get("http://api.example.com/"))
            .await
            .unwrap();

        assert!(server.last_headers().get("request-id").is_none());
        assert!(channel.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn no_operation_still_advertises_identity_and_tracks_via_client() {
        let channel = Arc::new(InMemoryChannel::new());
        let client = telemetry_client(channel.clone());
        tokio::task::yield_now().await;
        let server = RecordingServer::ok();
        let instrumented = InstrumentedHttpClient::new(server.clone(), client.clone());

        instrumented
            .send(&TelemetryScope::default(), get("http://api.example.com/"))
            .await
            .unwrap();

        let headers = server.last_headers();
        assert!(headers.get("request-id").is_none());
        let context = headers.get("request-context").unwrap().to_str().unwrap();
        assert!(context.contains("appId=cid-v1:me"));

        let envelopes = channel.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert!(dependency(&envelopes[0]).id.is_empty());
    }
}
