//! End-to-end scenarios: an inbound request that makes nested outbound
//! calls, exercising the full header chain the way two correlated services
//! would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response};

use appinsights::context::tags;
use appinsights::http_client::{HttpClient, HttpError};
use appinsights::testing::{InMemoryChannel, StaticProfileClient};
use appinsights::{
    AppIdResolver, CorrelationProperties, OperationId, TelemetryClient, TelemetryConfig,
    TelemetryData,
};
use appinsights_http::{DependencyTrackingConfig, HttpMiddleware, InstrumentedHttpClient};

/// A stand-in downstream service that records request headers and replies
/// with its own identity.
#[derive(Debug, Default)]
struct DownstreamService {
    identity: String,
    hits: AtomicUsize,
    seen: Mutex<Vec<HeaderMap>>,
}

impl DownstreamService {
    fn new(identity: &str) -> Arc<Self> {
        Arc::new(DownstreamService {
            identity: identity.to_string(),
            ..Default::default()
        })
    }

    fn last_headers(&self) -> HeaderMap {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl HttpClient for DownstreamService {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.headers().clone());

        let mut response = Response::builder().status(200).body(Bytes::new())?;
        if !self.identity.is_empty() {
            response.headers_mut().insert(
                "request-context",
                format!("appId=cid-v1:{},roleName=backend", self.identity).parse()?,
            );
        }
        Ok(response)
    }
}

fn harness(
    channel: Arc<InMemoryChannel>,
    downstream: Arc<DownstreamService>,
) -> (HttpMiddleware, Arc<InstrumentedHttpClient>) {
    let resolver = Arc::new(AppIdResolver::new(Arc::new(StaticProfileClient::new(
        200, "frontend",
    ))));
    let mut config = TelemetryConfig::new("frontend-ikey");
    config.role_name = Some("frontend".to_string());
    let client = Arc::new(TelemetryClient::new(config, channel, resolver));

    let middleware = HttpMiddleware::new(client.clone());
    let outbound = Arc::new(InstrumentedHttpClient::new(downstream, client));
    (middleware, outbound)
}

fn get(uri: &str) -> Request<Bytes> {
    Request::builder().uri(uri).body(Bytes::new()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn headerless_request_with_nested_dependency() {
    let channel = Arc::new(InMemoryChannel::new());
    let downstream = DownstreamService::new("callee");
    let (middleware, outbound) = harness(channel.clone(), downstream.clone());
    tokio::task::yield_now().await;

    middleware
        .instrument(get("http://frontend/orders"), None, |scope, _req| {
            let outbound = outbound.clone();
            async move {
                outbound
                    .send(&scope, get("http://backend.example.com/inventory"))
                    .await
                    .unwrap();
                Response::builder().status(200).body(Bytes::new()).unwrap()
            }
        })
        .await;

    let envelopes = channel.envelopes();
    assert_eq!(envelopes.len(), 2, "one dependency, one request");

    // The dependency is emitted first (it finishes inside the handler) and
    // shares the request's operation id.
    let dependency = match &envelopes[0].data {
        TelemetryData::RemoteDependency(dependency) => dependency,
        other => panic!("expected dependency first, got {other:?}"),
    };
    let request = match &envelopes[1].data {
        TelemetryData::Request(request) => request,
        other => panic!("expected request second, got {other:?}"),
    };

    // With no inbound correlation headers the operation id is a fresh root.
    let operation_id = &envelopes[1].tags[tags::OPERATION_ID];
    let root = OperationId::from(request.id.as_str()).get_root();
    assert_eq!(root.as_str(), operation_id);
    assert!(request.id.as_str().starts_with('|'));
    assert!(request.id.as_str().ends_with('.'));
    assert_eq!(&envelopes[0].tags[tags::OPERATION_ID], operation_id);

    // The nested call carried a request-id that is a child of the inbound
    // operation's parent id.
    let sent = downstream.last_headers();
    let sent_id = sent.get("request-id").unwrap().to_str().unwrap();
    assert!(sent_id.starts_with(request.id.as_str()), "{sent_id} not a child of {}", request.id);
    assert_eq!(dependency.id.as_str(), sent_id);

    // The callee identified itself, so the dependency was upgraded.
    assert_eq!(dependency.dependency_type, "Http (tracked component)");
    assert_eq!(
        dependency.target,
        "backend.example.com | cid-v1:callee | roleName:backend"
    );

    // And we advertised ourselves to it.
    let sent_context = sent.get("request-context").unwrap().to_str().unwrap();
    assert!(sent_context.contains("appId=cid-v1:frontend"));
    assert!(sent_context.contains("roleName=frontend"));
}

#[tokio::test(start_paused = true)]
async fn upstream_correlation_flows_through_to_dependencies() {
    let channel = Arc::new(InMemoryChannel::new());
    let downstream = DownstreamService::new("callee");
    let (middleware, outbound) = harness(channel.clone(), downstream.clone());

    let mut inbound = get("http://frontend/orders");
    inbound
        .headers_mut()
        .insert("request-id", "|upstream-root.1.".parse().unwrap());
    inbound
        .headers_mut()
        .insert("correlation-context", "tenant=42".parse().unwrap());

    middleware
        .instrument(inbound, None, |scope, _req| {
            let outbound = outbound.clone();
            async move {
                outbound
                    .send(&scope, get("http://backend.example.com/inventory"))
                    .await
                    .unwrap();
                Response::builder().status(200).body(Bytes::new()).unwrap()
            }
        })
        .await;

    let envelopes = channel.envelopes();
    assert_eq!(envelopes.len(), 2);

    // Everything chains off the upstream id.
    assert_eq!(envelopes[1].tags[tags::OPERATION_ID], "upstream-root");
    assert_eq!(envelopes[1].tags[tags::OPERATION_PARENT_ID], "|upstream-root.1.");

    let sent = downstream.last_headers();
    let sent_id = sent.get("request-id").unwrap().to_str().unwrap();
    assert!(sent_id.starts_with("|upstream-root.1."));

    // The custom property bag is mirrored onto the outbound call.
    let mirrored =
        CorrelationProperties::parse(sent.get("correlation-context").unwrap().to_str().unwrap());
    assert_eq!(mirrored.get("tenant"), Some("42"));
}

#[tokio::test(start_paused = true)]
async fn excluded_domains_get_clean_requests_even_under_an_operation() {
    let channel = Arc::new(InMemoryChannel::new());
    let downstream = DownstreamService::new("");
    let (middleware, outbound) = harness(channel.clone(), downstream.clone());

    middleware
        .instrument(get("http://frontend/export"), None, |scope, _req| {
            let outbound = outbound.clone();
            async move {
                outbound
                    .send(&scope, get("https://acct.blob.core.windows.net/backup"))
                    .await
                    .unwrap();
                Response::builder().status(200).body(Bytes::new()).unwrap()
            }
        })
        .await;

    let sent = downstream.last_headers();
    assert!(sent.get("request-id").is_none());
    assert!(sent.get("x-ms-request-root-id").is_none());
    assert!(sent.get("x-ms-request-id").is_none());
    assert!(sent.get("correlation-context").is_none());
    assert!(sent.get("request-context").is_none());

    // The dependency is still tracked, without an id.
    let envelopes = channel.envelopes();
    match &envelopes[0].data {
        TelemetryData::RemoteDependency(dependency) => assert!(dependency.id.is_empty()),
        other => panic!("expected dependency telemetry, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn custom_exclusion_globs_are_case_insensitive() {
    let channel = Arc::new(InMemoryChannel::new());
    let downstream = DownstreamService::new("");
    let resolver = Arc::new(AppIdResolver::new(Arc::new(StaticProfileClient::new(
        200, "frontend",
    ))));
    let client = Arc::new(TelemetryClient::new(
        TelemetryConfig::new("frontend-ikey"),
        channel.clone(),
        resolver,
    ));
    let middleware = HttpMiddleware::new(client.clone());
    let outbound = Arc::new(InstrumentedHttpClient::with_config(
        downstream.clone(),
        client,
        DependencyTrackingConfig {
            send_correlation_headers: true,
            exclude_domains: vec!["*.internal.example".to_string()],
        },
    ));

    middleware
        .instrument(get("http://frontend/"), None, |scope, _req| {
            let outbound = outbound.clone();
            async move {
                outbound
                    .send(&scope, get("http://Secrets.INTERNAL.example/keys"))
                    .await
                    .unwrap();
                Response::builder().status(200).body(Bytes::new()).unwrap()
            }
        })
        .await;

    assert!(downstream.last_headers().get("request-id").is_none());
}
