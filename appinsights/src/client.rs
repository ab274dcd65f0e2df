//! The telemetry client: the root emission handle for one instrumented
//! application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::context::{tags, TelemetryContext};
use crate::operation_id::{IdGenerator, OperationId};
use crate::resolver::{AppIdResolver, CORRELATION_ID_PREFIX};
use crate::telemetry::{
    EventTelemetry, ExceptionTelemetry, RemoteDependencyTelemetry, RequestTelemetry, Telemetry,
    TelemetryChannel,
};

const DEFAULT_PROFILE_QUERY_ENDPOINT: &str = "https://dc.services.visualstudio.com";

/// Values used to initialize a [`TelemetryClient`].
///
/// Changing the config after construction has no effect on the client.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// The instrumentation key identifying this application's telemetry
    /// tenant.
    pub instrumentation_key: String,
    /// Base URL queried for this application's public id.
    pub profile_query_endpoint: String,
    /// Role name stamped onto emitted telemetry and correlation headers.
    pub role_name: Option<String>,
}

impl TelemetryConfig {
    pub fn new(instrumentation_key: impl Into<String>) -> Self {
        TelemetryConfig {
            instrumentation_key: instrumentation_key.into(),
            profile_query_endpoint: DEFAULT_PROFILE_QUERY_ENDPOINT.to_string(),
            role_name: None,
        }
    }
}

/// Tracks telemetry for one application and owns the shared correlation
/// services: the id generator, the resolved application id, the enabled
/// flag, and the sampling percentage.
pub struct TelemetryClient {
    channel: Arc<dyn TelemetryChannel>,
    context: TelemetryContext,
    ids: Arc<IdGenerator>,
    resolver: Arc<AppIdResolver>,
    profile_query_endpoint: String,
    correlation_id: Arc<RwLock<String>>,
    enabled: AtomicBool,
    sampling: RwLock<f64>,
}

impl TelemetryClient {
    /// Creates a client and starts resolving its application id in the
    /// background.
    ///
    /// Must be called within a Tokio runtime; the resolver spawns its lookup
    /// task onto it.
    pub fn new(
        config: TelemetryConfig,
        channel: Arc<dyn TelemetryChannel>,
        resolver: Arc<AppIdResolver>,
    ) -> Self {
        let mut context = TelemetryContext::new(config.instrumentation_key.clone());
        context.tags_mut().insert(
            tags::INTERNAL_SDK_VERSION.to_string(),
            concat!("rust:", env!("CARGO_PKG_VERSION")).to_string(),
        );
        if let Some(role) = &config.role_name {
            context
                .tags_mut()
                .insert(tags::CLOUD_ROLE.to_string(), role.clone());
        }

        // Until the lookup answers, the correlation id is the bare prefix,
        // which header consumers treat as a placeholder.
        let correlation_id = Arc::new(RwLock::new(CORRELATION_ID_PREFIX.to_string()));
        let slot = Arc::clone(&correlation_id);
        resolver.query(
            &config.profile_query_endpoint,
            &config.instrumentation_key,
            move |result| {
                *slot.write().expect("correlation id poisoned") = result.app_id.clone();
            },
        );

        TelemetryClient {
            channel,
            context,
            ids: Arc::new(IdGenerator::new()),
            resolver,
            profile_query_endpoint: config.profile_query_endpoint,
            correlation_id,
            enabled: AtomicBool::new(true),
            sampling: RwLock::new(100.0),
        }
    }

    /// The unique id representing this application when correlating
    /// operations across services. Empty when resolution failed; the bare
    /// prefix while resolution is still in flight.
    pub fn correlation_id(&self) -> String {
        self.correlation_id
            .read()
            .expect("correlation id poisoned")
            .clone()
    }

    pub fn context(&self) -> &TelemetryContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TelemetryContext {
        &mut self.context
    }

    pub fn instrumentation_key(&self) -> &str {
        self.context.instrumentation_key()
    }

    pub fn channel(&self) -> &Arc<dyn TelemetryChannel> {
        &self.channel
    }

    pub fn id_generator(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn resolver(&self) -> &Arc<AppIdResolver> {
        &self.resolver
    }

    pub fn profile_query_endpoint(&self) -> &str {
        &self.profile_query_endpoint
    }

    /// Whether this client accepts telemetry. When disabled, items are
    /// silently swallowed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn sampling_percentage(&self) -> f64 {
        *self.sampling.read().expect("sampling poisoned")
    }

    /// Sets the percentage of sample-able telemetry retained by this client.
    pub fn set_sampling_percentage(&self, percentage: f64) {
        *self.sampling.write().expect("sampling poisoned") = percentage;
    }

    /// Submits a telemetry item, subject to the sampling rule.
    pub fn track<T: Telemetry>(&self, item: T) {
        if self.is_enabled() {
            track_with(
                &self.context,
                self.channel.as_ref(),
                self.sampling_percentage(),
                item,
            );
        }
    }

    pub fn track_event(&self, name: impl Into<String>) {
        self.track(EventTelemetry::new(name));
    }

    pub fn track_request(&self, method: &str, url: &str, duration: Duration, response_code: &str) {
        self.track(RequestTelemetry::new(method, url, duration, response_code));
    }

    pub fn track_remote_dependency(
        &self,
        name: &str,
        dependency_type: &str,
        target: &str,
        success: bool,
    ) {
        self.track(RemoteDependencyTelemetry::new(
            name,
            dependency_type,
            target,
            success,
        ));
    }

    pub fn track_exception(&self, message: impl Into<String>) {
        self.track(ExceptionTelemetry::new(message));
    }
}

impl std::fmt::Debug for TelemetryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryClient")
            .field("ikey", &self.context.instrumentation_key())
            .finish_non_exhaustive()
    }
}

/// The uniform sampling rule: an item is included when it is not
/// sample-able, the rate is at or above 100, or its operation id hashes
/// under the rate. Every accepted envelope records the rate it was sampled
/// at.
pub(crate) fn track_with<T: Telemetry>(
    context: &TelemetryContext,
    channel: &dyn TelemetryChannel,
    sampling: f64,
    item: T,
) {
    let can_sample = item.can_sample();
    let mut envelope = context.envelop(item);

    let included = !can_sample || sampling >= 100.0 || {
        let operation_id = envelope
            .tags
            .get(tags::OPERATION_ID)
            .cloned()
            .unwrap_or_default();
        OperationId::from(operation_id).hash() < sampling
    };

    if included {
        envelope.sample_rate = sampling;
        channel.send(envelope);
    }
}
