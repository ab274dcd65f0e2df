//! A scoped telemetry-emission handle bound to one correlation context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{track_with, TelemetryClient};
use crate::context::{tags, TelemetryContext};
use crate::correlation::CorrelationContext;
use crate::telemetry::{EventTelemetry, ExceptionTelemetry, RequestTelemetry, Telemetry};

/// One logical unit of work (typically one inbound request).
///
/// Telemetry tracked through an operation carries the operation's id,
/// parent id, and name tags instead of the client's. The sampling rate and
/// enablement are captured from the client at creation time; later changes
/// to the client do not retroactively affect the operation.
pub struct Operation {
    client: Arc<TelemetryClient>,
    context: TelemetryContext,
    correlation: CorrelationContext,
    sampling: f64,
    enabled: AtomicBool,
}

impl Operation {
    pub fn new(client: Arc<TelemetryClient>, correlation: CorrelationContext) -> Self {
        let mut context = client.context().clone();
        let tag_bag = context.tags_mut();
        tag_bag.insert(
            tags::OPERATION_ID.to_string(),
            correlation.id.as_str().to_string(),
        );
        tag_bag.insert(
            tags::OPERATION_PARENT_ID.to_string(),
            correlation.parent_id.as_str().to_string(),
        );
        tag_bag.insert(tags::OPERATION_NAME.to_string(), correlation.name.clone());

        Operation {
            sampling: client.sampling_percentage(),
            enabled: AtomicBool::new(client.is_enabled()),
            client,
            context,
            correlation,
        }
    }

    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    pub fn context(&self) -> &TelemetryContext {
        &self.context
    }

    /// The application id of the process, resolved by the root client. Every
    /// operation of a client shares the same identity.
    pub fn correlation_id(&self) -> String {
        self.client.correlation_id()
    }

    pub fn client(&self) -> &Arc<TelemetryClient> {
        &self.client
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed) && self.client.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Submits a telemetry item tagged with this operation's identity,
    /// subject to the captured sampling rate.
    pub fn track<T: Telemetry>(&self, item: T) {
        if self.is_enabled() {
            track_with(
                &self.context,
                self.client.channel().as_ref(),
                self.sampling,
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

    pub fn track_exception(&self, message: impl Into<String>) {
        self.track(ExceptionTelemetry::new(message));
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.correlation.id)
            .field("name", &self.correlation.name)
            .finish_non_exhaustive()
    }
}
