//! Telemetry items and the transport contract.
//!
//! The envelope schema and the buffering transport are external
//! collaborators; this module defines only the surface the correlation
//! engine needs: a tag bag, a timestamp, an instrumentation key, and a
//! `send` seam.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::operation_id::OperationId;

/// A telemetry envelope handed to the transport.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub ikey: String,
    pub time: SystemTime,
    pub sample_rate: f64,
    pub tags: HashMap<String, String>,
    pub data: TelemetryData,
}

/// The transport seam: accepts tagged envelopes for buffering and
/// transmission to the backend.
pub trait TelemetryChannel: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// Concrete telemetry payloads produced by this engine.
#[derive(Clone, Debug)]
pub enum TelemetryData {
    Request(RequestTelemetry),
    RemoteDependency(RemoteDependencyTelemetry),
    Exception(ExceptionTelemetry),
    Event(EventTelemetry),
}

/// Common behavior of telemetry items.
pub trait Telemetry {
    /// The time the item was observed.
    fn timestamp(&self) -> SystemTime;

    /// Per-item context tags, merged over the emitting context's tags.
    fn tags(&self) -> &HashMap<String, String>;

    /// Whether the item participates in statistical sampling.
    fn can_sample(&self) -> bool {
        true
    }

    fn into_data(self) -> TelemetryData;
}

/// Telemetry about an incoming request served by this application.
#[derive(Clone, Debug)]
pub struct RequestTelemetry {
    /// Identifier of this request within its operation hierarchy.
    pub id: OperationId,
    /// Request name, by convention the method and path.
    pub name: String,
    pub url: String,
    pub duration: Duration,
    pub response_code: String,
    pub success: bool,
    /// Identity of the calling component, when correlated.
    pub source: String,
    pub timestamp: SystemTime,
    pub tags: HashMap<String, String>,
}

impl RequestTelemetry {
    pub fn new(method: &str, url: &str, duration: Duration, response_code: &str) -> Self {
        let code: u32 = response_code.parse().unwrap_or(0);
        RequestTelemetry {
            id: OperationId::default(),
            name: format!("{method} {url}"),
            url: url.to_string(),
            duration,
            response_code: response_code.to_string(),
            success: code < 400,
            source: String::new(),
            timestamp: SystemTime::now(),
            tags: HashMap::new(),
        }
    }

    /// Records the response code and derives success from it.
    pub fn set_response_code(&mut self, code: u16) {
        self.response_code = code.to_string();
        self.success = code < 400;
    }
}

impl Telemetry for RequestTelemetry {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    fn into_data(self) -> TelemetryData {
        TelemetryData::Request(self)
    }
}

/// Telemetry about an outbound call made by this application.
#[derive(Clone, Debug)]
pub struct RemoteDependencyTelemetry {
    /// Identifier of this call within its operation hierarchy; empty when no
    /// correlation headers were sent.
    pub id: OperationId,
    pub name: String,
    pub dependency_type: String,
    /// The called component, enriched with its identity when it returned one.
    pub target: String,
    pub success: bool,
    pub result_code: String,
    pub duration: Duration,
    /// Command or URL issued to the dependency.
    pub data: String,
    pub timestamp: SystemTime,
    pub tags: HashMap<String, String>,
}

impl RemoteDependencyTelemetry {
    pub fn new(name: &str, dependency_type: &str, target: &str, success: bool) -> Self {
        RemoteDependencyTelemetry {
            id: OperationId::default(),
            name: name.to_string(),
            dependency_type: dependency_type.to_string(),
            target: target.to_string(),
            success,
            result_code: String::new(),
            duration: Duration::ZERO,
            data: String::new(),
            timestamp: SystemTime::now(),
            tags: HashMap::new(),
        }
    }
}

impl Telemetry for RemoteDependencyTelemetry {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    fn into_data(self) -> TelemetryData {
        TelemetryData::RemoteDependency(self)
    }
}

/// Telemetry about an unhandled fault in application code.
#[derive(Clone, Debug)]
pub struct ExceptionTelemetry {
    pub message: String,
    pub timestamp: SystemTime,
    pub tags: HashMap<String, String>,
}

impl ExceptionTelemetry {
    pub fn new(message: impl Into<String>) -> Self {
        ExceptionTelemetry {
            message: message.into(),
            timestamp: SystemTime::now(),
            tags: HashMap::new(),
        }
    }
}

impl Telemetry for ExceptionTelemetry {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    fn into_data(self) -> TelemetryData {
        TelemetryData::Exception(self)
    }
}

/// A named user or system event.
#[derive(Clone, Debug)]
pub struct EventTelemetry {
    pub name: String,
    pub timestamp: SystemTime,
    pub tags: HashMap<String, String>,
}

impl EventTelemetry {
    pub fn new(name: impl Into<String>) -> Self {
        EventTelemetry {
            name: name.into(),
            timestamp: SystemTime::now(),
            tags: HashMap::new(),
        }
    }
}

impl Telemetry for EventTelemetry {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    fn into_data(self) -> TelemetryData {
        TelemetryData::Event(self)
    }
}
