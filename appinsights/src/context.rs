//! Telemetry context: the instrumentation key and tag bag stamped onto every
//! envelope emitted through a client or operation.

use std::collections::HashMap;

use crate::telemetry::{Envelope, Telemetry};

/// Well-known context tag keys.
pub mod tags {
    pub const OPERATION_ID: &str = "ai.operation.id";
    pub const OPERATION_PARENT_ID: &str = "ai.operation.parentId";
    pub const OPERATION_NAME: &str = "ai.operation.name";
    pub const LOCATION_IP: &str = "ai.location.ip";
    pub const CLOUD_ROLE: &str = "ai.cloud.role";
    pub const INTERNAL_SDK_VERSION: &str = "ai.internal.sdkVersion";
}

/// Instrumentation key and tags applied to every envelope produced under
/// this context.
#[derive(Clone, Debug, Default)]
pub struct TelemetryContext {
    pub(crate) ikey: String,
    pub(crate) tags: HashMap<String, String>,
}

impl TelemetryContext {
    pub fn new(ikey: impl Into<String>) -> Self {
        TelemetryContext {
            ikey: ikey.into(),
            tags: HashMap::new(),
        }
    }

    pub fn instrumentation_key(&self) -> &str {
        &self.ikey
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.tags
    }

    /// Wraps a telemetry item into an envelope, merging the item's own tags
    /// over this context's tags.
    pub fn envelop<T: Telemetry>(&self, item: T) -> Envelope {
        let mut tags = self.tags.clone();
        for (key, value) in item.tags() {
            tags.insert(key.clone(), value.clone());
        }

        Envelope {
            ikey: self.ikey.clone(),
            time: item.timestamp(),
            sample_rate: 100.0,
            tags,
            data: item.into_data(),
        }
    }
}
