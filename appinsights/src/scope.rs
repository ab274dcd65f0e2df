//! The request-scoped context threaded through the instrumentation pipeline.

use std::sync::Arc;

use crate::operation::Operation;

/// Carries the active [`Operation`] and the ignore marker through a request's
/// call chain.
///
/// A scope is an immutable value; deriving a new one never mutates the
/// original, so handing a scope to concurrent callees is safe. An ignored
/// scope suppresses both correlation header injection and telemetry emission
/// for calls made under it.
#[derive(Clone, Debug, Default)]
pub struct TelemetryScope {
    operation: Option<Arc<Operation>>,
    ignore: bool,
}

impl TelemetryScope {
    /// A scope bound to the given operation.
    pub fn with_operation(operation: Arc<Operation>) -> Self {
        TelemetryScope {
            operation: Some(operation),
            ignore: false,
        }
    }

    /// A scope whose calls are exempt from correlation and tracking. Used,
    /// for example, by the resolver's own profile queries.
    pub fn ignored() -> Self {
        TelemetryScope {
            operation: None,
            ignore: true,
        }
    }

    /// Returns a copy of this scope with the ignore marker set.
    pub fn ignoring(&self) -> Self {
        TelemetryScope {
            operation: self.operation.clone(),
            ignore: true,
        }
    }

    pub fn operation(&self) -> Option<&Arc<Operation>> {
        self.operation.as_ref()
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore
    }
}
