//! The correlation header protocol.
//!
//! Four header families carry correlation across request/response
//! boundaries: the new-protocol `request-id` + `correlation-context` pair,
//! the legacy `x-ms-request-root-id` + `x-ms-request-id` pair, and the
//! `request-context` identity bag exchanged in both directions. All encode
//! and decode functions here are stateless over a header map.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use appinsights::context::tags;
use appinsights::{
    CorrelationProperties, IdGenerator, Operation, OperationId, TelemetryClient,
};

pub(crate) const REQUEST_ID_HEADER: &str = "request-id";
pub(crate) const CORRELATION_CONTEXT_HEADER: &str = "correlation-context";
pub(crate) const REQUEST_CONTEXT_HEADER: &str = "request-context";
pub(crate) const ROOT_ID_HEADER: &str = "x-ms-request-root-id";
pub(crate) const PARENT_ID_HEADER: &str = "x-ms-request-id";

pub(crate) const REQUEST_CONTEXT_APP_ID_KEY: &str = "appId";
pub(crate) const REQUEST_CONTEXT_ROLE_NAME_KEY: &str = "roleName";

/// Returns a header value as a string slice, or `""` when absent or not
/// valid ASCII.
fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Sets a header, ignoring values that are not legal in a header.
fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// Correlation data decoded from incoming request headers.
#[derive(Debug)]
pub struct CorrelationRequestHeaders {
    pub root_id: String,
    pub parent_id: OperationId,
    pub request_id: OperationId,
    pub properties: CorrelationProperties,
    request_context: CorrelationProperties,
}

/// Decodes correlation data out of incoming request headers.
///
/// When the new-protocol `request-id` header is present it wins; otherwise
/// the legacy root/parent pair is consulted, and the custom property bag is
/// empty. The `request-context` identity bag is parsed either way.
pub fn parse_request_headers(
    headers: &HeaderMap,
    ids: &IdGenerator,
) -> CorrelationRequestHeaders {
    let request_context = CorrelationProperties::parse(header(headers, REQUEST_CONTEXT_HEADER));

    let request_id_header = header(headers, REQUEST_ID_HEADER);
    if !request_id_header.is_empty() {
        let parent_id = OperationId::from(request_id_header);
        let request_id = ids.request_id(&parent_id);
        CorrelationRequestHeaders {
            root_id: request_id.get_root().as_str().to_string(),
            parent_id,
            request_id,
            properties: CorrelationProperties::parse(header(headers, CORRELATION_CONTEXT_HEADER)),
            request_context,
        }
    } else {
        let root_id = header(headers, ROOT_ID_HEADER).to_string();
        let parent_id = OperationId::from(header(headers, PARENT_ID_HEADER));
        let request_id = if !root_id.is_empty() {
            ids.request_id(&OperationId::from(root_id.as_str()))
        } else {
            ids.request_id(&parent_id)
        };

        CorrelationRequestHeaders {
            root_id,
            parent_id,
            request_id,
            properties: CorrelationProperties::new(),
            request_context,
        }
    }
}

impl CorrelationRequestHeaders {
    /// Formats the Source field for inbound request telemetry: the caller's
    /// identity, when it supplied both an application id and a role name.
    pub fn source(&self) -> String {
        match (
            self.request_context.get(REQUEST_CONTEXT_APP_ID_KEY),
            self.request_context.get(REQUEST_CONTEXT_ROLE_NAME_KEY),
        ) {
            (Some(app_id), Some(role_name)) => format!("{app_id} | roleName:{role_name}"),
            _ => String::new(),
        }
    }
}

/// Encodes correlation headers onto an outgoing request made under
/// `operation`, and returns the generated child identifier so it can be
/// attached to the resulting dependency telemetry.
///
/// The caller's own identity is merged into `request-context` without
/// overwriting anything the application already put there.
pub fn attach_request_headers(headers: &mut HeaderMap, operation: &Operation) -> OperationId {
    let correlation = operation.correlation();
    let ids = operation.client().id_generator();
    let id = correlation
        .parent_id
        .append_suffix(&ids.next_dependency_suffix(), ".");

    set_header(headers, REQUEST_ID_HEADER, id.as_str());
    set_header(headers, ROOT_ID_HEADER, id.as_str());
    set_header(headers, PARENT_ID_HEADER, correlation.id.as_str());
    set_header(
        headers,
        CORRELATION_CONTEXT_HEADER,
        &correlation.properties.serialize(),
    );

    merge_request_context(
        headers,
        &operation.correlation_id(),
        operation.context().tags().get(tags::CLOUD_ROLE),
    );

    id
}

/// Merges the caller's identity into `request-context` when no operation is
/// active on the call.
pub fn attach_request_context(headers: &mut HeaderMap, client: &TelemetryClient) {
    merge_request_context(
        headers,
        &client.correlation_id(),
        client.context().tags().get(tags::CLOUD_ROLE),
    );
}

fn merge_request_context(headers: &mut HeaderMap, app_id: &str, role_name: Option<&String>) {
    let mut props = CorrelationProperties::parse(header(headers, REQUEST_CONTEXT_HEADER));
    if props.get(REQUEST_CONTEXT_APP_ID_KEY).unwrap_or("").is_empty() && !app_id.is_empty() {
        props.insert(REQUEST_CONTEXT_APP_ID_KEY, app_id);
    }
    if props
        .get(REQUEST_CONTEXT_ROLE_NAME_KEY)
        .unwrap_or("")
        .is_empty()
    {
        if let Some(role_name) = role_name.filter(|role| !role.is_empty()) {
            props.insert(REQUEST_CONTEXT_ROLE_NAME_KEY, role_name.clone());
        }
    }

    set_header(headers, REQUEST_CONTEXT_HEADER, &props.serialize());
}

/// Correlation data decoded from a dependency's response headers.
#[derive(Debug)]
pub struct CorrelationResponseHeaders {
    pub properties: CorrelationProperties,
    pub app_id: String,
    pub role_name: String,
}

/// Decodes the callee's identity from dependency response headers.
pub fn parse_response_headers(headers: &HeaderMap) -> CorrelationResponseHeaders {
    let properties = CorrelationProperties::parse(header(headers, REQUEST_CONTEXT_HEADER));
    let app_id = properties
        .get(REQUEST_CONTEXT_APP_ID_KEY)
        .unwrap_or("")
        .to_string();
    let role_name = properties
        .get(REQUEST_CONTEXT_ROLE_NAME_KEY)
        .unwrap_or("")
        .to_string();

    CorrelationResponseHeaders {
        properties,
        app_id,
        role_name,
    }
}

impl CorrelationResponseHeaders {
    /// Formats the Target field for dependency telemetry.
    pub fn target(&self, host: &str) -> String {
        format!("{host} | {} | roleName:{}", self.app_id, self.role_name)
    }
}

/// Writes this service's own identity onto an inbound request's response so
/// the caller can correlate its dependency telemetry back to us.
pub fn set_response_headers(headers: &mut HeaderMap, operation: &Operation) {
    let mut props = CorrelationProperties::new();
    props.insert(REQUEST_CONTEXT_APP_ID_KEY, operation.correlation_id());
    if let Some(role) = operation.context().tags().get(tags::CLOUD_ROLE) {
        props.insert(REQUEST_CONTEXT_ROLE_NAME_KEY, role.clone());
    }

    set_header(headers, REQUEST_CONTEXT_HEADER, &props.serialize());
}
