//! Correlation context propagated alongside an operation.

use std::collections::HashMap;

use crate::operation_id::OperationId;

/// Custom properties carried in correlation headers.
///
/// Keys and values must not contain `,` or `=`; entries that do are dropped
/// during serialization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrelationProperties(HashMap<String, String>);

impl CorrelationProperties {
    pub fn new() -> Self {
        CorrelationProperties(HashMap::new())
    }

    /// Parses a comma-separated `k=v` header value. Whitespace around keys
    /// and values is trimmed; entries without `=` are ignored.
    pub fn parse(header: &str) -> Self {
        let mut result = HashMap::new();
        for entry in header.split(',') {
            if let Some((key, value)) = entry.split_once('=') {
                result.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        CorrelationProperties(result)
    }

    /// Serializes the properties back into a `k=v,k=v` header value.
    ///
    /// Entries whose key or value contains a reserved separator are dropped
    /// with a diagnostic rather than corrupting the header.
    pub fn serialize(&self) -> String {
        let mut result = String::new();
        for (key, value) in &self.0 {
            if key.contains([',', '=']) || value.contains([',', '=']) {
                tracing::warn!(
                    %key,
                    "correlation properties must not contain '=' or ','; dropping entry"
                );
                continue;
            }

            if !result.is_empty() {
                result.push(',');
            }
            result.push_str(key);
            result.push('=');
            result.push_str(value);
        }

        result
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The correlation identity of one operation: its name, id, parent id, and
/// the custom property bag to propagate downstream.
///
/// Immutable once built; owned by the operation it describes.
#[derive(Clone, Debug, Default)]
pub struct CorrelationContext {
    pub name: String,
    pub id: OperationId,
    pub parent_id: OperationId,
    pub properties: CorrelationProperties,
}

impl CorrelationContext {
    /// Builds a correlation context, generating an id if none is supplied and
    /// defaulting the parent id to the id itself.
    pub fn new(
        id: OperationId,
        parent_id: OperationId,
        name: impl Into<String>,
        properties: CorrelationProperties,
    ) -> Self {
        let id = if id.is_empty() { OperationId::new() } else { id };
        let parent_id = if parent_id.is_empty() { id.clone() } else { parent_id };

        CorrelationContext {
            name: name.into(),
            id,
            parent_id,
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    fn parse_data() -> Vec<(&'static str, Vec<(&'static str, &'static str)>)> {
        vec![
            ("", vec![]),
            ("a=b", vec![("a", "b")]),
            ("a=b,c=d", vec![("a", "b"), ("c", "d")]),
            ("a = b , c =d ", vec![("a", "b"), ("c", "d")]),
            ("a=b,malformed,c=d", vec![("a", "b"), ("c", "d")]),
            ("a=b=c", vec![("a", "b=c")]),
            ("a=", vec![("a", "")]),
        ]
    }

    #[test]
    fn parse_properties() {
        for (header, entries) in parse_data() {
            let props = CorrelationProperties::parse(header);
            assert_eq!(props.iter().count(), entries.len(), "parse({header:?})");
            for (key, value) in entries {
                assert_eq!(props.get(key), Some(value), "parse({header:?})[{key}]");
            }
        }
    }

    #[test]
    fn serialize_round_trips() {
        let props = CorrelationProperties::parse("a=b,c=d,e=f");
        assert_eq!(CorrelationProperties::parse(&props.serialize()), props);
    }

    #[test]
    fn serialize_drops_reserved_characters() {
        let mut props = CorrelationProperties::new();
        props.insert("ok", "fine");
        props.insert("bad,key", "v");
        props.insert("k", "bad=value");
        assert_eq!(props.serialize(), "ok=fine");
    }

    #[test]
    fn context_defaults() {
        let cx = CorrelationContext::new(
            OperationId::default(),
            OperationId::default(),
            "GET /",
            CorrelationProperties::new(),
        );
        assert!(!cx.id.is_empty());
        assert_eq!(cx.parent_id, cx.id);

        let cx = CorrelationContext::new(
            OperationId::from("|a."),
            OperationId::default(),
            "GET /",
            CorrelationProperties::new(),
        );
        assert_eq!(cx.parent_id.as_str(), "|a.");
    }
}
