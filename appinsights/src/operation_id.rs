//! Hierarchical operation identifiers.
//!
//! An operation id is an opaque string of the form `|<root>.<segment>_...`:
//! a high-entropy root wrapped in a leading `|` and trailing `.`, followed by
//! child segments appended with `.` (structural children) or `_`
//! (request-scoped children). The total length is bounded; appending past the
//! bound truncates at the nearest structural boundary and closes the id with
//! a random overflow token, or re-roots the chain entirely when no boundary
//! survives.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use uuid::Uuid;

/// The longest allowed operation id.
const MAX_OPERATION_ID_LENGTH: usize = 1024;

/// Space reserved when truncating: 8 hex digits plus the `#` terminator.
const OVERFLOW_SUFFIX_LENGTH: usize = 9;

/// A specially-formatted string that identifies an operation within a
/// distributed trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct OperationId(String);

impl OperationId {
    /// Creates a new, random root operation id.
    pub fn new() -> Self {
        OperationId(format!("|{}.", Uuid::new_v4()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the root of this id: the substring between the optional
    /// leading `|` and the first `.`, or the rest of the string if there is
    /// no `.`.
    pub fn get_root(&self) -> OperationId {
        let id = self.0.as_str();
        let end = id.find('.').unwrap_or(id.len());
        let start = usize::from(id.starts_with('|'));
        OperationId(id[start..end].to_string())
    }

    /// Appends `suffix` and `delimiter` to this id.
    ///
    /// When the combined id would exceed the maximum length, the id is
    /// truncated at the nearest `.` or `_` boundary and closed with an
    /// 8-hex-digit overflow token terminated by `#`. When no boundary exists
    /// in the truncated region, a brand-new root id is returned instead.
    pub fn append_suffix(&self, suffix: &str, delimiter: &str) -> OperationId {
        let id = self.0.as_str();
        if id.len() + suffix.len() + delimiter.len() <= MAX_OPERATION_ID_LENGTH {
            return OperationId(format!("{id}{suffix}{delimiter}"));
        }

        let mut x = MAX_OPERATION_ID_LENGTH - OVERFLOW_SUFFIX_LENGTH;
        if id.len() > x {
            while x > 1 {
                let c = id.as_bytes()[x - 1];
                if c == b'.' || c == b'_' {
                    break;
                }
                x -= 1;
            }
        } else {
            // Oversized suffix against a short id; keep whatever fits.
            x = id.len();
        }

        if x <= 1 {
            return OperationId::new();
        }

        OperationId(format!("{}{:08x}#", &id[..x], rand::random::<u32>()))
    }

    /// Returns a sampling hash code in `[0.0, 100.0)` for this id.
    ///
    /// The algorithm (djb2 with `+`, 32-bit wrapping, short inputs doubled to
    /// at least 8 characters) is shared across SDKs; changing any constant
    /// here breaks cross-service sampling consistency.
    pub fn hash(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }

        let mut id = self.0.clone();
        while id.len() < 8 {
            let copy = id.clone();
            id.push_str(&copy);
        }

        let mut hash: i32 = 5381;
        for c in id.chars() {
            hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(c as i32);
        }

        if hash == i32::MIN {
            hash = i32::MAX;
        }

        (f64::from(hash).abs() / f64::from(i32::MAX)) * 100.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        OperationId(value)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        OperationId(value.to_string())
    }
}

/// Owns the monotonically increasing counters used to derive child
/// identifiers.
///
/// One instance is shared per telemetry client; concurrent callers never
/// observe the same counter value.
#[derive(Debug)]
pub struct IdGenerator {
    next_request: AtomicU32,
    next_dependency: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator {
            next_request: AtomicU32::new(rand::random::<u32>()),
            next_dependency: AtomicU64::new(0),
        }
    }

    /// Generates a request id parented on `parent`, or a fresh root id when
    /// `parent` is empty.
    pub fn request_id(&self, parent: &OperationId) -> OperationId {
        if parent.is_empty() {
            return OperationId::new();
        }

        let mut id = parent.as_str().to_string();
        if !id.starts_with('|') {
            id.insert(0, '|');
        }
        if !id.ends_with('.') {
            id.push('.');
        }

        let suffix = self.next_request.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        OperationId(id).append_suffix(&format!("{suffix:x}"), "_")
    }

    /// Returns the next dependency sequence number, used as the suffix of
    /// outbound child identifiers.
    pub fn next_dependency_suffix(&self) -> String {
        let value = self.next_dependency.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        value.to_string()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
