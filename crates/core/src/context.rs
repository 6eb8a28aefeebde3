//! Per-request context passed explicitly through every vault operation.

use crate::ids::OwnerId;
use uuid::Uuid;

/// Maximum length of a caller-supplied trace ID.
pub const MAX_TRACE_ID_LEN: usize = 128;

/// Correlates log lines and activity records belonging to one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a caller-provided value.
    /// The value is truncated to MAX_TRACE_ID_LEN characters and non-printable
    /// characters are removed; an empty result falls back to a random ID.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    /// Get the trace ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the caller of a vault operation.
///
/// The authentication layer builds this once per request; the engine never
/// looks identity up from ambient state.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// The authenticated owner on whose behalf the operation runs.
    pub owner_id: OwnerId,
    /// Trace ID for log correlation.
    pub trace_id: TraceId,
}

impl RequestContext {
    /// Context with a freshly generated trace ID.
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            trace_id: TraceId::new(),
        }
    }

    /// Context carrying a caller-supplied trace ID.
    pub fn with_trace_id(owner_id: OwnerId, trace_id: TraceId) -> Self {
        Self { owner_id, trace_id }
    }
}
