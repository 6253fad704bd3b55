//! Request context for tracing and audit
//!
//! An immutable value passed explicitly into every store, broker, and log
//! call. There is no thread-local or global "current request": background
//! workers generate a fresh context at the top of each iteration, and slices
//! inherit the origin fields of their parent order so the whole lifecycle of
//! an order can be stitched together from the audit tables.

use crate::core_types::{generate_request_id, generate_trace_id};

/// Immutable tracing context.
///
/// - `trace_id` / `trace_source`: where the overall trace originated.
/// - `request_id` / `request_source`: the request being served right now.
/// - `span_source`: the call path, used in logs only (never persisted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: String,
    pub trace_source: String,
    pub request_id: String,
    pub request_source: String,
    pub span_source: String,
}

impl RequestContext {
    pub fn new(
        trace_id: String,
        trace_source: String,
        request_id: String,
        request_source: String,
        span_source: String,
    ) -> Self {
        Self {
            trace_id,
            trace_source,
            request_id,
            request_source,
            span_source,
        }
    }

    /// Fresh context for one background-worker iteration.
    ///
    /// All sources are set to `PULSE_BACKGROUND:<worker_name>`.
    pub fn for_worker(worker_name: &str) -> Self {
        let source = format!("PULSE_BACKGROUND:{}", worker_name);
        Self {
            trace_id: generate_trace_id(),
            trace_source: source.clone(),
            request_id: generate_request_id(),
            request_source: source.clone(),
            span_source: source,
        }
    }

    /// Context that carries a parent order's origin fields, used when a
    /// worker acts on behalf of an order rather than on its own schedule.
    pub fn inherited(
        trace_id: &str,
        trace_source: &str,
        request_id: &str,
        request_source: &str,
        span_source: &str,
    ) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            trace_source: trace_source.to_string(),
            request_id: request_id.to_string(),
            request_source: request_source.to_string(),
            span_source: span_source.to_string(),
        }
    }
}

/// Check the `t<10 digits><12 hex>` trace id shape.
pub fn is_valid_trace_id(trace_id: &str) -> bool {
    has_prefixed_shape(trace_id, 't')
}

/// Check the `r<10 digits><12 hex>` request id shape.
pub fn is_valid_request_id(request_id: &str) -> bool {
    has_prefixed_shape(request_id, 'r')
}

fn has_prefixed_shape(id: &str, prefix: char) -> bool {
    let mut chars = id.chars();
    if chars.next() != Some(prefix) {
        return false;
    }
    let rest: Vec<char> = chars.collect();
    rest.len() == 22
        && rest[..10].iter().all(|c| c.is_ascii_digit())
        && rest[10..]
            .iter()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_worker_sources() {
        let ctx = RequestContext::for_worker("splitting_worker");
        assert_eq!(ctx.trace_source, "PULSE_BACKGROUND:splitting_worker");
        assert_eq!(ctx.request_source, "PULSE_BACKGROUND:splitting_worker");
        assert_eq!(ctx.span_source, "PULSE_BACKGROUND:splitting_worker");
        assert!(is_valid_trace_id(&ctx.trace_id));
        assert!(is_valid_request_id(&ctx.request_id));
    }

    #[test]
    fn test_generated_ids_validate() {
        assert!(is_valid_trace_id(&generate_trace_id()));
        assert!(is_valid_request_id(&generate_request_id()));
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert!(!is_valid_trace_id("x1735228800a1b2c3d4e5f6"));
        assert!(!is_valid_trace_id("t1735228800"));
        assert!(!is_valid_trace_id(""));
        assert!(!is_valid_request_id("t1735228800a1b2c3d4e5f6"));
        // uppercase hex is not produced by the generator
        assert!(!is_valid_trace_id("t1735228800A1B2C3D4E5F6"));
    }

    #[test]
    fn test_inherited_copies_origin() {
        let ctx = RequestContext::inherited(
            "t1735228800a1b2c3d4e5f6",
            "GAPI:/api/orders",
            "r1735228800f6e5d4c3b2a1",
            "GAPI:/api/orders",
            "PULSE_BACKGROUND:splitting_worker",
        );
        assert_eq!(ctx.trace_id, "t1735228800a1b2c3d4e5f6");
        assert_eq!(ctx.span_source, "PULSE_BACKGROUND:splitting_worker");
    }
}
