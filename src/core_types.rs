//! Identifier generation
//!
//! Every persisted row is keyed by an opaque string id with a documented
//! prefix: `ord` (orders), `os` (slices), `exec` (executions), `evt` (broker
//! events), `t` (traces), `r` (requests). The format is
//! `<prefix><unix-seconds><12 lowercase hex chars>`; nothing downstream parses
//! these beyond uniqueness. Attempt ids use `attempt-<uuid4>` so a single
//! execution attempt can be correlated across broker events.

use std::time::{SystemTime, UNIX_EPOCH};

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build a prefixed id: prefix + unix seconds + 12 hex chars of entropy.
fn prefixed_id(prefix: &str) -> String {
    let suffix = rand::random::<u64>() & 0xffff_ffff_ffff;
    format!("{}{}{:012x}", prefix, unix_seconds(), suffix)
}

/// Generate a parent order id, e.g. `ord1735228800a1b2c3d4e5f6`.
pub fn generate_order_id() -> String {
    prefixed_id("ord")
}

/// Generate an order slice id, e.g. `os1735228800a1b2c3d4e5f6`.
pub fn generate_slice_id() -> String {
    prefixed_id("os")
}

/// Generate an execution id, e.g. `exec1735228800a1b2c3d4e5f6`.
pub fn generate_execution_id() -> String {
    prefixed_id("exec")
}

/// Generate a broker event id, e.g. `evt1735228800a1b2c3d4e5f6`.
pub fn generate_event_id() -> String {
    prefixed_id("evt")
}

/// Generate a trace id, e.g. `t1735228800a1b2c3d4e5f6`.
pub fn generate_trace_id() -> String {
    prefixed_id("t")
}

/// Generate a request id, e.g. `r1735228800f6e5d4c3b2a1`.
pub fn generate_request_id() -> String {
    prefixed_id("r")
}

/// Generate an attempt id, e.g.
/// `attempt-550e8400-e29b-41d4-a716-446655440000`.
pub fn generate_attempt_id() -> String {
    format!("attempt-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_prefixed(id: &str, prefix: &str) {
        assert!(id.starts_with(prefix), "{} should start with {}", id, prefix);
        let rest = &id[prefix.len()..];
        // 10-digit unix seconds followed by 12 hex chars
        assert_eq!(rest.len(), 22, "unexpected length for {}", id);
        assert!(rest[..10].chars().all(|c| c.is_ascii_digit()));
        assert!(rest[10..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_id_formats() {
        check_prefixed(&generate_order_id(), "ord");
        check_prefixed(&generate_slice_id(), "os");
        check_prefixed(&generate_execution_id(), "exec");
        check_prefixed(&generate_event_id(), "evt");
        check_prefixed(&generate_trace_id(), "t");
        check_prefixed(&generate_request_id(), "r");
    }

    #[test]
    fn test_attempt_id_format() {
        let id = generate_attempt_id();
        assert!(id.starts_with("attempt-"));
        assert_eq!(id.len(), "attempt-".len() + 36);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = generate_order_id();
        let b = generate_order_id();
        assert_ne!(a, b);
    }
}
