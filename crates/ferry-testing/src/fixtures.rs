//! Event fixtures.

use ferry_core::OutboxEntry;
use serde_json::json;

/// Topic used by customer fixtures.
pub const CUSTOMER_TOPIC: &str = "stream.customer.record";

/// Entry for a newly created customer.
pub fn customer_created(id: i64) -> OutboxEntry {
    OutboxEntry::new(CUSTOMER_TOPIC, "customer.created")
        .record_id(id)
        .after(&json!({ "id": id, "name": format!("customer-{id}"), "tier": "standard" }))
}

/// Entry for a customer whose tier changed.
pub fn customer_updated(id: i64, from_tier: &str, to_tier: &str) -> OutboxEntry {
    OutboxEntry::new(CUSTOMER_TOPIC, "customer.updated")
        .record_id(id)
        .before(&json!({ "id": id, "tier": from_tier }))
        .after(&json!({ "id": id, "tier": to_tier }))
}

/// Serialized envelope for a created customer.
pub fn customer_created_payload(id: i64) -> Vec<u8> {
    customer_created(id).payload()
}

/// Bytes that are not well-formed JSON.
pub fn malformed_payload() -> Vec<u8> {
    b"{\"type\": \"customer.created\", \"recordId\": ".to_vec()
}
