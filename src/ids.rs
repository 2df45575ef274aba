//! Id and time helpers shared across the crate
//!
//! Generated event/subscription ids follow an `evt-<uuid>`/`sub-<uuid>`
//! convention; `now_millis` gives Unix-millisecond timestamps.

/// Current time in Unix milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a new event id (`evt-<uuid>`)
pub fn new_event_id() -> String {
    format!("evt-{}", uuid::Uuid::new_v4())
}

/// Generate a new subscription id (`sub-<uuid>`)
pub fn new_subscription_id() -> String {
    format!("sub-{}", uuid::Uuid::new_v4())
}
