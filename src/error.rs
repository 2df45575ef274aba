//! Error types for the reactive messaging core

use thiserror::Error;

/// Errors that can occur anywhere in the event bus, store, or plugins
#[derive(Debug, Error)]
pub enum EventError {
    /// Malformed input: empty event type, missing required field, duplicate
    /// extension id, dependency cycle, missing dependency, unknown route on
    /// update, etc.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown aggregate, route, extension, or command handler id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure when appending aggregate events.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The underlying event store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An extension hook failed at `event.beforePublish`.
    #[error("Hook error: {0}")]
    Hook(String),

    /// A subscriber handler failed. Never surfaced from `publish` — logged
    /// and swallowed — but kept as a distinct variant for tests and for
    /// handlers that want to report structured failures to themselves.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Misconfiguration of the bus, extension system, or a plugin.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for event operations
pub type Result<T> = std::result::Result<T, EventError>;
