//! Error types for the intake engine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Widget error: {0}")]
    Widget(#[from] WidgetError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),
}

/// Configuration-related errors. Fatal at startup: no useful session can
/// start without valid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// All stages are complete; there is no current stage.
    #[error("Intake already complete: no current stage")]
    OutOfRange,

    /// `jump_to` may only rewind. Forward movement goes through `advance`.
    #[error("Cannot jump forward from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),
}

/// Agent channel errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Agent connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Agent connect failed: {0}")]
    ConnectFailed(String),

    #[error("Agent channel closed: {0}")]
    Closed(String),

    #[error("Invalid agent endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Widget validation errors. These never escape the submission path as a
/// session failure; the UI rejects the submit client-side.
#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error("Unknown widget: {0}")]
    UnknownWidget(String),

    #[error("Widget {widget} is missing required field {field}")]
    MissingField { widget: String, field: String },

    #[error("Widget {widget} field {field} is invalid: {reason}")]
    InvalidField {
        widget: String,
        field: String,
        reason: String,
    },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Save failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Payment gateway errors. Provider payloads are passed through unmodified.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment request failed: {0}")]
    Http(String),

    #[error("Payment provider error (HTTP {status}): {payload}")]
    Provider { status: u16, payload: String },

    #[error("Invalid payment provider response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for the intake engine.
pub type Result<T> = std::result::Result<T, Error>;
