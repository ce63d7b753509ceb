//! Shared error types for the bridge.

use thiserror::Error;

/// Top-level error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The transport could not bind or initialize. Fatal to the start attempt.
    #[error("Start failed: {0}")]
    Start(String),

    /// A single element or segment failed to map. Logged and skipped, never propagated.
    #[error("Translation failed for '{kind}': {reason}")]
    Translation {
        /// Element or segment type tag.
        kind: String,
        /// Why it failed.
        reason: String,
    },

    /// The dispatch collaborator failed.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// A platform call failed.
    #[error("Operation '{action}' failed: {reason}")]
    Operation {
        /// The platform action that failed.
        action: String,
        /// Why it failed.
        reason: String,
    },

    /// A teardown step failed.
    #[error("Shutdown step '{step}' failed: {reason}")]
    ShutdownStep {
        /// The phase that failed.
        step: String,
        /// Why it failed.
        reason: String,
    },

    /// The adapter is in the wrong lifecycle state for the requested call.
    #[error("Adapter is in invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        /// Current lifecycle state.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// A chat address string could not be parsed.
    #[error("Invalid chat address: {0}")]
    InvalidAddress(String),

    /// The event filter rule file is malformed.
    #[error("Filter rules error: {0}")]
    Filter(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Alias for Result with BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
